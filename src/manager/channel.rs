//! Remote channels: a FIFO hosted on a worker, operated via RPC.
//!
//! The channel id is reserved from the worker handle's correlation counter,
//! so it names exactly one entry in the worker-side registry. Every
//! operation re-enters the worker; the channel adds no buffering or flow
//! control of its own beyond the FIFO's capacity.

use serde_json::{json, Value};

use super::Worker;
use crate::error::Result;

/// Handle to a FIFO living in a worker's channel registry.
pub struct RemoteChannel {
    worker: Worker,
    id: u64,
}

impl RemoteChannel {
    /// Create a bounded FIFO on the worker.
    pub fn new(worker: &Worker, capacity: usize) -> Result<Self> {
        let id = worker.reserve_id();
        worker.call_wait("channel.new", vec![json!(id), json!(capacity)])?;
        Ok(Self {
            worker: worker.clone(),
            id,
        })
    }

    /// Registry id of this channel.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Append a value, blocking while the FIFO is full.
    pub fn put(&self, value: Value) -> Result<()> {
        self.worker
            .call_wait("channel.put", vec![json!(self.id), value])
    }

    /// Remove and return the oldest value, blocking while the FIFO is empty.
    pub fn take(&self) -> Result<Value> {
        self.worker.call_fetch("channel.take", vec![json!(self.id)])
    }

    /// Whether a value is buffered right now.
    pub fn ready(&self) -> Result<bool> {
        let value = self
            .worker
            .call_fetch("channel.ready", vec![json!(self.id)])?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Block until a value is buffered, without consuming it.
    pub fn wait(&self) -> Result<()> {
        self.worker.call_wait("channel.wait", vec![json!(self.id)])
    }

    /// Evict the FIFO from the worker-side registry, waking any blocked
    /// producers and consumers over there.
    pub fn close(&self) -> Result<()> {
        self.worker
            .call_wait("channel.close", vec![json!(self.id)])
    }
}

impl Drop for RemoteChannel {
    fn drop(&mut self) {
        // Best effort: evict the worker-side entry so the registry does not
        // accumulate dead FIFOs. Failures are dropped with the cast.
        let _ = self.worker.call_do("channel.close", vec![json!(self.id)]);
    }
}

impl std::fmt::Debug for RemoteChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteChannel")
            .field("id", &self.id)
            .field("worker", &self.worker)
            .finish()
    }
}
