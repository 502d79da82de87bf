//! Synchronization primitives for the worker runtime.
//!
//! Hosts the bounded FIFOs behind remote channels, the process-wide channel
//! registry, and the counting semaphore backing the `--threads` cap.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::protocol::RemoteError;

/// How often blocked channel operations re-check their cancellation token.
const CANCEL_POLL_TICK: Duration = Duration::from_millis(25);

/// A bounded FIFO with blocking `put`/`take`.
///
/// Operations take a cancellation probe so a blocked worker task stays
/// interruptible: waits are chopped into short timed slices and the probe is
/// consulted between slices.
pub struct Fifo {
    capacity: usize,
    state: Mutex<FifoState>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct FifoState {
    queue: VecDeque<Value>,
    closed: bool,
}

impl Fifo {
    /// Create a FIFO holding at most `capacity` values. A capacity of zero is
    /// clamped to one slot.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(FifoState {
                queue: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Append a value, blocking while the FIFO is full.
    pub fn put<F>(&self, value: Value, cancelled: F) -> Result<(), RemoteError>
    where
        F: Fn() -> bool,
    {
        let mut state = self.state.lock().expect("fifo mutex poisoned");
        loop {
            if state.closed {
                return Err(RemoteError::new(RemoteError::CHANNEL, "channel is closed"));
            }
            if state.queue.len() < self.capacity {
                state.queue.push_back(value);
                self.not_empty.notify_one();
                return Ok(());
            }
            if cancelled() {
                return Err(RemoteError::interrupted());
            }
            let (next, _timeout) = self
                .not_full
                .wait_timeout(state, CANCEL_POLL_TICK)
                .expect("fifo mutex poisoned");
            state = next;
        }
    }

    /// Remove and return the oldest value, blocking while the FIFO is empty.
    /// Values buffered before a close are still drained.
    pub fn take<F>(&self, cancelled: F) -> Result<Value, RemoteError>
    where
        F: Fn() -> bool,
    {
        let mut state = self.state.lock().expect("fifo mutex poisoned");
        loop {
            if let Some(value) = state.queue.pop_front() {
                self.not_full.notify_one();
                return Ok(value);
            }
            if state.closed {
                return Err(RemoteError::new(RemoteError::CHANNEL, "channel is closed"));
            }
            if cancelled() {
                return Err(RemoteError::interrupted());
            }
            let (next, _timeout) = self
                .not_empty
                .wait_timeout(state, CANCEL_POLL_TICK)
                .expect("fifo mutex poisoned");
            state = next;
        }
    }

    /// True when at least one value is buffered.
    pub fn ready(&self) -> bool {
        !self
            .state
            .lock()
            .expect("fifo mutex poisoned")
            .queue
            .is_empty()
    }

    /// Block until a value is buffered, without consuming it.
    pub fn wait_ready<F>(&self, cancelled: F) -> Result<(), RemoteError>
    where
        F: Fn() -> bool,
    {
        let mut state = self.state.lock().expect("fifo mutex poisoned");
        loop {
            if !state.queue.is_empty() {
                return Ok(());
            }
            if state.closed {
                return Err(RemoteError::new(RemoteError::CHANNEL, "channel is closed"));
            }
            if cancelled() {
                return Err(RemoteError::interrupted());
            }
            let (next, _timeout) = self
                .not_empty
                .wait_timeout(state, CANCEL_POLL_TICK)
                .expect("fifo mutex poisoned");
            state = next;
        }
    }

    /// Close the FIFO, waking all blocked producers and consumers.
    pub fn close(&self) {
        self.state.lock().expect("fifo mutex poisoned").closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// Process-wide registry of remote-channel FIFOs, keyed by the id the
/// manager reserved from its correlation counter.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<u64, Arc<Fifo>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, id: u64, capacity: usize) -> Result<(), RemoteError> {
        let mut channels = self.channels.lock().expect("channel registry poisoned");
        if channels.contains_key(&id) {
            return Err(RemoteError::new(
                RemoteError::CHANNEL,
                format!("channel {} already exists", id),
            ));
        }
        channels.insert(id, Arc::new(Fifo::bounded(capacity)));
        Ok(())
    }

    pub fn get(&self, id: u64) -> Result<Arc<Fifo>, RemoteError> {
        self.channels
            .lock()
            .expect("channel registry poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| {
                RemoteError::new(RemoteError::CHANNEL, format!("no channel with id {}", id))
            })
    }

    /// Evict and close a channel. Returns whether it existed.
    pub fn close(&self, id: u64) -> bool {
        let removed = self
            .channels
            .lock()
            .expect("channel registry poisoned")
            .remove(&id);
        match removed {
            Some(fifo) => {
                fifo.close();
                true
            }
            None => false,
        }
    }
}

/// Counting semaphore capping concurrent evaluation threads.
///
/// Permits are acquired inside the spawned call threads, never by the
/// dispatch loop, so frame reading is never blocked by the cap.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Block until a permit is free, then hold it for the guard's lifetime.
    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        let mut permits = self.permits.lock().expect("semaphore mutex poisoned");
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .expect("semaphore mutex poisoned");
        }
        *permits -= 1;
        SemaphoreGuard { semaphore: self }
    }

    fn release(&self) {
        *self.permits.lock().expect("semaphore mutex poisoned") += 1;
        self.available.notify_one();
    }
}

/// RAII permit returned by [`Semaphore::acquire`].
pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    fn never() -> bool {
        false
    }

    #[test]
    fn test_fifo_put_take_order() {
        let fifo = Fifo::bounded(4);
        for i in 0..4 {
            fifo.put(json!(i), never).unwrap();
        }
        for i in 0..4 {
            assert_eq!(fifo.take(never).unwrap(), json!(i));
        }
        assert!(!fifo.ready());
    }

    #[test]
    fn test_fifo_blocks_when_full() {
        let fifo = Arc::new(Fifo::bounded(1));
        fifo.put(json!(1), never).unwrap();

        let producer = {
            let fifo = fifo.clone();
            thread::spawn(move || {
                let started = Instant::now();
                fifo.put(json!(2), never).unwrap();
                started.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert_eq!(fifo.take(never).unwrap(), json!(1));
        let blocked_for = producer.join().unwrap();
        assert!(blocked_for >= Duration::from_millis(50));
        assert_eq!(fifo.take(never).unwrap(), json!(2));
    }

    #[test]
    fn test_fifo_cross_thread_sequence() {
        let fifo = Arc::new(Fifo::bounded(3));
        let consumer = {
            let fifo = fifo.clone();
            thread::spawn(move || {
                (0..20)
                    .map(|_| fifo.take(never).unwrap())
                    .collect::<Vec<_>>()
            })
        };
        for i in 0..20 {
            fifo.put(json!(i), never).unwrap();
        }
        let taken = consumer.join().unwrap();
        let expected: Vec<Value> = (0..20).map(|i| json!(i)).collect();
        assert_eq!(taken, expected);
    }

    #[test]
    fn test_fifo_cancelled_take() {
        let cancelled = AtomicBool::new(false);
        let fifo = Fifo::bounded(1);

        // Flip the flag from another thread while take is blocked.
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(80));
                cancelled.store(true, Ordering::Relaxed);
            });
            let err = fifo
                .take(|| cancelled.load(Ordering::Relaxed))
                .unwrap_err();
            assert!(err.is_interrupt());
        });
    }

    #[test]
    fn test_fifo_close_wakes_taker() {
        let fifo = Arc::new(Fifo::bounded(1));
        let taker = {
            let fifo = fifo.clone();
            thread::spawn(move || fifo.take(never))
        };
        thread::sleep(Duration::from_millis(50));
        fifo.close();
        assert!(taker.join().unwrap().is_err());
    }

    #[test]
    fn test_fifo_close_drains_buffered() {
        let fifo = Fifo::bounded(2);
        fifo.put(json!("a"), never).unwrap();
        fifo.close();
        assert_eq!(fifo.take(never).unwrap(), json!("a"));
        assert!(fifo.take(never).is_err());
    }

    #[test]
    fn test_channel_registry() {
        let registry = ChannelRegistry::new();
        registry.create(5, 2).unwrap();
        assert!(registry.create(5, 2).is_err());
        assert!(registry.get(5).is_ok());
        assert!(registry.get(6).is_err());
        assert!(registry.close(5));
        assert!(!registry.close(5));
        assert!(registry.get(5).is_err());
    }

    #[test]
    fn test_semaphore_caps_concurrency() {
        let semaphore = Arc::new(Semaphore::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let semaphore = semaphore.clone();
                let running = running.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    let _permit = semaphore.acquire();
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
