//! Manager-side worker handle.
//!
//! A [`Worker`] owns one child process and the TCP connection to it. Sends
//! may come from any thread; a single dedicated receive thread reads reply
//! frames and routes each into the capacity-1 sink installed for its
//! correlation id. Dropping the last handle stops the child, escalating to
//! kill if it lingers.
//!
//! # Architecture
//!
//! ```text
//!   caller threads                         receive thread
//!        │                                       │
//!        │ lock ─► id, sink, write frame         │ read frame
//!        ▼                                       ▼
//!   ┌──────────┐    TCP     ┌────────┐    ┌─────────────┐
//!   │ SendState ├──────────►│ worker │───►│ pending map │─► sink ─► waiter
//!   └──────────┘            └────────┘    └─────────────┘
//! ```
//!
//! Replies for distinct ids may complete in any order; each id gets exactly
//! one reply.

mod channel;
mod spawn;

pub use channel::RemoteChannel;
pub use spawn::SpawnOptions;

use std::collections::HashMap;
use std::net::TcpStream;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::codec::{FrameReader, FrameWriter, RawFrame};
use crate::error::{Result, SkiffError};
use crate::protocol::{CallRequest, FrameKind, RemoteError, WorkerResult, NO_REPLY_ID};

/// Grace period after a transport failure before force-killing the child.
const TRANSPORT_GRACE: Duration = Duration::from_millis(250);

/// Poll interval for [`Worker::wait_for_exit`].
const EXIT_POLL_TICK: Duration = Duration::from_millis(10);

type PendingMap = Arc<Mutex<HashMap<u64, SyncSender<WorkerResult>>>>;

/// Write half of the connection plus the correlation counter. Holding both
/// behind one lock makes id allocation, sink installation, and the wire
/// write a single critical section, so a reply can never beat its sink.
struct SendState {
    writer: FrameWriter<TcpStream>,
    next_id: u64,
}

struct WorkerInner {
    child: Arc<Mutex<Child>>,
    pid: u32,
    port: u16,
    send: Mutex<SendState>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
    stop_grace: Duration,
}

/// Handle to a worker subprocess. Cheap to clone; the child is stopped when
/// the last clone is dropped.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

/// A call in flight. `fetch` blocks until the reply arrives and rethrows
/// remote failures; `wait` discards the value.
pub struct RemoteCall {
    id: u64,
    receiver: Receiver<WorkerResult>,
}

impl RemoteCall {
    /// Correlation id of this call.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block for the reply and return the value.
    pub fn fetch(self) -> Result<Value> {
        match self.receiver.recv() {
            Ok(result) => result.into_result(),
            // The receive thread dropped the sink: the worker is gone.
            Err(_) => Err(SkiffError::TerminatedWorker),
        }
    }

    /// Block for the reply, discarding the value.
    pub fn wait(self) -> Result<()> {
        self.fetch().map(|_| ())
    }
}

impl Worker {
    /// Spawn a worker subprocess and connect to it.
    pub fn spawn(options: SpawnOptions) -> Result<Worker> {
        let mut spawned = spawn::spawn_worker(&options)?;
        let read_stream = match spawned.stream.try_clone() {
            Ok(stream) => stream,
            Err(e) => {
                let _ = spawned.child.kill();
                let _ = spawned.child.wait();
                return Err(e.into());
            }
        };
        let pid = spawned.child.id();

        let child = Arc::new(Mutex::new(spawned.child));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let recv_thread = {
            let pending = pending.clone();
            let alive = alive.clone();
            let child = child.clone();
            std::thread::Builder::new()
                .name(format!("worker-{}-recv", pid))
                .spawn(move || {
                    receive_loop(FrameReader::new(read_stream), pending, alive, child, pid)
                })
                .expect("failed to spawn receive thread")
        };

        Ok(Worker {
            inner: Arc::new(WorkerInner {
                child,
                pid,
                port: spawned.port,
                send: Mutex::new(SendState {
                    writer: FrameWriter::new(spawned.stream),
                    next_id: 1,
                }),
                pending,
                alive,
                recv_thread: Mutex::new(Some(recv_thread)),
                stop_grace: options.stop_grace,
            }),
        })
    }

    /// OS process id of the worker.
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// TCP port the worker is serving on.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Start a call; the returned handle resolves to the value.
    pub fn call(&self, function: &str, args: Vec<Value>) -> Result<RemoteCall> {
        self.start_call(CallRequest::new(function, args))
    }

    /// Start a call with named arguments.
    pub fn call_with(
        &self,
        function: &str,
        args: Vec<Value>,
        named: Map<String, Value>,
    ) -> Result<RemoteCall> {
        self.start_call(CallRequest::new(function, args).with_named(named))
    }

    /// Call and block for the value.
    pub fn call_fetch(&self, function: &str, args: Vec<Value>) -> Result<Value> {
        self.call(function, args)?.fetch()
    }

    /// Call and block for completion, discarding the value. The worker
    /// replies with the unit value, so large results never travel back.
    pub fn call_wait(&self, function: &str, args: Vec<Value>) -> Result<()> {
        self.start_call(CallRequest::new(function, args).discarding())?
            .wait()
    }

    /// Fire-and-forget call: no reply, no completion signal, failures
    /// dropped on the worker.
    pub fn call_do(&self, function: &str, args: Vec<Value>) -> Result<()> {
        let body = CallRequest::new(function, args).to_body()?;
        self.send_frame(FrameKind::Cast, &body, false)?;
        Ok(())
    }

    /// Start evaluating an expression in the worker's variable store.
    pub fn eval(&self, expr: &str) -> Result<RemoteCall> {
        self.call("env.eval", vec![Value::String(expr.to_string())])
    }

    /// Evaluate an expression and block for its value.
    pub fn eval_fetch(&self, expr: &str) -> Result<Value> {
        self.eval(expr)?.fetch()
    }

    /// Evaluate an expression and block for completion, discarding the value.
    pub fn eval_wait(&self, expr: &str) -> Result<()> {
        self.call_wait("env.eval", vec![Value::String(expr.to_string())])
    }

    /// Whether the worker process is still running.
    pub fn is_running(&self) -> bool {
        let mut child = self.inner.child.lock().expect("child lock poisoned");
        matches!(child.try_wait(), Ok(None))
    }

    /// Ask the worker to terminate itself cleanly. Returns whether a stop
    /// was issued, not whether it succeeded. Idempotent.
    pub fn stop(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.call_do("worker.exit", vec![]).is_ok()
    }

    /// Deliver an OS terminate signal to the worker.
    pub fn kill(&self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(self.inner.pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
                Err(e) => Err(SkiffError::Io(std::io::Error::from_raw_os_error(e as i32))),
            }
        }
        #[cfg(not(unix))]
        {
            let mut child = self.inner.child.lock().expect("child lock poisoned");
            child.kill().map_err(SkiffError::Io)
        }
    }

    /// Cancel the worker's most recently started call.
    ///
    /// On POSIX the interrupt is a SIGINT straight to the child; elsewhere it
    /// travels as a frame, since the OS cannot route the signal to the child
    /// on its own. Best-effort: a call that completes before the signal is
    /// observed loses the interrupt.
    pub fn interrupt(&self) -> Result<()> {
        if !self.is_running() {
            return Err(SkiffError::TerminatedWorker);
        }
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(self.inner.pid as i32), Signal::SIGINT) {
                Ok(()) => Ok(()),
                Err(nix::errno::Errno::ESRCH) => Err(SkiffError::TerminatedWorker),
                Err(e) => Err(SkiffError::Io(std::io::Error::from_raw_os_error(e as i32))),
            }
        }
        #[cfg(not(unix))]
        {
            self.send_frame(FrameKind::Interrupt, b"[]", false)?;
            Ok(())
        }
    }

    /// Poll until the worker exits or the timeout elapses. A timeout is an
    /// error; callers decide whether to escalate to [`Worker::kill`].
    pub fn wait_for_exit(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_running() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SkiffError::ExitTimeout(timeout));
            }
            std::thread::sleep(EXIT_POLL_TICK);
        }
    }

    /// Reserve a fresh id from the correlation counter without sending
    /// anything. Remote channels draw their registry keys from here so they
    /// can never collide with a call id.
    pub(crate) fn reserve_id(&self) -> u64 {
        let mut send = self.inner.send.lock().expect("send state poisoned");
        let id = send.next_id;
        send.next_id += 1;
        id
    }

    fn start_call(&self, request: CallRequest) -> Result<RemoteCall> {
        let body = request.to_body()?;
        let (id, receiver) = self
            .send_frame(FrameKind::Call, &body, true)?
            .expect("reply-expecting send returns a sink");
        Ok(RemoteCall { id, receiver })
    }

    /// Write one frame. For reply-expecting frames a fresh id is allocated
    /// and its sink installed before the frame reaches the wire; all other
    /// frames carry [`NO_REPLY_ID`].
    fn send_frame(
        &self,
        kind: FrameKind,
        body: &[u8],
        expect_reply: bool,
    ) -> Result<Option<(u64, Receiver<WorkerResult>)>> {
        if !self.inner.alive.load(Ordering::Relaxed) || !self.is_running() {
            return Err(SkiffError::TerminatedWorker);
        }

        let mut send = self.inner.send.lock().expect("send state poisoned");
        let reply = if expect_reply {
            let id = send.next_id;
            send.next_id += 1;
            let (tx, rx) = mpsc::sync_channel(1);
            self.inner
                .pending
                .lock()
                .expect("pending map poisoned")
                .insert(id, tx);
            Some((id, rx))
        } else {
            None
        };

        let id = reply.as_ref().map(|(id, _)| *id).unwrap_or(NO_REPLY_ID);
        if let Err(e) = send.writer.write_frame(kind as u8, id, body) {
            if reply.is_some() {
                self.inner
                    .pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&id);
            }
            return Err(e.into());
        }
        Ok(reply)
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.inner.pid)
            .field("port", &self.inner.port)
            .field("alive", &self.inner.alive.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        let exited = matches!(
            self.child
                .lock()
                .expect("child lock poisoned")
                .try_wait(),
            Ok(Some(_))
        );

        if !exited {
            // Ask nicely first.
            if let Ok(body) = CallRequest::new("worker.exit", vec![]).to_body() {
                let mut send = self.send.lock().expect("send state poisoned");
                let _ = send.writer.write_frame(FrameKind::Cast as u8, NO_REPLY_ID, &body);
            }

            let deadline = Instant::now() + self.stop_grace;
            let mut gone = false;
            while Instant::now() < deadline {
                if matches!(
                    self.child.lock().expect("child lock poisoned").try_wait(),
                    Ok(Some(_))
                ) {
                    gone = true;
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            if !gone {
                tracing::debug!(pid = self.pid, "worker ignored stop request, escalating");
                let mut child = self.child.lock().expect("child lock poisoned");
                terminate_child(&mut child);
            }
        }

        self.alive.store(false, Ordering::Relaxed);
        // The socket is closed by now, so the receive thread is on its way out.
        if let Some(handle) = self.recv_thread.lock().expect("recv thread lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
        std::thread::sleep(Duration::from_millis(100));
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Body of the dedicated receive thread: read frames until the socket
/// closes, routing each into its pending sink.
fn receive_loop(
    mut reader: FrameReader<TcpStream>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    child: Arc<Mutex<Child>>,
    pid: u32,
) {
    loop {
        match reader.read_frame() {
            Ok(Some(frame)) => deliver(frame, &pending),
            Ok(None) => {
                tracing::debug!(pid, "worker connection closed");
                break;
            }
            Err(e) => {
                // The socket is the only control channel; a half-open worker
                // is unrecoverable.
                tracing::warn!(pid, error = %e, "worker transport failed");
                std::thread::sleep(TRANSPORT_GRACE);
                let mut child = child.lock().expect("child lock poisoned");
                if matches!(child.try_wait(), Ok(None)) {
                    tracing::warn!(pid, "killing worker after transport failure");
                    let _ = child.kill();
                    let _ = child.wait();
                }
                break;
            }
        }
    }

    alive.store(false, Ordering::Relaxed);
    // Dropping the sinks wakes every waiter with a terminated error.
    pending.lock().expect("pending map poisoned").clear();
}

/// Route one frame into its sink. Bodies that failed to deserialize are
/// rewritten to a synthetic serialization failure so the waiter still gets a
/// throwable payload.
fn deliver(frame: RawFrame, pending: &Mutex<HashMap<u64, SyncSender<WorkerResult>>>) {
    let result = match frame.body {
        Err(e) => WorkerResult::Raise(RemoteError::serialization(e)),
        Ok(value) => match FrameKind::from_u8(frame.kind) {
            Some(FrameKind::Result) => WorkerResult::Ok(value),
            Some(FrameKind::Failure) => match serde_json::from_value::<RemoteError>(value) {
                Ok(error) => WorkerResult::Raise(error),
                Err(e) => WorkerResult::Raise(RemoteError::serialization(format!(
                    "malformed failure payload: {}",
                    e
                ))),
            },
            _ => {
                tracing::warn!(kind = frame.kind, id = frame.id, "ignoring unexpected frame");
                return;
            }
        },
    };

    let sink = pending
        .lock()
        .expect("pending map poisoned")
        .remove(&frame.id);
    match sink {
        // Capacity-1 sink, one reply per id: this send cannot block. A
        // waiter that gave up and dropped the receiver is not an error.
        Some(sink) => {
            let _ = sink.try_send(result);
        }
        None => tracing::error!(id = frame.id, "no pending request for reply"),
    }
}
