//! Worker subprocess entry point and dispatch loop.
//!
//! This module runs when `skiff worker` is invoked. The worker opens a local
//! TCP listener, prints the chosen port to stdout (the only thing it ever
//! writes there), accepts exactly one connection from its manager, and then
//! serves call frames until the connection closes.
//!
//! Each call frame runs on its own thread so a long evaluation never stalls
//! frame reading. Only the most recently started call is the interrupt
//! target: an OS interrupt (or an interrupt frame, where signals cannot be
//! routed) cancels that call and nothing else.

pub mod env;
pub mod registry;
pub mod sync;

use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::codec::{self, FrameReader, FrameWriter, RawFrame};
use crate::error::Result;
use crate::protocol::{CallRequest, FrameKind, RemoteError};
use env::EvalEnv;
use registry::{FunctionRegistry, Reply};
use sync::{ChannelRegistry, Semaphore};

/// Set by the SIGINT handler; consumed by the latest call task.
static OS_INTERRUPT: AtomicBool = AtomicBool::new(false);

/// Sequence number of the most recently started call task.
static LATEST_SEQ: AtomicU64 = AtomicU64::new(0);

/// Per-task cancellation token handed to every function invocation.
pub struct TaskContext {
    seq: u64,
    cancel: Arc<AtomicBool>,
}

impl TaskContext {
    pub(crate) fn new(seq: u64, cancel: Arc<AtomicBool>) -> Self {
        Self { seq, cancel }
    }

    /// A context that is never the interrupt target. For embedding and tests.
    pub fn detached() -> Self {
        Self::new(u64::MAX, Arc::new(AtomicBool::new(false)))
    }

    /// Whether this task has been cancelled. Consuming an OS interrupt is
    /// reserved for the latest task; once observed, the cancellation latches.
    pub fn interrupted(&self) -> bool {
        if self.cancel.load(Ordering::Relaxed) {
            return true;
        }
        if LATEST_SEQ.load(Ordering::Relaxed) == self.seq
            && OS_INTERRUPT.swap(false, Ordering::Relaxed)
        {
            self.cancel.store(true, Ordering::Relaxed);
            return true;
        }
        false
    }
}

/// Configuration for a worker process.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Maximum concurrent evaluation threads; 0 means unlimited.
    pub threads: usize,
    /// Listening port hint; defaults to `9000 + pid % 1000`.
    pub port_hint: Option<u16>,
}

/// Run the worker: handshake, then serve frames until the manager hangs up.
pub fn run(options: WorkerOptions) -> Result<()> {
    install_signal_handlers();

    let listener = bind_listener(options.port_hint)?;
    let port = listener.local_addr()?.port();

    // The port line is the whole handshake; nothing may precede it on stdout.
    let mut stdout = io::stdout();
    writeln!(stdout, "{}", port)?;
    stdout.flush()?;

    let (stream, peer) = accept_one(&listener)?;
    tracing::debug!(%peer, port, "manager connected");
    codec::tune_stream(&stream)?;

    let reader = FrameReader::new(stream.try_clone()?);
    let writer = Arc::new(Mutex::new(FrameWriter::new(stream)));

    let evaluation_env = Arc::new(EvalEnv::new());
    let channels = Arc::new(ChannelRegistry::new());
    let registry = Arc::new(FunctionRegistry::with_builtins(evaluation_env, channels));
    let limiter = if options.threads > 0 {
        Some(Arc::new(Semaphore::new(options.threads)))
    } else {
        None
    };

    serve(reader, writer, registry, limiter)
}

fn install_signal_handlers() {
    #[cfg(unix)]
    unsafe {
        use nix::sys::signal::{signal, SigHandler, Signal};

        // Pipe errors surface as io::Error instead.
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
        // An interrupt cancels the latest call; it must not kill the process.
        let _ = signal(Signal::SIGINT, SigHandler::Handler(on_interrupt));
    }
}

#[cfg(unix)]
extern "C" fn on_interrupt(_signum: libc::c_int) {
    OS_INTERRUPT.store(true, Ordering::Relaxed);
}

fn default_port_hint() -> u16 {
    9000 + (std::process::id() % 1000) as u16
}

fn bind_listener(hint: Option<u16>) -> io::Result<TcpListener> {
    let hint = hint.unwrap_or_else(default_port_hint);
    match TcpListener::bind(("127.0.0.1", hint)) {
        Ok(listener) => Ok(listener),
        // Hint port taken: any free port will do.
        Err(_) => TcpListener::bind(("127.0.0.1", 0)),
    }
}

fn accept_one(listener: &TcpListener) -> io::Result<(TcpStream, std::net::SocketAddr)> {
    loop {
        match listener.accept() {
            Ok(accepted) => return Ok(accepted),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn serve(
    mut reader: FrameReader<TcpStream>,
    writer: Arc<Mutex<FrameWriter<TcpStream>>>,
    registry: Arc<FunctionRegistry>,
    limiter: Option<Arc<Semaphore>>,
) -> Result<()> {
    let latest: Arc<Mutex<Option<Arc<AtomicBool>>>> = Arc::new(Mutex::new(None));
    let mut next_seq: u64 = 1;

    loop {
        let frame = match reader.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!("connection closed, worker exiting");
                return Ok(());
            }
            Err(e) => {
                tracing::error!(error = %e, "transport failed, worker exiting");
                return Err(e);
            }
        };

        match FrameKind::from_u8(frame.kind) {
            Some(FrameKind::Call) => {
                start_call(true, frame, &writer, &registry, &limiter, &latest, &mut next_seq);
            }
            Some(FrameKind::Cast) => {
                start_call(false, frame, &writer, &registry, &limiter, &latest, &mut next_seq);
            }
            Some(FrameKind::Interrupt) => {
                tracing::debug!("interrupt frame received");
                let latest = latest.lock().expect("latest task lock poisoned");
                match latest.as_ref() {
                    Some(cancel) => cancel.store(true, Ordering::Relaxed),
                    None => tracing::debug!("no call to interrupt"),
                }
            }
            Some(_) | None => {
                tracing::warn!(kind = frame.kind, id = frame.id, "ignoring unexpected frame");
            }
        }
    }
}

/// Decode a call frame and run it on its own thread.
fn start_call(
    expects_reply: bool,
    frame: RawFrame,
    writer: &Arc<Mutex<FrameWriter<TcpStream>>>,
    registry: &Arc<FunctionRegistry>,
    limiter: &Option<Arc<Semaphore>>,
    latest: &Arc<Mutex<Option<Arc<AtomicBool>>>>,
    next_seq: &mut u64,
) {
    let request = match &frame.body {
        Ok(body) => match CallRequest::from_body(body) {
            Ok(request) => request,
            Err(e) => {
                reject_call(expects_reply, frame.id, e, writer);
                return;
            }
        },
        Err(e) => {
            reject_call(expects_reply, frame.id, e.clone(), writer);
            return;
        }
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let seq = *next_seq;
    *next_seq += 1;

    // This call becomes the interrupt target; an unconsumed interrupt aimed
    // at an already-finished call is dropped here.
    *latest.lock().expect("latest task lock poisoned") = Some(cancel.clone());
    LATEST_SEQ.store(seq, Ordering::Relaxed);
    OS_INTERRUPT.store(false, Ordering::Relaxed);

    let ctx = TaskContext::new(seq, cancel);
    let writer = writer.clone();
    let registry = registry.clone();
    let limiter = limiter.clone();
    let id = frame.id;

    std::thread::Builder::new()
        .name(format!("call-{}", seq))
        .spawn(move || {
            let _permit = limiter.as_ref().map(|semaphore| semaphore.acquire());
            let outcome = registry.dispatch(&request, &ctx);
            if expects_reply {
                send_reply(&writer, id, request.discard, outcome);
            } else if let Err(e) = outcome {
                tracing::debug!(function = %request.function, error = %e, "cast raised; dropping");
            }
        })
        .expect("failed to spawn call thread");
}

fn reject_call(
    expects_reply: bool,
    id: u64,
    reason: String,
    writer: &Arc<Mutex<FrameWriter<TcpStream>>>,
) {
    if expects_reply {
        send_reply(writer, id, false, Err(RemoteError::serialization(reason)));
    } else {
        tracing::debug!(id, %reason, "dropping undecodable cast");
    }
}

fn send_reply(
    writer: &Mutex<FrameWriter<TcpStream>>,
    id: u64,
    discard: bool,
    outcome: std::result::Result<Reply, RemoteError>,
) {
    let (kind, body) = match outcome {
        Ok(Reply::Value(value)) => {
            let payload = if discard { Value::Null } else { value };
            match serde_json::to_vec(&payload) {
                Ok(body) => (FrameKind::Result, body),
                Err(e) => (
                    FrameKind::Failure,
                    encode_error(&RemoteError::serialization(format!(
                        "could not serialize result: {}",
                        e
                    ))),
                ),
            }
        }
        Ok(Reply::Raw(body)) => (FrameKind::Result, body),
        Err(error) => (FrameKind::Failure, encode_error(&error)),
    };

    let mut writer = writer.lock().expect("frame writer lock poisoned");
    if let Err(e) = writer.write_frame(kind as u8, id, &body) {
        tracing::error!(id, error = %e, "failed to send reply");
    }
}

fn encode_error(error: &RemoteError) -> Vec<u8> {
    serde_json::to_vec(error).unwrap_or_else(|_| {
        br#"{"kind":"RemoteException","message":"unencodable error"}"#.to_vec()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port_hint_in_range() {
        let hint = default_port_hint();
        assert!((9000..10000).contains(&hint));
    }

    #[test]
    fn test_bind_listener_falls_back_when_hint_taken() {
        let first = bind_listener(Some(0)).unwrap();
        let taken = first.local_addr().unwrap().port();
        let second = bind_listener(Some(taken)).unwrap();
        assert_ne!(second.local_addr().unwrap().port(), taken);
    }

    #[test]
    fn test_detached_context_never_interrupted() {
        let ctx = TaskContext::detached();
        assert!(!ctx.interrupted());
        OS_INTERRUPT.store(true, Ordering::Relaxed);
        assert!(!ctx.interrupted());
        OS_INTERRUPT.store(false, Ordering::Relaxed);
    }

    #[test]
    fn test_cancelled_context_latches() {
        let cancel = Arc::new(AtomicBool::new(false));
        let ctx = TaskContext::new(u64::MAX - 1, cancel.clone());
        assert!(!ctx.interrupted());
        cancel.store(true, Ordering::Relaxed);
        assert!(ctx.interrupted());
        assert!(ctx.interrupted());
    }
}
