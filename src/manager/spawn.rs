//! Worker subprocess spawning and the port handshake.
//!
//! The worker program defaults to the current executable re-entered through
//! its `worker` subcommand, so a single binary serves both roles. The child's
//! stderr is relayed into the manager's log stream, with a short tail
//! retained for spawn-failure diagnostics.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::codec;
use crate::error::{Result, SkiffError};

/// Counter for unique worker indices (used to label forwarder threads).
static WORKER_SPAWN_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// How many stderr lines to retain for diagnostics.
const STDERR_TAIL_LINES: usize = 50;

/// Configuration for spawning a worker process.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Worker program; defaults to `SKIFF_WORKER` or the current executable.
    pub(crate) program: Option<PathBuf>,
    /// Extra flags appended to the worker command line.
    pub(crate) exeflags: Vec<String>,
    /// Environment variables set on the worker process.
    pub(crate) envs: Vec<(String, String)>,
    /// How long to wait for the port handshake.
    pub(crate) connect_timeout: Duration,
    /// How long the drop finalizer waits for a graceful exit before
    /// escalating to kill.
    pub(crate) stop_grace: Duration,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            program: None,
            exeflags: Vec::new(),
            envs: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_millis(500),
        }
    }
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit worker program.
    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Append one flag to the worker command line.
    pub fn exeflag(mut self, flag: impl Into<String>) -> Self {
        self.exeflags.push(flag.into());
        self
    }

    /// Append several flags to the worker command line.
    pub fn exeflags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exeflags.extend(flags.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable on the worker process.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Set the handshake timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the grace period the drop finalizer allows for a clean exit.
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    fn resolve_program(&self) -> Result<PathBuf> {
        if let Some(ref program) = self.program {
            return Ok(program.clone());
        }
        if let Ok(program) = std::env::var("SKIFF_WORKER") {
            return Ok(PathBuf::from(program));
        }
        std::env::current_exe()
            .map_err(|e| SkiffError::Spawn(format!("could not locate worker program: {}", e)))
    }
}

/// A freshly spawned, connected worker, before the handle takes over.
#[derive(Debug)]
pub(crate) struct SpawnedWorker {
    pub child: Child,
    pub stream: TcpStream,
    pub port: u16,
}

/// Launch a worker subprocess and complete the port handshake.
pub(crate) fn spawn_worker(options: &SpawnOptions) -> Result<SpawnedWorker> {
    let program = options.resolve_program()?;
    let worker_index = WORKER_SPAWN_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut cmd = Command::new(&program);
    cmd.arg("worker");
    cmd.args(&options.exeflags);
    for (key, value) in &options.envs {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        SkiffError::Spawn(format!(
            "failed to launch worker program {}: {}",
            program.display(),
            e
        ))
    })?;

    let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
    let stderr_thread = child.stderr.take().map(|stderr| {
        let tail = stderr_tail.clone();
        std::thread::Builder::new()
            .name(format!("worker-{}-stderr", worker_index))
            .spawn(move || forward_worker_stderr(worker_index, stderr, tail))
            .expect("failed to spawn stderr forwarder")
    });

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SkiffError::Spawn("child stdout was not captured".into()))?;
    let (port_tx, port_rx) = mpsc::channel();
    std::thread::Builder::new()
        .name(format!("worker-{}-stdout", worker_index))
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            let first = match reader.read_line(&mut line) {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(line.clone()),
            };
            let _ = port_tx.send(first);
            // Relay anything else the worker prints; there shouldn't be any.
            loop {
                line.clear();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        tracing::debug!(worker = worker_index, "worker stdout: {}", line.trim_end())
                    }
                }
            }
        })
        .expect("failed to spawn stdout forwarder");

    let port = match port_rx.recv_timeout(options.connect_timeout) {
        Ok(Some(line)) => match line.trim().parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                return Err(handshake_failure(
                    child,
                    stderr_thread,
                    &stderr_tail,
                    format!("unexpected handshake line {:?}", line.trim()),
                ));
            }
        },
        Ok(None) | Err(RecvTimeoutError::Disconnected) => {
            return Err(handshake_failure(
                child,
                stderr_thread,
                &stderr_tail,
                "no port line on stdout".to_string(),
            ));
        }
        Err(RecvTimeoutError::Timeout) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SkiffError::Spawn(format!(
                "timed out after {:?} waiting for the worker port handshake",
                options.connect_timeout
            )));
        }
    };

    let stream = match TcpStream::connect(("127.0.0.1", port)) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SkiffError::Spawn(format!(
                "could not connect to worker on port {}: {}",
                port, e
            )));
        }
    };
    if let Err(e) = codec::tune_stream(&stream) {
        let _ = child.kill();
        let _ = child.wait();
        return Err(e.into());
    }

    tracing::debug!(
        worker = worker_index,
        pid = child.id(),
        port,
        "worker connected"
    );

    Ok(SpawnedWorker {
        child,
        stream,
        port,
    })
}

/// Build the spawn-failure error, collecting the child's exit status and the
/// stderr it managed to write.
fn handshake_failure(
    mut child: Child,
    stderr_thread: Option<JoinHandle<()>>,
    stderr_tail: &Mutex<VecDeque<String>>,
    why: String,
) -> SkiffError {
    let status = wait_briefly(&mut child, Duration::from_secs(2));
    if status.is_none() {
        let _ = child.kill();
        let _ = child.wait();
    }
    if let Some(handle) = stderr_thread {
        let _ = handle.join();
    }

    let tail = stderr_tail.lock().expect("stderr tail lock poisoned");
    let stderr = if tail.is_empty() {
        "(no stderr output)".to_string()
    } else {
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    };
    let status_text = match status {
        Some(status) => format!(" ({})", status),
        None => String::new(),
    };

    SkiffError::Spawn(format!(
        "worker exited before we could connect{}: {}; stderr:\n{}",
        status_text, why, stderr
    ))
}

fn wait_briefly(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    None
}

/// Relay worker stderr into the manager's log stream, keeping a short tail.
///
/// Lines the worker's own logger marked as errors come through at WARN so
/// they stay visible at default filtering.
fn forward_worker_stderr(
    worker_index: usize,
    stderr: ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let reader = BufReader::new(stderr);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break, // Pipe closed
        };
        if line.trim().is_empty() {
            continue;
        }

        {
            let mut tail = tail.lock().expect("stderr tail lock poisoned");
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }

        if line.contains("ERROR") {
            tracing::warn!(worker = worker_index, "worker stderr: {}", line);
        } else {
            tracing::debug!(worker = worker_index, "worker stderr: {}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_options_defaults() {
        let options = SpawnOptions::default();
        assert!(options.program.is_none());
        assert!(options.exeflags.is_empty());
        assert!(options.envs.is_empty());
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.stop_grace, Duration::from_millis(500));
    }

    #[test]
    fn test_spawn_options_builder() {
        let options = SpawnOptions::new()
            .program("/usr/bin/skiff")
            .exeflag("-t")
            .exeflag("4")
            .exeflags(["--port-hint", "9123"])
            .env("SKIFF_LOG_LEVEL", "debug")
            .connect_timeout(Duration::from_secs(3))
            .stop_grace(Duration::from_millis(250));

        assert_eq!(options.program, Some(PathBuf::from("/usr/bin/skiff")));
        assert_eq!(options.exeflags, vec!["-t", "4", "--port-hint", "9123"]);
        assert_eq!(
            options.envs,
            vec![("SKIFF_LOG_LEVEL".to_string(), "debug".to_string())]
        );
        assert_eq!(options.connect_timeout, Duration::from_secs(3));
        assert_eq!(options.stop_grace, Duration::from_millis(250));
    }

    #[test]
    fn test_resolve_program_prefers_explicit() {
        let options = SpawnOptions::new().program("/tmp/custom-worker");
        assert_eq!(
            options.resolve_program().unwrap(),
            PathBuf::from("/tmp/custom-worker")
        );
    }

    #[test]
    fn test_resolve_program_defaults_to_current_exe() {
        // Guard against env leakage from the surrounding shell.
        if std::env::var("SKIFF_WORKER").is_ok() {
            return;
        }
        let options = SpawnOptions::new();
        let resolved = options.resolve_program().unwrap();
        assert_eq!(resolved, std::env::current_exe().unwrap());
    }

    #[test]
    fn test_spawn_failure_for_missing_program() {
        let options = SpawnOptions::new().program("/nonexistent/skiff-worker");
        let err = spawn_worker(&options).unwrap_err();
        assert!(matches!(err, SkiffError::Spawn(_)));
        assert!(err.to_string().contains("failed to launch"));
    }
}
