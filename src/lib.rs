//! skiff - disposable evaluation sandboxes.
//!
//! A manager process spawns isolated worker subprocesses, calls registered
//! functions on them over a framed TCP protocol with per-request correlation,
//! and can interrupt, stop, or kill them without leaking processes. Built for
//! hosts (like notebook environments) that want cheap, independently
//! terminable evaluation sandboxes.
//!
//! ```no_run
//! use skiff::manager::{SpawnOptions, Worker};
//! use serde_json::json;
//!
//! # fn main() -> skiff::Result<()> {
//! let worker = Worker::spawn(SpawnOptions::new())?;
//! assert_eq!(worker.call_fetch("identity", vec![json!(true)])?, json!(true));
//! worker.stop();
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod codec;
pub mod error;
pub mod logging;
pub mod manager;
pub mod protocol;
pub mod worker;

pub use error::{Result, SkiffError};
pub use manager::{RemoteCall, RemoteChannel, SpawnOptions, Worker};
pub use protocol::{RemoteError, WorkerResult};
