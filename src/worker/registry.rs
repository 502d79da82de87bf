//! Named function registry for the worker.
//!
//! The wire protocol addresses functions by name; this registry maps each
//! name to a handler. The default set wires in the evaluation environment,
//! the remote-channel operations, and a few primitives the manager-side API
//! and the test suite lean on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use super::env::EvalEnv;
use super::sync::ChannelRegistry;
use super::TaskContext;
use crate::protocol::{CallRequest, RemoteError};

/// How often interruptible built-ins re-check their cancellation token.
const CANCEL_POLL_TICK: Duration = Duration::from_millis(10);

/// What a function hands back to the dispatch loop.
pub enum Reply {
    /// A JSON value, serialized into the reply body.
    Value(Value),
    /// Raw reply-body bytes, emitted verbatim. Exists so tests can produce a
    /// body the peer cannot deserialize and prove the stream survives it.
    Raw(Vec<u8>),
}

/// Arguments as decoded from a call frame.
pub struct CallArgs<'a> {
    pub args: &'a [Value],
    pub named: &'a Map<String, Value>,
}

type Handler = Arc<dyn Fn(&CallArgs<'_>, &TaskContext) -> Result<Reply, RemoteError> + Send + Sync>;

/// Registry of callable functions, keyed by name.
pub struct FunctionRegistry {
    functions: HashMap<String, Handler>,
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// The default registry: primitives, `env.eval`, and channel operations.
    pub fn with_builtins(env: Arc<EvalEnv>, channels: Arc<ChannelRegistry>) -> Self {
        let mut registry = Self::new();

        registry.register("identity", |call, _ctx| {
            Ok(Reply::Value(call.args.first().cloned().unwrap_or(Value::Null)))
        });

        registry.register("add", |call, _ctx| {
            add_numbers(call.args).map(Reply::Value)
        });

        registry.register("sleep", |call, ctx| {
            let millis = arg_u64(call.args, 0, "sleep duration in milliseconds")?;
            let deadline = Instant::now() + Duration::from_millis(millis);
            while Instant::now() < deadline {
                if ctx.interrupted() {
                    return Err(RemoteError::interrupted());
                }
                std::thread::sleep(CANCEL_POLL_TICK);
            }
            Ok(Reply::Value(Value::Null))
        });

        registry.register("spin", |_call, ctx| {
            // Runs until interrupted.
            loop {
                if ctx.interrupted() {
                    return Err(RemoteError::interrupted());
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        registry.register("raise", |call, _ctx| {
            let message = call
                .args
                .first()
                .and_then(Value::as_str)
                .unwrap_or("raised by request");
            Err(RemoteError::exception(message))
        });

        registry.register("debug.scramble", |_call, _ctx| {
            // Invalid UTF-8, invalid JSON, and free of the boundary marker.
            Ok(Reply::Raw(vec![0x00, 0xC3, 0x28, 0xFE, 0x01, 0x9B]))
        });

        {
            let env = env.clone();
            registry.register("env.eval", move |call, _ctx| {
                let expr = arg_str(call.args, 0, "expression")?;
                env.eval(expr).map(Reply::Value)
            });
        }

        {
            let channels = channels.clone();
            registry.register("channel.new", move |call, _ctx| {
                let id = arg_u64(call.args, 0, "channel id")?;
                let capacity = arg_u64(call.args, 1, "channel capacity")? as usize;
                channels.create(id, capacity)?;
                Ok(Reply::Value(Value::Null))
            });
        }

        {
            let channels = channels.clone();
            registry.register("channel.put", move |call, ctx| {
                let id = arg_u64(call.args, 0, "channel id")?;
                let value = call
                    .args
                    .get(1)
                    .cloned()
                    .ok_or_else(|| missing_arg(1, "value to put"))?;
                channels.get(id)?.put(value, || ctx.interrupted())?;
                Ok(Reply::Value(Value::Null))
            });
        }

        {
            let channels = channels.clone();
            registry.register("channel.take", move |call, ctx| {
                let id = arg_u64(call.args, 0, "channel id")?;
                let value = channels.get(id)?.take(|| ctx.interrupted())?;
                Ok(Reply::Value(value))
            });
        }

        {
            let channels = channels.clone();
            registry.register("channel.ready", move |call, _ctx| {
                let id = arg_u64(call.args, 0, "channel id")?;
                Ok(Reply::Value(Value::Bool(channels.get(id)?.ready())))
            });
        }

        {
            let channels = channels.clone();
            registry.register("channel.wait", move |call, ctx| {
                let id = arg_u64(call.args, 0, "channel id")?;
                channels.get(id)?.wait_ready(|| ctx.interrupted())?;
                Ok(Reply::Value(Value::Null))
            });
        }

        {
            let channels = channels.clone();
            registry.register("channel.close", move |call, _ctx| {
                let id = arg_u64(call.args, 0, "channel id")?;
                Ok(Reply::Value(Value::Bool(channels.close(id))))
            });
        }

        registry.register("worker.exit", |_call, _ctx| {
            tracing::info!("worker exiting on request");
            std::process::exit(0);
        });

        registry
    }

    /// Register a function under `name`, replacing any previous handler.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&CallArgs<'_>, &TaskContext) -> Result<Reply, RemoteError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(handler));
    }

    /// Resolve and invoke the function named by a call request.
    pub fn dispatch(&self, request: &CallRequest, ctx: &TaskContext) -> Result<Reply, RemoteError> {
        let handler = self
            .functions
            .get(&request.function)
            .ok_or_else(|| RemoteError::undefined_function(&request.function))?;
        handler(
            &CallArgs {
                args: &request.args,
                named: &request.named,
            },
            ctx,
        )
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn missing_arg(index: usize, what: &str) -> RemoteError {
    RemoteError::exception(format!("missing argument {} ({})", index, what))
}

fn arg_u64(args: &[Value], index: usize, what: &str) -> Result<u64, RemoteError> {
    args.get(index)
        .and_then(Value::as_u64)
        .ok_or_else(|| missing_arg(index, what))
}

fn arg_str<'a>(args: &'a [Value], index: usize, what: &str) -> Result<&'a str, RemoteError> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| missing_arg(index, what))
}

fn add_numbers(args: &[Value]) -> Result<Value, RemoteError> {
    if args.iter().all(Value::is_i64) {
        let mut sum: i64 = 0;
        for arg in args {
            sum += arg.as_i64().expect("checked i64 above");
        }
        return Ok(Value::from(sum));
    }
    let mut sum = 0.0;
    for arg in args {
        sum += arg
            .as_f64()
            .ok_or_else(|| RemoteError::exception(format!("not a number: {}", arg)))?;
    }
    Ok(Value::from(sum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn builtins() -> FunctionRegistry {
        FunctionRegistry::with_builtins(
            Arc::new(EvalEnv::new()),
            Arc::new(ChannelRegistry::new()),
        )
    }

    fn call(registry: &FunctionRegistry, function: &str, args: Vec<Value>) -> Result<Value, RemoteError> {
        let request = CallRequest::new(function, args);
        match registry.dispatch(&request, &TaskContext::detached())? {
            Reply::Value(v) => Ok(v),
            Reply::Raw(_) => panic!("unexpected raw reply"),
        }
    }

    #[test]
    fn test_identity() {
        let registry = builtins();
        assert_eq!(call(&registry, "identity", vec![json!(true)]).unwrap(), json!(true));
        assert_eq!(call(&registry, "identity", vec![]).unwrap(), Value::Null);
    }

    #[test]
    fn test_add() {
        let registry = builtins();
        assert_eq!(call(&registry, "add", vec![json!(1), json!(2)]).unwrap(), json!(3));
        assert_eq!(
            call(&registry, "add", vec![json!(1.5), json!(2)]).unwrap(),
            json!(3.5)
        );
        assert!(call(&registry, "add", vec![json!("x")]).is_err());
    }

    #[test]
    fn test_unknown_function() {
        let registry = builtins();
        let err = call(&registry, "no.such.function", vec![]).unwrap_err();
        assert_eq!(err.kind, RemoteError::UNDEFINED_FUNCTION);
    }

    #[test]
    fn test_raise() {
        let registry = builtins();
        let err = call(&registry, "raise", vec![json!("boom")]).unwrap_err();
        assert_eq!(err.kind, RemoteError::EXCEPTION);
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_eval_roundtrip() {
        let registry = builtins();
        call(&registry, "env.eval", vec![json!("box.v = 7")]).unwrap();
        assert_eq!(
            call(&registry, "env.eval", vec![json!("box.v")]).unwrap(),
            json!(7)
        );
    }

    #[test]
    fn test_channel_functions() {
        let registry = builtins();
        call(&registry, "channel.new", vec![json!(1), json!(4)]).unwrap();
        call(&registry, "channel.put", vec![json!(1), json!("hello")]).unwrap();
        assert_eq!(
            call(&registry, "channel.ready", vec![json!(1)]).unwrap(),
            json!(true)
        );
        assert_eq!(
            call(&registry, "channel.take", vec![json!(1)]).unwrap(),
            json!("hello")
        );
        assert_eq!(
            call(&registry, "channel.close", vec![json!(1)]).unwrap(),
            json!(true)
        );
        assert!(call(&registry, "channel.put", vec![json!(1), json!(0)]).is_err());
    }

    #[test]
    fn test_scramble_is_undecodable() {
        let registry = builtins();
        let request = CallRequest::new("debug.scramble", vec![]);
        match registry.dispatch(&request, &TaskContext::detached()).unwrap() {
            Reply::Raw(bytes) => {
                assert!(serde_json::from_slice::<Value>(&bytes).is_err());
            }
            Reply::Value(_) => panic!("scramble must produce raw bytes"),
        }
    }

    #[test]
    fn test_spin_stops_on_cancel() {
        let registry = Arc::new(builtins());
        let cancel = Arc::new(AtomicBool::new(false));
        let ctx = TaskContext::new(0, cancel.clone());

        let spinner = {
            let registry = registry.clone();
            thread::spawn(move || {
                let request = CallRequest::new("spin", vec![]);
                registry.dispatch(&request, &ctx).map(|_| ())
            })
        };
        thread::sleep(Duration::from_millis(50));
        cancel.store(true, Ordering::Relaxed);
        let err = spinner.join().unwrap().unwrap_err();
        assert!(err.is_interrupt());
    }

    #[test]
    fn test_registered_function_overrides() {
        let mut registry = builtins();
        registry.register("identity", |_call, _ctx| Ok(Reply::Value(json!("shadowed"))));
        assert_eq!(
            call(&registry, "identity", vec![json!(1)]).unwrap(),
            json!("shadowed")
        );
    }
}
