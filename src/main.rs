//! skiff - disposable evaluation sandboxes

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};

use skiff::cli::{Cli, Commands, EvalArgs, WorkerArgs};
use skiff::manager::{SpawnOptions, Worker};
use skiff::worker::WorkerOptions;

fn main() {
    let cli = Cli::parse();
    skiff::logging::init(cli.log_config());

    let result = match &cli.command {
        Commands::Worker(args) => cmd_worker(args),
        Commands::Eval(args) => cmd_eval(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Serve one manager connection until it hangs up.
fn cmd_worker(args: &WorkerArgs) -> Result<()> {
    skiff::worker::run(WorkerOptions {
        threads: args.threads,
        port_hint: args.port_hint,
    })?;
    Ok(())
}

/// Spawn a throwaway worker, evaluate the expression, print the result.
fn cmd_eval(args: &EvalArgs) -> Result<()> {
    let mut options = SpawnOptions::new();
    if let Some(ref program) = args.program {
        options = options.program(program);
    }

    let worker = Worker::spawn(options)?;
    let value = worker.eval_fetch(&args.expr.join(" "))?;
    println!("{}", serde_json::to_string_pretty(&value)?);

    worker.stop();
    worker.wait_for_exit(Duration::from_secs(5))?;
    Ok(())
}
