// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Render farm CLI: dispatcher and worker entry points.

use clap::{Parser, Subcommand};
use std::process;

mod commands;

use commands::{serve, worker};

/// Distributed render farm coordinator and worker
#[derive(Parser)]
#[command(name = "render-farm")]
#[command(author = "Render Farm Contributors")]
#[command(version)]
#[command(about = "Distributed render farm for node-graph compositing renderers", long_about = None)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher (job store + HTTP API)
    #[command(visible_alias = "s")]
    Serve(serve::ServeArgs),

    /// Run a render worker
    #[command(visible_alias = "w")]
    Worker(worker::WorkerArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let result = match cli.command {
        Commands::Serve(args) => serve::execute(args).await,
        Commands::Worker(args) => worker::execute(args).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        for cause in e.chain().skip(1) {
            eprintln!("  caused by: {cause}");
        }
        process::exit(1);
    }
}
