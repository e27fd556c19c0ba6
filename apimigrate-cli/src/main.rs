//! apimigrate CLI - versioned HTTP API migrations.

use clap::Parser;
use tokio_util::sync::CancellationToken;

use apimigrate_cli::cli::{Cli, Command};
use apimigrate_cli::commands;
use apimigrate_cli::error::CliResult;
use apimigrate_cli::output;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        output::newline();
        output::error(&e.to_string());
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warn("Interrupted, stopping after the current request");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Command::Up(args) => commands::up::run(&cli.config, args, cancel).await,
        Command::Down(args) => commands::down::run(&cli.config, args, cancel).await,
        Command::Status(args) => commands::status::run(&cli.config, args, cancel).await,
        Command::Stages(args) => commands::stages::run(args, cancel).await,
    }
}
