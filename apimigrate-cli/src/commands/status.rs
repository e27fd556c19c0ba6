//! `apimigrate status` - show applied and pending migrations.

use std::path::Path;

use apimigrate::MigrationStatus;
use tokio_util::sync::CancellationToken;

use crate::cli::StatusArgs;
use crate::commands::open_engine;
use crate::error::CliResult;
use crate::output;

/// Run the status command
pub async fn run(config: &Path, args: StatusArgs, cancel: CancellationToken) -> CliResult<()> {
    output::header("Migration Status");

    let engine = open_engine(config, false, cancel).await?;
    let status = engine.status(args.history).await?;
    print_status(&status, args.verbose);
    Ok(())
}

/// Print one engine status.
pub(crate) fn print_status(status: &MigrationStatus, verbose: bool) {
    output::kv("Current version", &status.current_version.to_string());
    output::kv("Applied", &status.applied.len().to_string());
    output::kv("Pending", &status.pending.len().to_string());

    if verbose {
        if !status.applied.is_empty() {
            output::newline();
            output::section("Applied versions");
            for version in &status.applied {
                output::list_item(&output::style_success(&version.to_string()));
            }
        }
        if !status.pending.is_empty() {
            output::newline();
            output::section("Pending migrations");
            for file in &status.pending {
                output::list_item(&format!(
                    "{} {}",
                    output::style_pending(file.file_name()),
                    file.path.display()
                ));
            }
        }
    }

    if let Some(history) = &status.history {
        output::newline();
        output::section("History");
        if history.is_empty() {
            output::dim("  no runs recorded");
        }
        for run in history {
            output::run_record(run);
        }
    }

    if status.pending.is_empty() {
        output::newline();
        output::success("Up to date");
    }
}
