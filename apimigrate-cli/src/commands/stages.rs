//! `apimigrate stages` - multi-stage orchestration.

use std::path::Path;
use std::sync::Arc;

use apimigrate::{
    DriverStoreFactory, LoggingConfig, Orchestrator, StageOutcome, StageReport, StageSelection,
};
use tokio_util::sync::CancellationToken;

use crate::cli::{StageRunArgs, StageStatusArgs, StagesArgs, StagesSubcommand};
use crate::commands::status::print_status;
use crate::error::{CliError, CliResult};
use crate::logging;
use crate::output;

/// Run the stages command
pub async fn run(args: StagesArgs, cancel: CancellationToken) -> CliResult<()> {
    logging::init(&LoggingConfig::default());
    let file = args.file.as_path();
    match args.command {
        StagesSubcommand::Up(run_args) => run_up(file, run_args, cancel).await,
        StagesSubcommand::Down(run_args) => run_down(file, run_args, cancel).await,
        StagesSubcommand::Status(status_args) => run_status(file, status_args, cancel).await,
        StagesSubcommand::Validate => run_validate(file).await,
    }
}

fn load(file: &Path, cancel: CancellationToken, dry_run: bool) -> CliResult<Orchestrator> {
    if !file.exists() {
        return Err(CliError::Config(format!(
            "stages file {} not found",
            file.display()
        )));
    }
    let orchestrator = Orchestrator::load(file, Arc::new(DriverStoreFactory))?
        .with_cancellation(cancel)
        .with_dry_run(dry_run);
    output::kv("Stages file", &file.display().to_string());
    output::kv("Stages", &orchestrator.graph().ordered_names().join(" → "));
    output::newline();
    Ok(orchestrator)
}

/// Run `apimigrate stages up`
async fn run_up(file: &Path, args: StageRunArgs, cancel: CancellationToken) -> CliResult<()> {
    output::header(if args.dry_run { "Stages Up (dry run)" } else { "Stages Up" });
    let orchestrator = load(file, cancel, args.dry_run)?;
    let selection = StageSelection::from(args.selection);
    report(orchestrator.up(&selection).await, "applied")
}

/// Run `apimigrate stages down`
async fn run_down(file: &Path, args: StageRunArgs, cancel: CancellationToken) -> CliResult<()> {
    output::header(if args.dry_run { "Stages Down (dry run)" } else { "Stages Down" });
    let orchestrator = load(file, cancel, args.dry_run)?;
    let selection = StageSelection::from(args.selection);
    report(orchestrator.down(&selection).await, "rolled back")
}

fn report(
    outcome: apimigrate::PartialResult<Vec<StageReport>>,
    verb: &str,
) -> CliResult<()> {
    let (reports, error) = match outcome {
        Ok(reports) => (reports, None),
        Err(failure) => (failure.partial, Some(failure.error)),
    };
    for stage in &reports {
        output::stage_report(stage);
    }
    output::newline();

    if let Some(error) = error {
        return Err(error.into());
    }
    let failed = reports.iter().filter(|r| r.is_failed()).count();
    let skipped = reports
        .iter()
        .filter(|r| matches!(r.outcome, StageOutcome::Skipped(_)))
        .count();
    if failed > 0 {
        return Err(CliError::Stage(format!("{} stage(s) failed", failed)));
    }
    let done = reports.len() - skipped;
    output::success(&format!("{} stage(s) {}", done, verb));
    if skipped > 0 {
        output::warn(&format!("{} stage(s) skipped", skipped));
    }
    Ok(())
}

/// Run `apimigrate stages status`
async fn run_status(
    file: &Path,
    args: StageStatusArgs,
    cancel: CancellationToken,
) -> CliResult<()> {
    output::header("Stages Status");
    let orchestrator = load(file, cancel, false)?;
    let selection = StageSelection::from(args.selection);
    for stage in orchestrator.status(&selection, args.history).await? {
        output::section(&stage.stage);
        print_status(&stage.status, true);
        output::newline();
    }
    Ok(())
}

/// Run `apimigrate stages validate`
async fn run_validate(file: &Path) -> CliResult<()> {
    output::header("Stages Validate");
    let orchestrator = load(file, CancellationToken::new(), true)?;
    let validations = orchestrator.validate().await?;
    for stage in &validations {
        output::success(&format!(
            "{} ({} migration(s))",
            stage.stage,
            stage.migrations.len()
        ));
        output::kv("Config", &stage.config_file.display().to_string());
        for migration in &stage.migrations {
            output::list_item(migration.file_name());
        }
    }
    output::newline();
    output::success(&format!("{} stage(s) valid", validations.len()));
    Ok(())
}
