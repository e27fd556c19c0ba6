//! `apimigrate up` - apply pending migrations.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::cli::UpArgs;
use crate::commands::open_engine;
use crate::error::CliResult;
use crate::output;

/// Run the up command
pub async fn run(config: &Path, args: UpArgs, cancel: CancellationToken) -> CliResult<()> {
    output::header(if args.dry_run { "Migrate Up (dry run)" } else { "Migrate Up" });

    let engine = open_engine(config, args.dry_run, cancel).await?;
    let plan = engine.plan_up(args.to).await?;
    output::info(&plan.summary());
    if plan.is_empty() {
        return Ok(());
    }
    output::newline();

    match engine.up(args.to).await {
        Ok(results) => {
            for result in &results {
                output::version_result(result);
            }
            output::newline();
            if args.dry_run {
                output::info(&format!("{} migration(s) would run", results.len()));
            } else {
                let current = engine.store().current_version().await?;
                output::success(&format!(
                    "Applied {} migration(s), now at version {}",
                    results.len(),
                    current
                ));
            }
            Ok(())
        }
        Err(failure) => {
            for result in &failure.partial {
                output::version_result(result);
            }
            output::newline();
            Err(failure.error.into())
        }
    }
}
