//! `apimigrate down` - roll back to a target version.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::cli::DownArgs;
use crate::commands::open_engine;
use crate::error::CliResult;
use crate::output;

/// Run the down command
pub async fn run(config: &Path, args: DownArgs, cancel: CancellationToken) -> CliResult<()> {
    output::header(if args.dry_run { "Migrate Down (dry run)" } else { "Migrate Down" });

    let engine = open_engine(config, args.dry_run, cancel).await?;
    let plan = engine.plan_down(args.to).await?;
    output::info(&plan.summary());
    if plan.is_empty() {
        return Ok(());
    }
    output::newline();

    match engine.down(args.to).await {
        Ok(results) => {
            for result in &results {
                output::version_result(result);
            }
            output::newline();
            if args.dry_run {
                output::info(&format!("{} migration(s) would be rolled back", results.len()));
            } else {
                output::success(&format!(
                    "Rolled back {} migration(s) to version {}",
                    results.len(),
                    args.to
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
