//! Styled terminal output utilities.

use apimigrate::{RunRecord, StageOutcome, StageReport, VersionResult};
use owo_colors::OwoColorize;

/// Print a header/title
pub fn header(text: &str) {
    println!();
    println!("{}", text.bold().cyan());
    println!("{}", "─".repeat(text.len()).dimmed());
    println!();
}

/// Print a section header
pub fn section(text: &str) {
    println!("{}", text.bold().white());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Print a success message
pub fn success(text: &str) {
    println!("{} {}", "✔".green().bold(), text.green());
}

/// Print an info message
pub fn info(text: &str) {
    println!("{} {}", "ℹ".blue().bold(), text);
}

/// Print a warning message
pub fn warn(text: &str) {
    println!("{} {}", "⚠".yellow().bold(), text.yellow());
}

/// Print an error message
pub fn error(text: &str) {
    eprintln!("{} {}", "✖".red().bold(), text.red());
}

/// Print a list item
pub fn list_item(text: &str) {
    println!("  {} {}", "•".dimmed(), text);
}

/// Print a newline
pub fn newline() {
    println!();
}

/// Print dimmed text
pub fn dim(text: &str) {
    println!("{}", text.dimmed());
}

/// Style text as success (green)
pub fn style_success(text: &str) -> String {
    text.green().to_string()
}

/// Style text as pending (yellow)
pub fn style_pending(text: &str) -> String {
    text.yellow().to_string()
}

/// Style text as error (red)
pub fn style_error(text: &str) -> String {
    text.red().to_string()
}

/// One line per version result.
pub fn version_result(result: &VersionResult) {
    let status = result
        .status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    let line = format!("{} {} [{}]", result.direction, result.name, status);
    if result.dry_run {
        list_item(&format!("{} {}", style_pending(&line), "(planned)".dimmed()));
    } else if result.failed {
        list_item(&style_error(&line));
    } else {
        list_item(&style_success(&line));
    }
}

/// Stage name, outcome and its version results.
pub fn stage_report(report: &StageReport) {
    let duration = format!("{:.2}s", report.duration.as_secs_f64());
    match &report.outcome {
        StageOutcome::Succeeded => success(&format!("{} ({})", report.stage, duration.dimmed())),
        StageOutcome::Failed(reason) => error(&format!("{}: {}", report.stage, reason)),
        StageOutcome::Skipped(reason) => warn(&format!("{} skipped: {}", report.stage, reason)),
        StageOutcome::RolledBack(version) => {
            warn(&format!("{} rolled back to version {}", report.stage, version))
        }
    }
    for result in &report.results {
        version_result(result);
    }
}

/// One line per history row.
pub fn run_record(run: &RunRecord) {
    let status = run
        .status_code
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    let line = format!(
        "#{} v{} {} [{}] {}",
        run.id,
        run.version,
        run.direction,
        status,
        run.ran_at.format("%Y-%m-%d %H:%M:%S")
    );
    if run.failed {
        list_item(&style_error(&line));
    } else {
        list_item(&line);
    }
}
