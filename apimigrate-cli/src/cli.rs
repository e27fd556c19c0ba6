//! CLI argument definitions using clap.

use std::path::PathBuf;

use apimigrate::config::CONFIG_FILE_NAME;
use apimigrate::stage::STAGES_FILE_NAME;
use apimigrate::{StageSelection, Version};
use clap::{Args, Parser, Subcommand};

/// apimigrate - Versioned HTTP API migrations
#[derive(Parser, Debug)]
#[command(name = "apimigrate")]
#[command(author = "Pegasus Heavy Industries LLC")]
#[command(version)]
#[command(about = "apimigrate - Versioned HTTP API migrations", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the migration config file
    #[arg(
        short,
        long,
        global = true,
        env = "APIMIGRATE_CONFIG",
        default_value = CONFIG_FILE_NAME
    )]
    pub config: PathBuf,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply pending migrations
    Up(UpArgs),

    /// Roll back applied migrations
    Down(DownArgs),

    /// Show applied and pending migrations
    Status(StatusArgs),

    /// Multi-stage migration commands
    Stages(StagesArgs),
}

// =============================================================================
// Single-directory commands
// =============================================================================

/// Arguments for the `up` command
#[derive(Args, Debug)]
pub struct UpArgs {
    /// Highest version to apply (defaults to the latest)
    #[arg(long)]
    pub to: Option<Version>,

    /// Print the plan without calling any API
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the `down` command
#[derive(Args, Debug)]
pub struct DownArgs {
    /// Version to roll back to (0 rolls back everything)
    #[arg(long)]
    pub to: Version,

    /// Print the plan without calling any API
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for the `status` command
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// List applied versions and pending files
    #[arg(short, long)]
    pub verbose: bool,

    /// Include the run history
    #[arg(long)]
    pub history: bool,
}

// =============================================================================
// Stages command
// =============================================================================

/// Arguments for the `stages` command
#[derive(Args, Debug)]
pub struct StagesArgs {
    /// Path to the stages file
    #[arg(short, long, default_value = STAGES_FILE_NAME)]
    pub file: PathBuf,

    #[command(subcommand)]
    pub command: StagesSubcommand,
}

/// Stages subcommands
#[derive(Subcommand, Debug)]
pub enum StagesSubcommand {
    /// Apply pending migrations of every selected stage
    Up(StageRunArgs),

    /// Roll back every selected stage to version 0
    Down(StageRunArgs),

    /// Show the status of every selected stage
    Status(StageStatusArgs),

    /// Check stage and migration files without touching any store
    Validate,
}

/// Stage selection flags
#[derive(Args, Debug, Clone, Default)]
pub struct SelectionArgs {
    /// First stage to include, in dependency order
    #[arg(long)]
    pub from: Option<String>,

    /// Last stage to include, in dependency order
    #[arg(long)]
    pub to: Option<String>,

    /// Run only this stage
    #[arg(long, conflicts_with_all = ["from", "to"])]
    pub stage: Option<String>,
}

impl From<SelectionArgs> for StageSelection {
    fn from(args: SelectionArgs) -> Self {
        StageSelection {
            from: args.from,
            to: args.to,
            stage: args.stage,
        }
    }
}

/// Arguments for `stages up` and `stages down`
#[derive(Args, Debug)]
pub struct StageRunArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Print the plan without calling any API
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for `stages status`
#[derive(Args, Debug)]
pub struct StageStatusArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Include the run history
    #[arg(long)]
    pub history: bool,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_stages_selection() {
        let cli = Cli::parse_from([
            "apimigrate",
            "stages",
            "--file",
            "deploy/stages.yaml",
            "up",
            "--from",
            "identity",
            "--dry-run",
        ]);
        let Command::Stages(args) = cli.command else {
            panic!("expected stages command");
        };
        assert_eq!(args.file, PathBuf::from("deploy/stages.yaml"));
        let StagesSubcommand::Up(run) = args.command else {
            panic!("expected stages up");
        };
        assert!(run.dry_run);
        let selection = StageSelection::from(run.selection);
        assert_eq!(selection.from.as_deref(), Some("identity"));
        assert_eq!(selection.stage, None);
    }

    #[test]
    fn test_down_requires_target() {
        assert!(Cli::try_parse_from(["apimigrate", "down"]).is_err());
        let cli = Cli::try_parse_from(["apimigrate", "--config", "a.yaml", "down", "--to", "0"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("a.yaml"));
        assert!(matches!(cli.command, Command::Down(DownArgs { to: 0, dry_run: false })));
    }

    #[test]
    fn test_stage_conflicts_with_range() {
        let parsed = Cli::try_parse_from([
            "apimigrate", "stages", "up", "--stage", "billing", "--from", "identity",
        ]);
        assert!(parsed.is_err());
    }
}
