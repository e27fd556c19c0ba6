//! Stage file (`stages.yaml`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{CONFIG_FILE_NAME, duration_format, resolve};
use crate::error::{MigrateResult, MigrationError};
use crate::store::EnvMap;

/// Default stage file name.
pub const STAGES_FILE_NAME: &str = "stages.yaml";

/// A set of stages and their shared settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Declared stages
    pub stages: Vec<StageConfig>,

    /// Settings shared by every stage
    #[serde(default)]
    pub global: GlobalStageConfig,

    /// Directory stage paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl StagesConfig {
    /// Parse a stage file. Relative paths resolve against `base_dir`.
    pub fn from_yaml(content: &str, base_dir: impl Into<PathBuf>) -> MigrateResult<Self> {
        let mut config: StagesConfig = serde_yaml::from_str(content)?;
        config.base_dir = base_dir.into();
        for stage in &config.stages {
            if stage.name.trim().is_empty() {
                return Err(MigrationError::config("stage is missing 'name'"));
            }
        }
        if config.global.max_concurrent_stages == 0 {
            return Err(MigrationError::config("max_concurrent_stages must be at least 1"));
        }
        Ok(config)
    }

    /// Load a stage file.
    pub fn load(path: &Path) -> MigrateResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_yaml(&content, base_dir)
    }

    /// Look up a stage by name.
    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The `config.yaml` of a stage. A directory path gets the default file name.
    pub fn stage_config_file(&self, stage: &StageConfig) -> PathBuf {
        let path = resolve(&self.base_dir, &stage.config_path);
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        if is_yaml {
            path
        } else {
            path.join(CONFIG_FILE_NAME)
        }
    }
}

/// One stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique name
    pub name: String,

    /// Stage directory or its `config.yaml`
    pub config_path: PathBuf,

    /// Stages that must have applied something first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Variables layered over the stage's own config
    #[serde(default)]
    pub env: EnvMap,

    /// Variables imported from other stages
    #[serde(default)]
    pub env_from_stages: Vec<EnvImport>,

    /// Bound on the stage's whole run
    #[serde(default, with = "duration_format::option", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// What to do when the stage fails
    #[serde(default)]
    pub on_failure: OnFailure,

    /// Template deciding whether the stage runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Variables one stage takes from another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvImport {
    /// Source stage
    pub stage: String,

    /// Variable names
    #[serde(default)]
    pub vars: Vec<String>,
}

/// Failure policy of a stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Halt scheduling
    #[default]
    Stop,
    /// Keep going; dependents still face the dependency check
    Continue,
    /// Skip every transitive dependent and keep going
    SkipDependents,
}

/// Settings shared by every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalStageConfig {
    /// Lowest-precedence variables for every stage
    pub env: EnvMap,

    /// Pause between scheduling waves
    #[serde(with = "duration_format")]
    pub wait_between_stages: Duration,

    /// Stages run at once within a wave
    pub max_concurrent_stages: usize,

    /// Roll back stages advanced by a failed run
    pub rollback_on_failure: bool,
}

impl Default for GlobalStageConfig {
    fn default() -> Self {
        Self {
            env: EnvMap::new(),
            wait_between_stages: Duration::ZERO,
            max_concurrent_stages: 1,
            rollback_on_failure: false,
        }
    }
}
