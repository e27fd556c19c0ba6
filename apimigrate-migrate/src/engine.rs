//! Migration engine implementation.
//!
//! The engine runs the versions of one migration directory strictly in
//! order against one store. Each version gets a fresh local environment
//! seeded from:
//!
//! 1. the stored variables of every applied version (oldest first, first wins)
//! 2. variables extracted earlier in the same run, where not already set
//! 3. the task's own declared `env`, which overrides both
//!
//! A successful `up` records its run, stores its extracted variables and
//! marks the version applied in one store commit. A failed attempt that got
//! an HTTP response is recorded as a failed run and nothing else. Transport
//! errors and cancellation leave the store untouched.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{self, AuthRegistry};
use crate::config::{ProjectConfig, WaitConfig};
use crate::env::Env;
use crate::error::{MigrateResult, MigrationError, PartialFailure, PartialResult};
use crate::file::{MigrationFile, MigrationFileManager};
use crate::http::{self, ExecResult, HttpExecutor, RequestDefaults};
use crate::store::{Direction, EnvMap, MigrationStore, NewRun, RunRecord, Version};
use crate::wait;

/// One version's outcome. A failure may still carry the version's result.
type StepResult = Result<VersionResult, PartialFailure<Option<VersionResult>>>;

/// Configuration for the migration engine.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Path to the migrations directory.
    pub migrations_dir: PathBuf,
    /// Pause between successful migrations.
    pub migration_delay: Duration,
    /// Whether to keep response bodies in the run history.
    pub save_response_body: bool,
    /// Whether to only report what would run.
    pub dry_run: bool,
    /// Method and URL used when a request leaves them out.
    pub defaults: RequestDefaults,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("./migrations"),
            migration_delay: Duration::from_millis(crate::config::DEFAULT_MIGRATION_DELAY_MS),
            save_response_body: false,
            dry_run: false,
            defaults: RequestDefaults::default(),
        }
    }
}

impl MigrationConfig {
    /// Create a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the migrations directory.
    pub fn migrations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.migrations_dir = dir.into();
        self
    }

    /// Set the pause between migrations.
    pub fn migration_delay(mut self, delay: Duration) -> Self {
        self.migration_delay = delay;
        self
    }

    /// Keep response bodies in the run history.
    pub fn save_response_body(mut self, save: bool) -> Self {
        self.save_response_body = save;
        self
    }

    /// Enable dry-run mode.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set request defaults.
    pub fn defaults(mut self, defaults: RequestDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Derive the engine settings from a project config.
    pub fn from_project(project: &ProjectConfig) -> Self {
        Self::new()
            .migrations_dir(project.migrations_path())
            .migration_delay(project.migration_delay())
            .save_response_body(project.store.save_response_body)
    }
}

/// Outcome of one version in an `up` or `down` run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResult {
    /// Version.
    pub version: Version,
    /// Migration file name.
    pub name: String,
    /// Direction.
    pub direction: Direction,
    /// HTTP status of the main call, if one was received.
    pub status: Option<u16>,
    /// Extracted variables.
    pub env: EnvMap,
    /// Whether this version failed.
    pub failed: bool,
    /// Whether this is only a plan entry.
    pub dry_run: bool,
}

impl VersionResult {
    fn planned(file: &MigrationFile, direction: Direction) -> Self {
        Self {
            version: file.version,
            name: file.file_name().to_string(),
            direction,
            status: None,
            env: EnvMap::new(),
            failed: false,
            dry_run: true,
        }
    }

    fn executed(file: &MigrationFile, direction: Direction, exec: &ExecResult, failed: bool) -> Self {
        Self {
            version: file.version,
            name: file.file_name().to_string(),
            direction,
            status: exec.status,
            env: exec.env.clone(),
            failed,
            dry_run: false,
        }
    }
}

/// Versions an `up` or `down` would run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    /// Direction.
    pub direction: Direction,
    /// Current version when planned.
    pub current: Version,
    /// Requested target.
    pub target: Option<Version>,
    /// Files in execution order.
    pub files: Vec<MigrationFile>,
}

impl MigrationPlan {
    /// Check if there's anything to run.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Planned versions in execution order.
    pub fn versions(&self) -> Vec<Version> {
        self.files.iter().map(|f| f.version).collect()
    }

    /// Get a summary of the plan.
    pub fn summary(&self) -> String {
        if self.files.is_empty() {
            return format!("Nothing to migrate {} (current version {})", self.direction, self.current);
        }
        let versions: Vec<String> = self.versions().iter().map(Version::to_string).collect();
        format!(
            "{} migration(s) {} from version {}: {}",
            self.files.len(),
            self.direction,
            self.current,
            versions.join(", ")
        )
    }
}

/// Migration status information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    /// Highest applied version.
    pub current_version: Version,
    /// Applied versions, ascending.
    pub applied: Vec<Version>,
    /// Files an `up` would run.
    pub pending: Vec<MigrationFile>,
    /// Full run history, when requested.
    pub history: Option<Vec<RunRecord>>,
}

/// The main migration engine.
pub struct MigrationEngine {
    config: MigrationConfig,
    store: Arc<dyn MigrationStore>,
    files: MigrationFileManager,
    executor: HttpExecutor,
    env: Env,
    wait: Option<WaitConfig>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("config", &self.config)
            .field("store", &self.store.backend())
            .field("wait", &self.wait)
            .finish()
    }
}

impl MigrationEngine {
    /// Create a new migration engine.
    pub fn new(
        config: MigrationConfig,
        store: Arc<dyn MigrationStore>,
        executor: HttpExecutor,
        env: Env,
    ) -> Self {
        let files = MigrationFileManager::new(&config.migrations_dir);
        let executor = executor.with_base_dir(&config.migrations_dir);
        Self {
            config,
            store,
            files,
            executor,
            env,
            wait: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Start building an engine from a project config.
    pub fn builder(project: &ProjectConfig) -> EngineBuilder<'_> {
        EngineBuilder::new(project)
    }

    /// Run a health check before every `up`/`down`.
    pub fn with_wait(mut self, wait: Option<WaitConfig>) -> Self {
        self.wait = wait;
        self
    }

    /// Abort HTTP calls, delays and waits when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.executor = self.executor.with_cancellation(token.clone());
        self.cancel = token;
        self
    }

    /// Switch dry-run mode.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.config.dry_run = dry_run;
    }

    /// The engine configuration.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn MigrationStore> {
        &self.store
    }

    /// The run-wide environment.
    pub fn env(&self) -> &Env {
        &self.env
    }

    /// The migration file manager.
    pub fn files(&self) -> &MigrationFileManager {
        &self.files
    }

    /// Versions `up` would apply: files above the current version, up to
    /// `target` (all of them when `target` is absent or not positive).
    pub async fn plan_up(&self, target: Option<Version>) -> MigrateResult<MigrationPlan> {
        let current = self.store.current_version().await?;
        let limit = target.filter(|t| *t > 0);
        let files = self
            .files
            .list_migrations()
            .await?
            .into_iter()
            .filter(|f| f.version > current && limit.is_none_or(|t| f.version <= t))
            .collect();

        Ok(MigrationPlan {
            direction: Direction::Up,
            current,
            target,
            files,
        })
    }

    /// Versions `down` would roll back, newest first.
    pub async fn plan_down(&self, target: Version) -> MigrateResult<MigrationPlan> {
        let current = self.store.current_version().await?;
        if target < 0 || target > current {
            return Err(MigrationError::InvalidTarget { target, current });
        }

        let available = self.files.list_migrations().await?;
        let mut files = Vec::new();
        for version in self.store.list_applied().await?.into_iter().rev() {
            if version <= target {
                continue;
            }
            let file = available
                .iter()
                .find(|f| f.version == version)
                .cloned()
                .ok_or_else(|| {
                    MigrationError::invalid_migration(format!(
                        "version {version} is applied but has no migration file"
                    ))
                })?;
            files.push(file);
        }

        Ok(MigrationPlan {
            direction: Direction::Down,
            current,
            target: Some(target),
            files,
        })
    }

    /// Apply pending migrations up to `target`.
    ///
    /// On failure the error is returned with every version processed so far,
    /// the failed one last.
    pub async fn up(&self, target: Option<Version>) -> PartialResult<Vec<VersionResult>> {
        let plan = self.plan_up(target).await?;
        if self.config.dry_run {
            info!(summary = %plan.summary(), "Dry run");
            return Ok(plan
                .files
                .iter()
                .map(|f| VersionResult::planned(f, Direction::Up))
                .collect());
        }
        if plan.is_empty() {
            info!(current = plan.current, "No migrations to apply");
            return Ok(Vec::new());
        }

        self.wait_until_ready().await?;

        let mut results = Vec::with_capacity(plan.files.len());
        let mut session = EnvMap::new();
        for (index, file) in plan.files.iter().enumerate() {
            if index > 0 {
                if let Err(e) = self.pause().await {
                    return Err(PartialFailure::new(results, e));
                }
            }

            match self.up_one(file, &session).await {
                Ok(result) => {
                    session.extend(result.env.clone());
                    results.push(result);
                }
                Err(failure) => {
                    let PartialFailure { partial, error } = failure;
                    if let Some(result) = partial {
                        results.push(result);
                    }
                    warn!(version = file.version, error = %error, "Migration failed");
                    return Err(PartialFailure::new(results, error));
                }
            }
        }

        info!(count = results.len(), "Migrations applied");
        Ok(results)
    }

    async fn up_one(
        &self,
        file: &MigrationFile,
        session: &EnvMap,
    ) -> StepResult {
        let start = Instant::now();
        let task = file.load().await?;
        info!(version = file.version, name = %task.up.name, "Applying migration");

        let mut env = self.env.fork();
        env.extend_local(self.store.applied_env().await?);
        env.fill_local(session.clone());
        for (key, value) in &task.up.env {
            let value = env.render_strict(value).await?;
            env.set_local(key.clone(), value);
        }

        match self
            .executor
            .execute_up(&task.up, &env, &self.config.defaults)
            .await
        {
            Ok(exec) => {
                let run = self.run_record(file.version, Direction::Up, &exec, false);
                self.store.commit_up(&run, &exec.env).await?;
                debug!(
                    version = file.version,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Migration committed"
                );
                Ok(VersionResult::executed(file, Direction::Up, &exec, false))
            }
            Err(failure) => self.record_failure(file, Direction::Up, failure).await,
        }
    }

    /// Roll back applied versions above `target`, newest first.
    pub async fn down(&self, target: Version) -> PartialResult<Vec<VersionResult>> {
        let plan = self.plan_down(target).await?;
        if self.config.dry_run {
            info!(summary = %plan.summary(), "Dry run");
            return Ok(plan
                .files
                .iter()
                .map(|f| VersionResult::planned(f, Direction::Down))
                .collect());
        }
        if plan.is_empty() {
            info!(current = plan.current, target, "Already at target version");
            return Ok(Vec::new());
        }

        self.wait_until_ready().await?;

        let mut results = Vec::with_capacity(plan.files.len());
        for (index, file) in plan.files.iter().enumerate() {
            if index > 0 {
                if let Err(e) = self.pause().await {
                    return Err(PartialFailure::new(results, e));
                }
            }

            match self.down_one(file).await {
                Ok(result) => results.push(result),
                Err(failure) => {
                    let PartialFailure { partial, error } = failure;
                    if let Some(result) = partial {
                        results.push(result);
                    }
                    warn!(version = file.version, error = %error, "Rollback failed");
                    return Err(PartialFailure::new(results, error));
                }
            }
        }

        info!(count = results.len(), target, "Migrations rolled back");
        Ok(results)
    }

    async fn down_one(&self, file: &MigrationFile) -> StepResult {
        let task = file.load().await?;
        let down = task.down.ok_or_else(|| {
            MigrationError::invalid_migration(format!(
                "{} has no down section",
                file.file_name()
            ))
        })?;
        info!(version = file.version, name = %down.name, "Rolling back migration");

        let stored = match self.store.load_stored_env(file.version).await? {
            Some(env) => env,
            None => {
                debug!(version = file.version, "No stored env, using last run snapshot");
                self.store
                    .latest_run_env(file.version)
                    .await?
                    .unwrap_or_default()
            }
        };

        // Other applied versions first, then this version's own variables.
        let mut env = self.env.fork();
        env.extend_local(self.store.applied_env().await?);
        env.extend_local(stored.clone());
        for (key, value) in &down.env {
            if stored.contains_key(key) {
                continue;
            }
            let value = env.render_strict(value).await?;
            env.set_local(key.clone(), value);
        }

        match self.executor.execute_down(&down, &mut env).await {
            Ok(exec) => {
                let run = self.run_record(file.version, Direction::Down, &exec, false);
                self.store.commit_down(&run).await?;
                Ok(VersionResult::executed(file, Direction::Down, &exec, false))
            }
            Err(failure) => self.record_failure(file, Direction::Down, failure).await,
        }
    }

    async fn record_failure(
        &self,
        file: &MigrationFile,
        direction: Direction,
        failure: PartialFailure<ExecResult>,
    ) -> StepResult {
        let PartialFailure { partial: exec, error } = failure;
        if exec.status.is_none() {
            return Err(PartialFailure::new(None, error));
        }

        let run = self.run_record(file.version, direction, &exec, true);
        if let Err(store_error) = self.store.record_run(&run).await {
            warn!(version = file.version, error = %store_error, "Could not record failed run");
            return Err(PartialFailure::new(None, store_error));
        }
        let result = VersionResult::executed(file, direction, &exec, true);
        Err(PartialFailure::new(Some(result), error))
    }

    fn run_record(&self, version: Version, direction: Direction, exec: &ExecResult, failed: bool) -> NewRun {
        NewRun {
            version,
            direction,
            status_code: exec.status,
            body: self
                .config
                .save_response_body
                .then(|| exec.body.clone()),
            env: Some(exec.env.clone()),
            failed,
        }
    }

    async fn pause(&self) -> MigrateResult<()> {
        if self.config.migration_delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(MigrationError::Cancelled),
            _ = tokio::time::sleep(self.config.migration_delay) => Ok(()),
        }
    }

    async fn wait_until_ready(&self) -> MigrateResult<()> {
        match &self.wait {
            Some(wait) => {
                wait::wait_until_ready(self.executor.client(), wait, &self.env, &self.cancel).await
            }
            None => Ok(()),
        }
    }

    /// Get migration status.
    pub async fn status(&self, with_history: bool) -> MigrateResult<MigrationStatus> {
        let plan = self.plan_up(None).await?;
        let history = if with_history {
            Some(self.store.list_runs().await?)
        } else {
            None
        };
        Ok(MigrationStatus {
            current_version: plan.current,
            applied: self.store.list_applied().await?,
            pending: plan.files,
            history,
        })
    }

    /// Variables exported by every applied version.
    pub async fn exported_env(&self) -> MigrateResult<EnvMap> {
        self.store.applied_env().await
    }
}

/// Assembles a [`MigrationEngine`] from a [`ProjectConfig`].
///
/// Global variables are layered lowest first: [`EngineBuilder::base_env`],
/// the config's `env[]`, then [`EngineBuilder::override_env`].
pub struct EngineBuilder<'a> {
    project: &'a ProjectConfig,
    store: Option<Arc<dyn MigrationStore>>,
    registry: Option<Arc<AuthRegistry>>,
    base_env: EnvMap,
    override_env: EnvMap,
    cancel: Option<CancellationToken>,
    dry_run: bool,
}

impl<'a> EngineBuilder<'a> {
    fn new(project: &'a ProjectConfig) -> Self {
        Self {
            project,
            store: None,
            registry: None,
            base_env: EnvMap::new(),
            override_env: EnvMap::new(),
            cancel: None,
            dry_run: false,
        }
    }

    /// Store to run against. Required.
    pub fn store(mut self, store: Arc<dyn MigrationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Auth registry. Defaults to one with the built-in providers.
    pub fn registry(mut self, registry: Arc<AuthRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Variables below the config's own `env[]`.
    pub fn base_env(mut self, env: EnvMap) -> Self {
        self.base_env = env;
        self
    }

    /// Variables above the config's own `env[]`.
    pub fn override_env(mut self, env: EnvMap) -> Self {
        self.override_env = env;
        self
    }

    /// Cancellation token.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Dry-run mode.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Build the engine. Auth providers are constructed here, so unknown
    /// provider types fail before anything runs; tokens are only acquired
    /// when a request first needs them.
    pub async fn build(self) -> MigrateResult<MigrationEngine> {
        let project = self.project;
        let store = self
            .store
            .ok_or_else(|| MigrationError::config("engine requires a store"))?;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(AuthRegistry::with_builtins()));

        let mut global = self.base_env;
        global.extend(project.global_env()?);
        global.extend(self.override_env);
        let mut env = Env::with_global(global);

        let client = http::build_client(&project.client)?;
        for entry in &project.auth {
            let raw = render_json(&entry.config, &env).await?;
            let method = registry.build(&entry.kind, raw)?;
            auth::embed_lazy(&mut env, &registry, &entry.name, method, client.clone());
        }

        let executor = HttpExecutor::new(client).with_masking(project.logging.mask_sensitive);
        let config = MigrationConfig::from_project(project).dry_run(self.dry_run);
        let mut engine = MigrationEngine::new(config, store, executor, env)
            .with_wait(project.wait.clone());
        if let Some(token) = self.cancel {
            engine = engine.with_cancellation(token);
        }
        Ok(engine)
    }
}

/// Render every string inside a JSON value (lenient).
async fn render_json(value: &serde_json::Value, env: &Env) -> MigrateResult<serde_json::Value> {
    let mut rendered = if value.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        value.clone()
    };

    let mut pointers = Vec::new();
    collect_strings(&rendered, String::new(), &mut pointers);
    for pointer in pointers {
        if let Some(serde_json::Value::String(s)) = rendered.pointer_mut(&pointer) {
            *s = env.render_lenient(s).await?;
        }
    }
    Ok(rendered)
}

fn collect_strings(value: &serde_json::Value, prefix: String, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(_) => out.push(prefix),
        serde_json::Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_strings(item, format!("{prefix}/{i}"), out);
            }
        }
        serde_json::Value::Object(map) => {
            for (key, item) in map {
                let escaped = key.replace('~', "~0").replace('/', "~1");
                collect_strings(item, format!("{prefix}/{escaped}"), out);
            }
        }
        _ => {}
    }
}
