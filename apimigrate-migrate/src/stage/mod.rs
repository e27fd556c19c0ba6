//! Multi-stage orchestration.
//!
//! A stage is a migration directory with its own `config.yaml` and its own
//! store. [`Orchestrator`] runs stages in dependency order, handing variables
//! extracted by one stage to the stages that import them.
//!
//! Stages are scheduled in waves: every stage in a wave has all of its
//! dependencies in earlier waves, so up to `max_concurrent_stages` of them
//! may run at once. Whether a dependency is satisfied is decided by its
//! store: a dependency that has applied at least one version counts as
//! executed, whether that happened in this invocation or an earlier one.

mod config;
mod graph;

pub use config::{EnvImport, GlobalStageConfig, OnFailure, STAGES_FILE_NAME, StageConfig, StagesConfig};
pub use graph::{StageGraph, StageSelection};

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::AuthRegistry;
use crate::config::{ProjectConfig, format_duration};
use crate::engine::{MigrationEngine, MigrationStatus, VersionResult};
use crate::env::Env;
use crate::error::{MigrateResult, MigrationError, PartialFailure, PartialResult};
use crate::file::MigrationFile;
use crate::store::{EnvMap, MemoryStore, MigrationStore, StoreFactory, Version};

/// How a stage ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Every planned version ran (or was planned, in a dry run).
    Succeeded,
    /// The stage failed with this error.
    Failed(String),
    /// The stage did not run.
    Skipped(String),
    /// The stage was rolled back to this version after a failed run.
    RolledBack(Version),
}

/// Result of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    /// Stage name.
    pub stage: String,
    /// Outcome.
    pub outcome: StageOutcome,
    /// Per-version results.
    pub results: Vec<VersionResult>,
    /// Wall time.
    pub duration: Duration,
}

impl StageReport {
    fn skipped(stage: &str, reason: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            outcome: StageOutcome::Skipped(reason.into()),
            results: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Check if the stage failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, StageOutcome::Failed(_))
    }
}

/// Migration status of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStatus {
    /// Stage name.
    pub stage: String,
    /// Engine status.
    pub status: MigrationStatus,
}

/// Result of validating one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageValidation {
    /// Stage name.
    pub stage: String,
    /// The stage's `config.yaml`.
    pub config_file: PathBuf,
    /// Discovered migration files.
    pub migrations: Vec<MigrationFile>,
}

/// Bookkeeping for one stage run.
struct StageRun {
    index: usize,
    results: Vec<VersionResult>,
    error: Option<MigrationError>,
    skipped: Option<String>,
    exports: Option<EnvMap>,
    baseline: Option<Version>,
}

impl StageRun {
    fn new(index: usize) -> Self {
        Self {
            index,
            results: Vec::new(),
            error: None,
            skipped: None,
            exports: None,
            baseline: None,
        }
    }
}

/// Runs a graph of stages.
pub struct Orchestrator {
    config: StagesConfig,
    graph: StageGraph,
    factory: Arc<dyn StoreFactory>,
    registry: Arc<AuthRegistry>,
    cancel: CancellationToken,
    dry_run: bool,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stages", &self.graph.ordered_names())
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl Orchestrator {
    /// Create an orchestrator. The stage graph is validated here.
    pub fn new(config: StagesConfig, factory: Arc<dyn StoreFactory>) -> MigrateResult<Self> {
        let graph = StageGraph::new(&config)?;
        Ok(Self {
            config,
            graph,
            factory,
            registry: Arc::new(AuthRegistry::with_builtins()),
            cancel: CancellationToken::new(),
            dry_run: false,
        })
    }

    /// Load `stages.yaml` and create an orchestrator.
    pub fn load(path: &Path, factory: Arc<dyn StoreFactory>) -> MigrateResult<Self> {
        Self::new(StagesConfig::load(path)?, factory)
    }

    /// Use a custom auth registry for every stage.
    pub fn with_registry(mut self, registry: Arc<AuthRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Abort every stage when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Only plan, never call or write.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// The stage file.
    pub fn config(&self) -> &StagesConfig {
        &self.config
    }

    /// The dependency graph.
    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Apply every pending version of the selected stages.
    ///
    /// On failure the error is returned with the reports of every stage
    /// that was scheduled, including any rollback reports.
    pub async fn up(&self, selection: &StageSelection) -> PartialResult<Vec<StageReport>> {
        let selected = self.graph.select(selection)?;
        let waves = self.graph.waves(&selected);
        let limit = self.config.global.max_concurrent_stages.max(1);
        info!(stages = selected.len(), waves = waves.len(), "Running stages up");

        let mut reports = Vec::new();
        let mut exports: HashMap<usize, EnvMap> = HashMap::new();
        let mut skipped: BTreeSet<usize> = BTreeSet::new();
        let mut advanced: Vec<(usize, Version)> = Vec::new();
        let mut first_error: Option<MigrationError> = None;

        for (wave_number, wave) in waves.iter().enumerate() {
            if wave_number > 0 {
                if let Err(e) = self.pause_between_stages().await {
                    first_error.get_or_insert(e);
                    break;
                }
            }

            let mut runnable = Vec::new();
            for &index in wave {
                if skipped.contains(&index) {
                    info!(stage = self.graph.name(index), "Skipping stage after dependency failure");
                    reports.push(StageReport::skipped(self.graph.name(index), "a dependency failed"));
                } else {
                    runnable.push(index);
                }
            }

            let snapshot = &exports;
            let mut runs: Vec<(StageRun, Duration)> = stream::iter(runnable)
                .map(|index| self.timed(index, self.up_stage(index, snapshot)))
                .buffer_unordered(limit)
                .collect()
                .await;
            runs.sort_by_key(|(run, _)| wave.iter().position(|&i| i == run.index));

            let mut halt = false;
            for (run, duration) in runs {
                let name = self.graph.name(run.index).to_string();
                if let Some(baseline) = run.baseline {
                    advanced.push((run.index, baseline));
                }
                let outcome = match (run.error, run.skipped) {
                    (Some(error), _) => {
                        let policy = self.config.stages[run.index].on_failure;
                        warn!(stage = %name, error = %error, policy = ?policy, "Stage failed");
                        match policy {
                            OnFailure::Stop => halt = true,
                            OnFailure::Continue => {}
                            OnFailure::SkipDependents => {
                                skipped.extend(self.graph.transitive_dependents(run.index));
                            }
                        }
                        if matches!(error, MigrationError::Cancelled) {
                            halt = true;
                        }
                        let outcome = StageOutcome::Failed(error.to_string());
                        first_error.get_or_insert(error);
                        outcome
                    }
                    (None, Some(reason)) => StageOutcome::Skipped(reason),
                    (None, None) => {
                        if let Some(env) = run.exports {
                            exports.insert(run.index, env);
                        }
                        StageOutcome::Succeeded
                    }
                };
                reports.push(StageReport {
                    stage: name,
                    outcome,
                    results: run.results,
                    duration,
                });
            }
            if halt {
                break;
            }
        }

        let Some(error) = first_error else {
            return Ok(reports);
        };
        if self.config.global.rollback_on_failure && !self.dry_run {
            reports.extend(self.rollback(advanced).await);
        }
        Err(PartialFailure::new(reports, error))
    }

    async fn up_stage(&self, index: usize, exports: &HashMap<usize, EnvMap>) -> StageRun {
        let mut run = StageRun::new(index);
        let stage = &self.config.stages[index];
        let attempt = match stage.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.attempt_up(index, exports, &mut run)).await {
                    Ok(result) => result,
                    Err(_) => Err(PartialFailure::new(
                        Vec::new(),
                        MigrationError::Timeout(format!(
                            "stage '{}' exceeded {}",
                            stage.name,
                            format_duration(limit)
                        )),
                    )),
                }
            }
            None => self.attempt_up(index, exports, &mut run).await,
        };
        match attempt {
            Ok(results) => run.results = results,
            Err(failure) => {
                run.results = failure.partial;
                run.error = Some(failure.error);
            }
        }
        run
    }

    async fn attempt_up(
        &self,
        index: usize,
        exports: &HashMap<usize, EnvMap>,
        run: &mut StageRun,
    ) -> PartialResult<Vec<VersionResult>> {
        let stage = &self.config.stages[index];
        let project = self.load_project(index)?;
        let overrides = self.stage_env(index, exports).await?;
        if let Some(reason) = self.skip_reason(index, &project, &overrides).await? {
            info!(stage = %stage.name, reason = %reason, "Skipping stage");
            run.skipped = Some(reason);
            return Ok(Vec::new());
        }
        self.check_dependencies(index, exports).await?;

        info!(stage = %stage.name, "Running stage");
        let store = self.open_store(&project).await?;
        let result = self.up_on(&project, &store, overrides, run).await;
        self.release(index, &store).await;
        result
    }

    async fn up_on(
        &self,
        project: &ProjectConfig,
        store: &Arc<dyn MigrationStore>,
        overrides: EnvMap,
        run: &mut StageRun,
    ) -> PartialResult<Vec<VersionResult>> {
        let engine = self.engine(project, Arc::clone(store), overrides, self.dry_run).await?;
        run.baseline = Some(store.current_version().await?);

        let results = engine.up(None).await?;
        run.exports = Some(engine.exported_env().await?);
        Ok(results)
    }

    /// Roll back every selected stage to version 0, in reverse
    /// topological order. Stops at the first failure.
    pub async fn down(&self, selection: &StageSelection) -> PartialResult<Vec<StageReport>> {
        let mut selected = self.graph.select(selection)?;
        selected.reverse();
        info!(stages = selected.len(), "Running stages down");

        let mut reports = Vec::new();
        for (position, index) in selected.into_iter().enumerate() {
            if position > 0 {
                if let Err(e) = self.pause_between_stages().await {
                    return Err(PartialFailure::new(reports, e));
                }
            }

            let (run, duration) = self.timed(index, self.down_stage(index)).await;
            let name = self.graph.name(index).to_string();
            let (outcome, error) = match (run.error, run.skipped) {
                (Some(error), _) => (StageOutcome::Failed(error.to_string()), Some(error)),
                (None, Some(reason)) => (StageOutcome::Skipped(reason), None),
                (None, None) => (StageOutcome::Succeeded, None),
            };
            reports.push(StageReport {
                stage: name,
                outcome,
                results: run.results,
                duration,
            });
            if let Some(error) = error {
                return Err(PartialFailure::new(reports, error));
            }
        }
        Ok(reports)
    }

    async fn down_stage(&self, index: usize) -> StageRun {
        let mut run = StageRun::new(index);
        let stage = &self.config.stages[index];
        let attempt = match stage.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.attempt_down(index, &mut run)).await {
                Ok(result) => result,
                Err(_) => Err(PartialFailure::new(
                    Vec::new(),
                    MigrationError::Timeout(format!(
                        "stage '{}' exceeded {}",
                        stage.name,
                        format_duration(limit)
                    )),
                )),
            },
            None => self.attempt_down(index, &mut run).await,
        };
        match attempt {
            Ok(results) => run.results = results,
            Err(failure) => {
                run.results = failure.partial;
                run.error = Some(failure.error);
            }
        }
        run
    }

    async fn attempt_down(&self, index: usize, run: &mut StageRun) -> PartialResult<Vec<VersionResult>> {
        let stage = &self.config.stages[index];
        let project = self.load_project(index)?;
        let overrides = self.stage_env(index, &HashMap::new()).await?;
        if let Some(reason) = self.skip_reason(index, &project, &overrides).await? {
            run.skipped = Some(reason);
            return Ok(Vec::new());
        }

        info!(stage = %stage.name, "Rolling back stage");
        let store = self.open_store(&project).await?;
        let result = match self.engine(&project, Arc::clone(&store), overrides, self.dry_run).await {
            Ok(engine) => engine.down(0).await,
            Err(e) => Err(e.into()),
        };
        self.release(index, &store).await;
        result
    }

    /// Undo what a failed run applied, newest stage first.
    async fn rollback(&self, advanced: Vec<(usize, Version)>) -> Vec<StageReport> {
        let mut reports = Vec::new();
        for (index, baseline) in advanced.into_iter().rev() {
            let name = self.graph.name(index).to_string();
            let started = Instant::now();
            match self.rollback_stage(index, baseline).await {
                Ok(None) => debug!(stage = %name, "Nothing to roll back"),
                Ok(Some(results)) => {
                    info!(stage = %name, to = baseline, "Stage rolled back");
                    reports.push(StageReport {
                        stage: name,
                        outcome: StageOutcome::RolledBack(baseline),
                        results,
                        duration: started.elapsed(),
                    });
                }
                Err(failure) => {
                    warn!(stage = %name, error = %failure.error, "Rollback failed");
                    reports.push(StageReport {
                        stage: name,
                        outcome: StageOutcome::Failed(format!("rollback: {}", failure.error)),
                        results: failure.partial,
                        duration: started.elapsed(),
                    });
                }
            }
        }
        reports
    }

    async fn rollback_stage(
        &self,
        index: usize,
        baseline: Version,
    ) -> Result<Option<Vec<VersionResult>>, PartialFailure<Vec<VersionResult>>> {
        let project = self.load_project(index)?;
        let overrides = self.stage_env(index, &HashMap::new()).await?;
        let store = self.open_store(&project).await?;
        let result = self.rollback_on(&project, &store, overrides, baseline).await;
        self.release(index, &store).await;
        result
    }

    async fn rollback_on(
        &self,
        project: &ProjectConfig,
        store: &Arc<dyn MigrationStore>,
        overrides: EnvMap,
        baseline: Version,
    ) -> Result<Option<Vec<VersionResult>>, PartialFailure<Vec<VersionResult>>> {
        if store.current_version().await? <= baseline {
            return Ok(None);
        }
        let engine = self.engine(project, Arc::clone(store), overrides, false).await?;
        engine.down(baseline).await.map(Some)
    }

    /// Status of every selected stage, in topological order.
    pub async fn status(
        &self,
        selection: &StageSelection,
        with_history: bool,
    ) -> MigrateResult<Vec<StageStatus>> {
        let mut statuses = Vec::new();
        for index in self.graph.select(selection)? {
            let project = self.load_project(index)?;
            let store = self.open_store(&project).await?;
            let status = match self.engine(&project, Arc::clone(&store), EnvMap::new(), false).await {
                Ok(engine) => engine.status(with_history).await,
                Err(e) => Err(e),
            };
            self.release(index, &store).await;
            statuses.push(StageStatus {
                stage: self.graph.name(index).to_string(),
                status: status?,
            });
        }
        Ok(statuses)
    }

    /// Load every stage config and parse every migration file without
    /// opening any store.
    pub async fn validate(&self) -> MigrateResult<Vec<StageValidation>> {
        let mut validations = Vec::new();
        for &index in self.graph.order() {
            let stage = &self.config.stages[index];
            let config_file = self.config.stage_config_file(stage);
            let project = self.load_project(index)?;
            let engine = self
                .engine(&project, Arc::new(MemoryStore::new()), stage.env.clone(), true)
                .await?;

            let migrations = engine.files().list_migrations().await?;
            for file in &migrations {
                file.load().await.map_err(|e| {
                    MigrationError::invalid_migration(format!("{}: {}", file.path.display(), e))
                })?;
            }
            debug!(stage = %stage.name, migrations = migrations.len(), "Stage is valid");
            validations.push(StageValidation {
                stage: stage.name.clone(),
                config_file,
                migrations,
            });
        }
        Ok(validations)
    }

    /// Open a stage's store. Every open is paired with [`Self::release`].
    async fn open_store(&self, project: &ProjectConfig) -> MigrateResult<Arc<dyn MigrationStore>> {
        self.factory.open(&project.store, &project.base_dir).await
    }

    async fn release(&self, index: usize, store: &Arc<dyn MigrationStore>) {
        if let Err(e) = store.close().await {
            warn!(stage = self.graph.name(index), error = %e, "Failed to close store");
        }
    }

    fn load_project(&self, index: usize) -> MigrateResult<ProjectConfig> {
        let stage = &self.config.stages[index];
        ProjectConfig::load(&self.config.stage_config_file(stage))
    }

    async fn engine(
        &self,
        project: &ProjectConfig,
        store: Arc<dyn MigrationStore>,
        overrides: EnvMap,
        dry_run: bool,
    ) -> MigrateResult<MigrationEngine> {
        MigrationEngine::builder(project)
            .store(store)
            .registry(Arc::clone(&self.registry))
            .base_env(self.config.global.env.clone())
            .override_env(overrides)
            .cancellation(self.cancel.child_token())
            .dry_run(dry_run)
            .build()
            .await
    }

    /// Per-stage `env` plus imported variables.
    async fn stage_env(&self, index: usize, exports: &HashMap<usize, EnvMap>) -> MigrateResult<EnvMap> {
        let stage = &self.config.stages[index];
        let mut env = stage.env.clone();
        for import in &stage.env_from_stages {
            let source = self.graph.index_of(&import.stage)?;
            let available = match exports.get(&source) {
                Some(vars) => vars.clone(),
                None => self.stored_exports(source).await?,
            };
            for var in &import.vars {
                match available.get(var) {
                    Some(value) => {
                        env.insert(var.clone(), value.clone());
                    }
                    None => warn!(
                        stage = %stage.name,
                        from = %import.stage,
                        var = %var,
                        "Imported variable is not available"
                    ),
                }
            }
        }
        Ok(env)
    }

    /// Variables a stage exported in earlier invocations.
    async fn stored_exports(&self, index: usize) -> MigrateResult<EnvMap> {
        let project = self.load_project(index)?;
        let store = self.open_store(&project).await?;
        let env = store.applied_env().await;
        self.release(index, &store).await;
        env
    }

    async fn check_dependencies(&self, index: usize, exports: &HashMap<usize, EnvMap>) -> MigrateResult<()> {
        for dependency in self.graph.dependencies(index) {
            if exports.contains_key(&dependency) {
                continue;
            }
            let project = self.load_project(dependency)?;
            let store = self.open_store(&project).await?;
            let applied = store.list_applied().await;
            self.release(dependency, &store).await;
            if applied?.is_empty() {
                return Err(MigrationError::DependencyNotExecuted {
                    stage: self.graph.name(index).to_string(),
                    dependency: self.graph.name(dependency).to_string(),
                });
            }
        }
        Ok(())
    }

    async fn skip_reason(
        &self,
        index: usize,
        project: &ProjectConfig,
        overrides: &EnvMap,
    ) -> MigrateResult<Option<String>> {
        let Some(condition) = &self.config.stages[index].condition else {
            return Ok(None);
        };
        let mut global = self.config.global.env.clone();
        global.extend(project.global_env()?);
        global.extend(overrides.clone());

        let rendered = Env::with_global(global).render_lenient(condition).await?;
        if is_falsy(&rendered) {
            Ok(Some(format!("condition '{condition}' is '{}'", rendered.trim())))
        } else {
            Ok(None)
        }
    }

    async fn pause_between_stages(&self) -> MigrateResult<()> {
        let pause = self.config.global.wait_between_stages;
        if pause.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(MigrationError::Cancelled),
            _ = tokio::time::sleep(pause) => Ok(()),
        }
    }

    async fn timed<F>(&self, index: usize, run: F) -> (StageRun, Duration)
    where
        F: std::future::Future<Output = StageRun>,
    {
        let started = Instant::now();
        let run = run.await;
        let elapsed = started.elapsed();
        debug!(stage = self.graph.name(index), elapsed_ms = elapsed.as_millis() as u64, "Stage finished");
        (run, elapsed)
    }
}

fn is_falsy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "false" | "0" | "no" | "off"
    )
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::Router;
    use axum::extract::Path as UrlPath;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    use std::sync::atomic::{AtomicIsize, Ordering};

    use super::*;
    use crate::config::StoreConfig;
    use crate::store::{NewRun, RunRecord};
    use crate::test_support::serve;

    /// One in-memory store per stage directory, counting handles that were
    /// opened and not yet closed.
    #[derive(Default)]
    struct MemoryFactory {
        stores: Mutex<HashMap<PathBuf, Arc<MemoryStore>>>,
        open_handles: Arc<AtomicIsize>,
    }

    struct TrackedStore {
        inner: Arc<MemoryStore>,
        open_handles: Arc<AtomicIsize>,
    }

    #[async_trait]
    impl MigrationStore for TrackedStore {
        fn backend(&self) -> &'static str {
            self.inner.backend()
        }

        async fn initialize(&self) -> MigrateResult<()> {
            self.inner.initialize().await
        }

        async fn list_applied(&self) -> MigrateResult<Vec<Version>> {
            self.inner.list_applied().await
        }

        async fn apply(&self, version: Version) -> MigrateResult<()> {
            self.inner.apply(version).await
        }

        async fn remove(&self, version: Version) -> MigrateResult<()> {
            self.inner.remove(version).await
        }

        async fn record_run(&self, run: &NewRun) -> MigrateResult<i64> {
            self.inner.record_run(run).await
        }

        async fn list_runs(&self) -> MigrateResult<Vec<RunRecord>> {
            self.inner.list_runs().await
        }

        async fn insert_stored_env(&self, version: Version, env: &EnvMap) -> MigrateResult<()> {
            self.inner.insert_stored_env(version, env).await
        }

        async fn load_stored_env(&self, version: Version) -> MigrateResult<Option<EnvMap>> {
            self.inner.load_stored_env(version).await
        }

        async fn delete_stored_env(&self, version: Version) -> MigrateResult<()> {
            self.inner.delete_stored_env(version).await
        }

        async fn commit_up(&self, run: &NewRun, env: &EnvMap) -> MigrateResult<()> {
            self.inner.commit_up(run, env).await
        }

        async fn commit_down(&self, run: &NewRun) -> MigrateResult<()> {
            self.inner.commit_down(run).await
        }

        async fn close(&self) -> MigrateResult<()> {
            self.open_handles.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl MemoryFactory {
        fn store(&self, root: &TempDir, stage: &str) -> Arc<MemoryStore> {
            Arc::clone(
                self.stores
                    .lock()
                    .entry(root.path().join(stage))
                    .or_default(),
            )
        }
    }

    #[async_trait]
    impl StoreFactory for MemoryFactory {
        async fn open(
            &self,
            _config: &StoreConfig,
            base_dir: &Path,
        ) -> MigrateResult<Arc<dyn MigrationStore>> {
            let inner = Arc::clone(self.stores.lock().entry(base_dir.to_path_buf()).or_default());
            self.open_handles.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(TrackedStore {
                inner,
                open_handles: Arc::clone(&self.open_handles),
            }))
        }
    }

    type Calls = Arc<Mutex<Vec<String>>>;

    fn router(calls: Calls) -> Router {
        let tenant_calls = Arc::clone(&calls);
        let drop_calls = Arc::clone(&calls);
        let billing_calls = Arc::clone(&calls);
        let unbill_calls = Arc::clone(&calls);
        let search_calls = Arc::clone(&calls);
        Router::new()
            .route(
                "/tenants",
                post(move || {
                    let calls = Arc::clone(&tenant_calls);
                    async move {
                        calls.lock().push("tenant".into());
                        (StatusCode::CREATED, axum::Json(json!({ "id": "t-1" })))
                    }
                }),
            )
            .route(
                "/tenants/{id}",
                axum::routing::delete(move |UrlPath(id): UrlPath<String>| {
                    let calls = Arc::clone(&drop_calls);
                    async move {
                        calls.lock().push(format!("drop-tenant:{id}"));
                        StatusCode::NO_CONTENT
                    }
                }),
            )
            .route(
                "/billing/{id}",
                post(move |UrlPath(id): UrlPath<String>| {
                    let calls = Arc::clone(&billing_calls);
                    async move {
                        calls.lock().push(format!("billing:{id}"));
                        StatusCode::OK
                    }
                })
                .delete(move |UrlPath(id): UrlPath<String>| {
                    let calls = Arc::clone(&unbill_calls);
                    async move {
                        calls.lock().push(format!("unbill:{id}"));
                        StatusCode::OK
                    }
                }),
            )
            .route(
                "/search",
                post(move || {
                    let calls = Arc::clone(&search_calls);
                    async move {
                        calls.lock().push("search".into());
                        StatusCode::OK
                    }
                }),
            )
            .route("/broken", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    StatusCode::OK
                }),
            )
    }

    const TENANT: &str = r#"
up:
  request:
    method: POST
    url: "{{.env.base}}/tenants"
  response:
    result_code: ["201"]
    env_from:
      tenant_id: id
down:
  url: "{{.env.base}}/tenants/{{.env.tenant_id}}"
"#;

    const BILLING: &str = r#"
up:
  request:
    method: POST
    url: "{{.env.base}}/billing/{{.env.tenant_id}}"
down:
  url: "{{.env.base}}/billing/{{.env.tenant_id}}"
"#;

    const SEARCH: &str = r#"
up:
  request:
    method: POST
    url: "{{.env.base}}/search"
"#;

    const BROKEN: &str = r#"
up:
  request:
    method: POST
    url: "{{.env.base}}/broken"
"#;

    fn write_stage(root: &TempDir, name: &str, migration: &str) {
        let dir = root.path().join(name);
        std::fs::create_dir_all(dir.join("migrations")).unwrap();
        std::fs::write(dir.join("config.yaml"), "migration_delay_ms: 0\n").unwrap();
        std::fs::write(dir.join("migrations").join("001_init.yaml"), migration).unwrap();
    }

    fn orchestrator(root: &TempDir, stages: &str, base: &str, factory: Arc<MemoryFactory>) -> Orchestrator {
        let yaml = format!("{stages}\nglobal:\n  env:\n    base: {base}\n");
        let config = StagesConfig::from_yaml(&yaml, root.path()).unwrap();
        Orchestrator::new(config, factory).unwrap()
    }

    const IDENTITY_BILLING: &str = r#"
stages:
  - name: identity
    config_path: identity
  - name: billing
    config_path: billing
    depends_on: [identity]
    env_from_stages:
      - stage: identity
        vars: [tenant_id]
"#;

    fn outcomes(reports: &[StageReport]) -> Vec<(&str, &StageOutcome)> {
        reports.iter().map(|r| (r.stage.as_str(), &r.outcome)).collect()
    }

    #[tokio::test]
    async fn test_up_passes_exports_to_dependents() {
        let calls: Calls = Arc::default();
        let base = serve(router(Arc::clone(&calls))).await;
        let root = TempDir::new().unwrap();
        write_stage(&root, "identity", TENANT);
        write_stage(&root, "billing", BILLING);
        let factory = Arc::new(MemoryFactory::default());
        let orchestrator = orchestrator(&root, IDENTITY_BILLING, &base, Arc::clone(&factory));

        let reports = orchestrator.up(&StageSelection::all()).await.unwrap();
        assert_eq!(
            outcomes(&reports),
            vec![
                ("identity", &StageOutcome::Succeeded),
                ("billing", &StageOutcome::Succeeded)
            ]
        );
        assert_eq!(*calls.lock(), vec!["tenant", "billing:t-1"]);
        assert_eq!(factory.store(&root, "billing").list_applied().await.unwrap(), vec![1]);

        let statuses = orchestrator.status(&StageSelection::all(), false).await.unwrap();
        assert!(statuses.iter().all(|s| s.status.current_version == 1));
    }

    #[tokio::test]
    async fn test_dependency_gate_uses_store_state() {
        let calls: Calls = Arc::default();
        let base = serve(router(Arc::clone(&calls))).await;
        let root = TempDir::new().unwrap();
        write_stage(&root, "identity", TENANT);
        write_stage(&root, "billing", BILLING);
        let orchestrator =
            orchestrator(&root, IDENTITY_BILLING, &base, Arc::new(MemoryFactory::default()));

        let failure = orchestrator.up(&StageSelection::only("billing")).await.unwrap_err();
        assert!(matches!(
            failure.error,
            MigrationError::DependencyNotExecuted { ref stage, ref dependency }
                if stage == "billing" && dependency == "identity"
        ));
        assert!(failure.partial[0].is_failed());
        assert!(calls.lock().is_empty());

        orchestrator.up(&StageSelection::only("identity")).await.unwrap();
        orchestrator.up(&StageSelection::only("billing")).await.unwrap();
        assert_eq!(*calls.lock(), vec!["tenant", "billing:t-1"]);
    }

    #[tokio::test]
    async fn test_every_opened_store_is_closed() {
        let base = serve(router(Arc::default())).await;
        let root = TempDir::new().unwrap();
        write_stage(&root, "identity", TENANT);
        write_stage(&root, "billing", BILLING);
        let factory = Arc::new(MemoryFactory::default());
        let orchestrator = orchestrator(&root, IDENTITY_BILLING, &base, Arc::clone(&factory));

        orchestrator.up(&StageSelection::only("billing")).await.unwrap_err();
        orchestrator.up(&StageSelection::only("identity")).await.unwrap();
        orchestrator.up(&StageSelection::only("billing")).await.unwrap();
        orchestrator.status(&StageSelection::all(), true).await.unwrap();
        orchestrator.down(&StageSelection::all()).await.unwrap();

        assert_eq!(factory.open_handles.load(Ordering::SeqCst), 0);
        assert!(factory.store(&root, "identity").list_applied().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_skip_dependents_keeps_unrelated_stages() {
        let calls: Calls = Arc::default();
        let base = serve(router(Arc::clone(&calls))).await;
        let root = TempDir::new().unwrap();
        write_stage(&root, "identity", BROKEN);
        write_stage(&root, "billing", BILLING);
        write_stage(&root, "search", SEARCH);
        let stages = r#"
stages:
  - name: identity
    config_path: identity
    on_failure: skip_dependents
  - name: billing
    config_path: billing
    depends_on: [identity]
  - name: search
    config_path: search
"#;
        let orchestrator = orchestrator(&root, stages, &base, Arc::new(MemoryFactory::default()));

        let failure = orchestrator.up(&StageSelection::all()).await.unwrap_err();
        assert_eq!(failure.error.status_code(), Some(500));
        let reports = failure.partial;
        assert!(reports[0].is_failed());
        assert_eq!(reports[1].stage, "search");
        assert_eq!(reports[1].outcome, StageOutcome::Succeeded);
        assert_eq!(reports[2].stage, "billing");
        assert!(matches!(reports[2].outcome, StageOutcome::Skipped(_)));
        assert_eq!(*calls.lock(), vec!["search"]);
    }

    #[tokio::test]
    async fn test_stop_halts_later_waves() {
        let calls: Calls = Arc::default();
        let base = serve(router(Arc::clone(&calls))).await;
        let root = TempDir::new().unwrap();
        write_stage(&root, "identity", BROKEN);
        write_stage(&root, "billing", BILLING);
        let orchestrator =
            orchestrator(&root, IDENTITY_BILLING, &base, Arc::new(MemoryFactory::default()));

        let failure = orchestrator.up(&StageSelection::all()).await.unwrap_err();
        assert_eq!(failure.partial.len(), 1);
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_condition_skips_stage() {
        let calls: Calls = Arc::default();
        let base = serve(router(Arc::clone(&calls))).await;
        let root = TempDir::new().unwrap();
        write_stage(&root, "search", SEARCH);
        let stages = r#"
stages:
  - name: search
    config_path: search
    condition: "{{.env.search_enabled}}"
    env:
      search_enabled: "Off"
"#;
        let orchestrator = orchestrator(&root, stages, &base, Arc::new(MemoryFactory::default()));

        let reports = orchestrator.up(&StageSelection::all()).await.unwrap();
        assert!(matches!(reports[0].outcome, StageOutcome::Skipped(_)));
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_down_runs_in_reverse_order() {
        let calls: Calls = Arc::default();
        let base = serve(router(Arc::clone(&calls))).await;
        let root = TempDir::new().unwrap();
        write_stage(&root, "identity", TENANT);
        write_stage(&root, "billing", BILLING);
        let factory = Arc::new(MemoryFactory::default());
        let orchestrator = orchestrator(&root, IDENTITY_BILLING, &base, Arc::clone(&factory));

        orchestrator.up(&StageSelection::all()).await.unwrap();
        let reports = orchestrator.down(&StageSelection::all()).await.unwrap();
        assert_eq!(
            reports.iter().map(|r| r.stage.as_str()).collect::<Vec<_>>(),
            vec!["billing", "identity"]
        );
        assert_eq!(
            *calls.lock(),
            vec!["tenant", "billing:t-1", "unbill:t-1", "drop-tenant:t-1"]
        );
        assert!(factory.store(&root, "identity").list_applied().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_on_failure() {
        let calls: Calls = Arc::default();
        let base = serve(router(Arc::clone(&calls))).await;
        let root = TempDir::new().unwrap();
        write_stage(&root, "identity", TENANT);
        write_stage(&root, "billing", BROKEN);
        let stages = format!("{IDENTITY_BILLING}\n");
        let yaml = format!(
            "{stages}global:\n  rollback_on_failure: true\n  env:\n    base: {base}\n"
        );
        let factory = Arc::new(MemoryFactory::default());
        let config = StagesConfig::from_yaml(&yaml, root.path()).unwrap();
        let orchestrator = Orchestrator::new(config, Arc::clone(&factory) as Arc<dyn StoreFactory>).unwrap();

        let failure = orchestrator.up(&StageSelection::all()).await.unwrap_err();
        let last = failure.partial.last().unwrap();
        assert_eq!(last.stage, "identity");
        assert_eq!(last.outcome, StageOutcome::RolledBack(0));
        assert_eq!(*calls.lock(), vec!["tenant", "drop-tenant:t-1"]);
        assert!(factory.store(&root, "identity").list_applied().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stage_timeout() {
        let base = serve(router(Arc::default())).await;
        let root = TempDir::new().unwrap();
        write_stage(
            &root,
            "slow",
            "up:\n  request:\n    url: \"{{.env.base}}/slow\"\n",
        );
        let stages = "stages:\n  - name: slow\n    config_path: slow\n    timeout: 100ms\n";
        let orchestrator = orchestrator(&root, stages, &base, Arc::new(MemoryFactory::default()));

        let failure = orchestrator.up(&StageSelection::all()).await.unwrap_err();
        assert!(matches!(failure.error, MigrationError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let calls: Calls = Arc::default();
        let base = serve(router(Arc::clone(&calls))).await;
        let root = TempDir::new().unwrap();
        write_stage(&root, "identity", TENANT);
        write_stage(&root, "billing", BILLING);
        let factory = Arc::new(MemoryFactory::default());
        let orchestrator =
            orchestrator(&root, IDENTITY_BILLING, &base, Arc::clone(&factory)).with_dry_run(true);

        let reports = orchestrator.up(&StageSelection::all()).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.results.iter().all(|v| v.dry_run)));
        assert!(calls.lock().is_empty());
        assert!(factory.store(&root, "identity").list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validate() {
        let root = TempDir::new().unwrap();
        write_stage(&root, "identity", TENANT);
        write_stage(&root, "billing", BILLING);
        let orchestrator = orchestrator(
            &root,
            IDENTITY_BILLING,
            "http://localhost",
            Arc::new(MemoryFactory::default()),
        );

        let validations = orchestrator.validate().await.unwrap();
        assert_eq!(validations.len(), 2);
        assert_eq!(validations[0].stage, "identity");
        assert_eq!(validations[0].migrations[0].version, 1);

        std::fs::write(
            root.path().join("billing/migrations/002_bad.yaml"),
            "up: [not, a, task]\n",
        )
        .unwrap();
        let err = orchestrator.validate().await.unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_is_falsy() {
        for value in ["", " ", "false", "FALSE", "0", "no", "Off"] {
            assert!(is_falsy(value), "{value:?}");
        }
        for value in ["true", "1", "yes", "anything"] {
            assert!(!is_falsy(value), "{value:?}");
        }
    }
}
