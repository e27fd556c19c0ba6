//! Layered environment used to render migration templates.
//!
//! An [`Env`] has three layers:
//!
//! - **global** - run-wide constants from configuration
//! - **local** - per-task variables (declared, stored or extracted)
//! - **auth** - named credentials, possibly acquired lazily on first use
//!
//! `{{.env.KEY}}` resolves against local first, then global. `{{.auth.NAME}}`
//! resolves against the auth layer, triggering acquisition if the value is
//! lazy. A lazy value is resolved at most once and shared by every clone of
//! the environment it was inserted into.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::OnceCell;

use crate::error::{MigrateResult, MigrationError};
use crate::template::{self, Reference, RenderMode};

type Resolver = Arc<dyn Fn() -> BoxFuture<'static, MigrateResult<String>> + Send + Sync>;

/// A value computed on first access and memoized, error included.
#[derive(Clone)]
pub struct LazyValue {
    cell: Arc<OnceCell<Result<String, String>>>,
    resolver: Resolver,
}

impl LazyValue {
    /// Create a lazy value from an async resolver.
    pub fn new<F, Fut>(resolver: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MigrateResult<String>> + Send + 'static,
    {
        Self {
            cell: Arc::new(OnceCell::new()),
            resolver: Arc::new(move || Box::pin(resolver())),
        }
    }

    /// Resolve the value, running the resolver only if nobody has yet.
    ///
    /// Concurrent callers wait for the first resolution and observe the same
    /// value or the same error.
    pub async fn get(&self) -> MigrateResult<String> {
        let resolver = Arc::clone(&self.resolver);
        self.cell
            .get_or_init(|| async move {
                resolver().await.map_err(|e| match e {
                    MigrationError::Auth(msg) => msg,
                    other => other.to_string(),
                })
            })
            .await
            .clone()
            .map_err(MigrationError::Auth)
    }

    /// Whether the value has been resolved already.
    pub fn is_resolved(&self) -> bool {
        self.cell.initialized()
    }
}

impl fmt::Debug for LazyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyValue")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// A value in the auth layer.
#[derive(Debug, Clone)]
pub enum EnvValue {
    /// Known up front.
    Ready(String),
    /// Acquired on first reference.
    Lazy(LazyValue),
}

impl EnvValue {
    /// Resolve to a string.
    pub async fn resolve(&self) -> MigrateResult<String> {
        match self {
            Self::Ready(value) => Ok(value.clone()),
            Self::Lazy(lazy) => lazy.get().await,
        }
    }
}

impl From<String> for EnvValue {
    fn from(value: String) -> Self {
        Self::Ready(value)
    }
}

impl From<&str> for EnvValue {
    fn from(value: &str) -> Self {
        Self::Ready(value.to_string())
    }
}

/// A named credential: the header it belongs in and its value.
#[derive(Debug, Clone)]
pub struct AuthEntry {
    /// Header the value is sent in (usually `Authorization`).
    pub header: String,
    /// Header value.
    pub value: EnvValue,
}

/// Layered key/value environment.
#[derive(Debug, Clone, Default)]
pub struct Env {
    global: BTreeMap<String, String>,
    local: BTreeMap<String, String>,
    auth: BTreeMap<String, AuthEntry>,
}

impl Env {
    /// Create an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an environment with the given global layer.
    pub fn with_global(global: BTreeMap<String, String>) -> Self {
        Self {
            global,
            ..Default::default()
        }
    }

    /// Copy of this environment with an empty local layer.
    ///
    /// Lazy auth values stay shared with `self`.
    pub fn fork(&self) -> Self {
        Self {
            global: self.global.clone(),
            local: BTreeMap::new(),
            auth: self.auth.clone(),
        }
    }

    /// The global layer.
    pub fn global(&self) -> &BTreeMap<String, String> {
        &self.global
    }

    /// The local layer.
    pub fn local(&self) -> &BTreeMap<String, String> {
        &self.local
    }

    /// Set a global variable.
    pub fn set_global(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.global.insert(key.into(), value.into());
    }

    /// Overlay global variables, replacing existing keys.
    pub fn extend_global<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.global.insert(k.into(), v.into());
        }
    }

    /// Set a local variable.
    pub fn set_local(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.local.insert(key.into(), value.into());
    }

    /// Overlay local variables, replacing existing keys.
    pub fn extend_local<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.local.insert(k.into(), v.into());
        }
    }

    /// Add local variables whose keys are not set yet.
    pub fn fill_local<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.local.entry(k.into()).or_insert_with(|| v.into());
        }
    }

    /// Register a named credential. Names are case-insensitive.
    pub fn insert_auth(&mut self, name: &str, header: impl Into<String>, value: impl Into<EnvValue>) {
        if name.is_empty() {
            return;
        }
        self.auth.insert(
            name.to_lowercase(),
            AuthEntry {
                header: header.into(),
                value: value.into(),
            },
        );
    }

    /// Look up a named credential.
    pub fn auth(&self, name: &str) -> Option<&AuthEntry> {
        self.auth.get(&name.to_lowercase())
    }

    /// Names of all registered credentials.
    pub fn auth_names(&self) -> impl Iterator<Item = &str> {
        self.auth.keys().map(String::as_str)
    }

    /// Local-first, then global lookup.
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.local
            .get(key)
            .or_else(|| self.global.get(key))
            .map(String::as_str)
    }

    /// Global overlaid with local.
    pub fn merged(&self) -> BTreeMap<String, String> {
        let mut merged = self.global.clone();
        merged.extend(self.local.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Render with undefined keys as errors.
    pub async fn render_strict(&self, input: &str) -> MigrateResult<String> {
        self.render(input, RenderMode::Strict).await
    }

    /// Render leaving the input unchanged when a key is undefined.
    pub async fn render_lenient(&self, input: &str) -> MigrateResult<String> {
        self.render(input, RenderMode::Lenient).await
    }

    /// Render `input` in the given mode.
    ///
    /// Auth values are resolved only for names the input references. A failed
    /// credential acquisition is an error in both modes.
    pub async fn render(&self, input: &str, mode: RenderMode) -> MigrateResult<String> {
        if !template::is_template(input) {
            return Ok(input.to_string());
        }

        let references = match template::references(input) {
            Ok(refs) => refs,
            Err(_) if mode == RenderMode::Lenient => return Ok(input.to_string()),
            Err(e) => return Err(e),
        };

        let mut tokens = BTreeMap::new();
        let mut wanted = BTreeSet::new();
        for reference in &references {
            match reference {
                Reference::Auth(name) => {
                    wanted.insert(name.to_lowercase());
                }
                Reference::Flat(name) if self.lookup(name).is_none() => {
                    wanted.insert(name.to_lowercase());
                }
                _ => {}
            }
        }
        for name in wanted {
            if let Some(entry) = self.auth.get(&name) {
                tokens.insert(name, entry.value.resolve().await?);
            }
        }

        let rendered = template::render(input, |reference| match reference {
            Reference::Env(key) => self.lookup(key).map(str::to_string),
            Reference::Auth(name) => tokens.get(&name.to_lowercase()).cloned(),
            Reference::Flat(key) => self
                .lookup(key)
                .map(str::to_string)
                .or_else(|| tokens.get(&key.to_lowercase()).cloned()),
        });

        match rendered {
            Ok(out) => Ok(out),
            Err(MigrationError::MissingKey(_)) if mode == RenderMode::Lenient => {
                Ok(input.to_string())
            }
            Err(e) => Err(e),
        }
    }
}
