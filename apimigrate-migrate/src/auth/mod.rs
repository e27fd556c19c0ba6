//! Pluggable credential acquisition.
//!
//! Providers are looked up by type name in an [`AuthRegistry`]. Each factory
//! decodes its own typed configuration from the JSON value handed to it, so
//! the registry boundary is the only place where configuration is untyped.
//!
//! Acquired tokens are cached in the registry's [`TokenCache`] by provider
//! name (case-insensitive), so a credential is fetched once per registry
//! even when several environments reference it.

mod basic;
mod oauth2;
mod pocketbase;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::env::{Env, EnvValue, LazyValue};
use crate::error::{MigrateResult, MigrationError};

pub use basic::{BasicAuth, BasicConfig};
pub use oauth2::{OAuth2Auth, OAuth2Config, OAuth2Flow};
pub use pocketbase::{PocketBaseAuth, PocketBaseConfig};

/// Default header credentials are sent in.
pub const AUTHORIZATION: &str = "Authorization";

/// A way of obtaining a credential.
#[async_trait]
pub trait AuthMethod: Send + Sync + fmt::Debug {
    /// Provider type name.
    fn kind(&self) -> &'static str;

    /// Header the credential is sent in.
    fn header_name(&self) -> &str {
        AUTHORIZATION
    }

    /// Obtain the header value.
    async fn acquire(&self, client: &reqwest::Client) -> MigrateResult<String>;
}

/// Constructor for an auth method from its raw configuration.
pub type AuthFactory =
    Arc<dyn Fn(serde_json::Value) -> MigrateResult<Arc<dyn AuthMethod>> + Send + Sync>;

/// Decode a provider configuration, naming the provider on failure.
pub fn decode_config<T: DeserializeOwned>(kind: &str, raw: serde_json::Value) -> MigrateResult<T> {
    serde_json::from_value(raw)
        .map_err(|e| MigrationError::config(format!("invalid '{kind}' auth config: {e}")))
}

/// A cached credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedToken {
    /// Header name.
    pub header: String,
    /// Header value.
    pub value: String,
}

/// Process-wide token cache keyed by provider name.
#[derive(Debug, Default)]
pub struct TokenCache {
    inner: RwLock<HashMap<String, CachedToken>>,
}

impl TokenCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a token. Empty names, headers or values are ignored.
    pub fn store(&self, name: &str, header: &str, value: &str) {
        if name.is_empty() || header.is_empty() || value.is_empty() {
            return;
        }
        self.inner.write().insert(
            name.to_lowercase(),
            CachedToken {
                header: header.to_string(),
                value: value.to_string(),
            },
        );
    }

    /// Look up a token by name, ignoring case.
    pub fn get(&self, name: &str) -> Option<CachedToken> {
        self.inner.read().get(&name.to_lowercase()).cloned()
    }

    /// Remove a token.
    pub fn remove(&self, name: &str) -> Option<CachedToken> {
        self.inner.write().remove(&name.to_lowercase())
    }

    /// Number of cached tokens.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Drop every token.
    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

/// Registry of auth provider factories plus the token cache they fill.
pub struct AuthRegistry {
    factories: RwLock<HashMap<String, AuthFactory>>,
    tokens: TokenCache,
}

impl Default for AuthRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for AuthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRegistry")
            .field("kinds", &self.kinds())
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

impl AuthRegistry {
    /// Create a registry with no providers.
    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            tokens: TokenCache::new(),
        }
    }

    /// Create a registry with the `basic`, `oauth2` and `pocketbase` providers.
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        registry.register_factory(basic::KIND, Arc::new(basic::factory));
        registry.register_factory(oauth2::KIND, Arc::new(oauth2::factory));
        registry.register_factory(pocketbase::KIND, Arc::new(pocketbase::factory));
        registry
    }

    /// Register (or replace) the factory for a provider type.
    pub fn register<F>(&self, kind: &str, factory: F) -> MigrateResult<()>
    where
        F: Fn(serde_json::Value) -> MigrateResult<Arc<dyn AuthMethod>> + Send + Sync + 'static,
    {
        if kind.trim().is_empty() {
            return Err(MigrationError::config("auth provider type must not be empty"));
        }
        self.register_factory(kind, Arc::new(factory));
        Ok(())
    }

    fn register_factory(&self, kind: &str, factory: AuthFactory) {
        self.factories.write().insert(kind.to_lowercase(), factory);
    }

    /// Registered provider types, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.factories.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Build an auth method of the given type.
    pub fn build(&self, kind: &str, raw: serde_json::Value) -> MigrateResult<Arc<dyn AuthMethod>> {
        let factory = self
            .factories
            .read()
            .get(&kind.to_lowercase())
            .cloned()
            .ok_or_else(|| MigrationError::UnknownAuthProvider(kind.to_string()))?;
        factory(raw)
    }

    /// The shared token cache.
    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    /// Forget every cached token and registered provider.
    pub fn clear(&self) {
        self.factories.write().clear();
        self.tokens.clear();
    }

    /// Build, acquire and cache a credential under `name`.
    pub async fn acquire_and_store(
        &self,
        kind: &str,
        name: &str,
        raw: serde_json::Value,
        client: &reqwest::Client,
    ) -> MigrateResult<CachedToken> {
        let method = self.build(kind, raw)?;
        self.acquire_with(name, method.as_ref(), client).await
    }

    /// Acquire through an already built method, reusing a cached token for `name`.
    pub async fn acquire_with(
        &self,
        name: &str,
        method: &dyn AuthMethod,
        client: &reqwest::Client,
    ) -> MigrateResult<CachedToken> {
        if let Some(token) = self.tokens.get(name) {
            debug!(name = %name, "Reusing cached auth token");
            return Ok(token);
        }

        let value = method.acquire(client).await?;
        let token = CachedToken {
            header: method.header_name().to_string(),
            value,
        };
        self.tokens.store(name, &token.header, &token.value);
        info!(name = %name, kind = method.kind(), "Acquired auth token");
        Ok(token)
    }
}

/// Register `name` in `env` as a credential acquired on first reference.
pub fn embed_lazy(
    env: &mut Env,
    registry: &Arc<AuthRegistry>,
    name: &str,
    method: Arc<dyn AuthMethod>,
    client: reqwest::Client,
) {
    let header = method.header_name().to_string();
    let registry = Arc::clone(registry);
    let owned_name = name.to_string();
    let lazy = LazyValue::new(move || {
        let registry = Arc::clone(&registry);
        let method = Arc::clone(&method);
        let client = client.clone();
        let name = owned_name.clone();
        async move {
            registry
                .acquire_with(&name, method.as_ref(), &client)
                .await
                .map(|token| token.value)
        }
    });
    env.insert_auth(name, header, EnvValue::Lazy(lazy));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct StaticKey(String);

    #[async_trait]
    impl AuthMethod for StaticKey {
        fn kind(&self) -> &'static str {
            "static"
        }

        fn header_name(&self) -> &str {
            "X-Api-Key"
        }

        async fn acquire(&self, _client: &reqwest::Client) -> MigrateResult<String> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_token_cache_ignores_empty_inputs() {
        let cache = TokenCache::new();
        cache.store("", "Authorization", "x");
        cache.store("a", "", "x");
        cache.store("a", "Authorization", "");
        assert!(cache.is_empty());

        cache.store("Api", "Authorization", "Bearer t");
        assert_eq!(cache.get("API").unwrap().value, "Bearer t");
    }

    #[test]
    fn test_unknown_provider_is_typed_error() {
        let registry = AuthRegistry::with_builtins();
        let err = registry.build("kerberos", serde_json::json!({})).unwrap_err();
        assert!(matches!(err, MigrationError::UnknownAuthProvider(ref k) if k == "kerberos"));
    }

    #[test]
    fn test_register_rejects_empty_type() {
        let registry = AuthRegistry::empty();
        let result = registry.register(" ", |_| Ok(Arc::new(StaticKey("k".into())) as Arc<dyn AuthMethod>));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_register_overwrites_and_acquires() {
        let registry = AuthRegistry::with_builtins();
        registry
            .register("static", |raw| {
                let key: String = decode_config("static", raw)?;
                Ok(Arc::new(StaticKey(key)) as Arc<dyn AuthMethod>)
            })
            .unwrap();
        registry
            .register("STATIC", |_| Ok(Arc::new(StaticKey("second".into())) as Arc<dyn AuthMethod>))
            .unwrap();

        let client = reqwest::Client::new();
        let token = registry
            .acquire_and_store("static", "svc", serde_json::json!("ignored"), &client)
            .await
            .unwrap();
        assert_eq!(token.header, "X-Api-Key");
        assert_eq!(token.value, "second");
        assert_eq!(registry.tokens().get("SVC"), Some(token));
    }

    #[tokio::test]
    async fn test_embed_lazy_uses_cache() {
        let registry = Arc::new(AuthRegistry::empty());
        registry.tokens().store("svc", "X-Api-Key", "cached");

        let mut env = Env::new();
        embed_lazy(
            &mut env,
            &registry,
            "svc",
            Arc::new(StaticKey("fresh".into())),
            reqwest::Client::new(),
        );

        assert_eq!(env.auth("svc").unwrap().header, "X-Api-Key");
        assert_eq!(env.render_strict("{{.auth.svc}}").await.unwrap(), "cached");
    }

    #[test]
    fn test_builtin_kinds() {
        let registry = AuthRegistry::with_builtins();
        assert_eq!(registry.kinds(), vec!["basic", "oauth2", "pocketbase"]);
        registry.clear();
        assert!(registry.kinds().is_empty());
    }
}
