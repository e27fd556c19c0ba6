//! HTTP basic authentication.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use super::{AUTHORIZATION, AuthMethod, decode_config};
use crate::error::{MigrateResult, MigrationError};

pub(super) const KIND: &str = "basic";

/// Configuration for the `basic` provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicConfig {
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
    /// Header override.
    pub header: Option<String>,
}

/// Sends `Basic base64(user:pass)`.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    config: BasicConfig,
}

impl BasicAuth {
    /// Create the provider. The user name must not be empty.
    pub fn new(config: BasicConfig) -> MigrateResult<Self> {
        if config.username.is_empty() {
            return Err(MigrationError::config("basic auth requires a username"));
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl AuthMethod for BasicAuth {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn header_name(&self) -> &str {
        self.config.header.as_deref().unwrap_or(AUTHORIZATION)
    }

    async fn acquire(&self, _client: &reqwest::Client) -> MigrateResult<String> {
        let credentials = format!("{}:{}", self.config.username, self.config.password);
        Ok(format!("Basic {}", STANDARD.encode(credentials)))
    }
}

pub(super) fn factory(raw: serde_json::Value) -> MigrateResult<Arc<dyn AuthMethod>> {
    let config: BasicConfig = decode_config(KIND, raw)?;
    Ok(Arc::new(BasicAuth::new(config)?))
}
