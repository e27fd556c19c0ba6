//! PocketBase password login.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{AUTHORIZATION, AuthMethod, decode_config};
use crate::error::{MigrateResult, MigrationError};

pub(super) const KIND: &str = "pocketbase";

fn default_collection() -> String {
    "users".to_string()
}

/// Configuration for the `pocketbase` provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PocketBaseConfig {
    /// Server root, e.g. `http://127.0.0.1:8090`.
    pub base_url: String,
    /// Login identity (usually an email).
    #[serde(alias = "email")]
    pub identity: String,
    /// Password.
    pub password: String,
    /// Log in as an administrator instead of a collection record.
    #[serde(default)]
    pub admin: bool,
    /// Auth collection for record logins.
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Header override.
    #[serde(default)]
    pub header: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    token: String,
}

/// Logs into PocketBase and sends the raw token.
#[derive(Debug, Clone)]
pub struct PocketBaseAuth {
    config: PocketBaseConfig,
}

impl PocketBaseAuth {
    /// Create the provider.
    pub fn new(config: PocketBaseConfig) -> MigrateResult<Self> {
        if config.base_url.is_empty() {
            return Err(MigrationError::config("pocketbase auth requires base_url"));
        }
        Ok(Self { config })
    }

    /// The login endpoint for this configuration.
    pub fn login_url(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        if self.config.admin {
            format!("{base}/api/admins/auth-with-password")
        } else {
            format!(
                "{base}/api/collections/{}/auth-with-password",
                self.config.collection
            )
        }
    }
}

#[async_trait]
impl AuthMethod for PocketBaseAuth {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn header_name(&self) -> &str {
        self.config.header.as_deref().unwrap_or(AUTHORIZATION)
    }

    async fn acquire(&self, client: &reqwest::Client) -> MigrateResult<String> {
        let url = self.login_url();
        debug!(url = %url, "Logging into PocketBase");

        let response = client
            .post(&url)
            .json(&json!({
                "identity": self.config.identity,
                "password": self.config.password,
            }))
            .send()
            .await
            .map_err(|e| MigrationError::auth(format!("pocketbase login failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MigrationError::auth(format!("pocketbase response unreadable: {e}")))?;
        if !status.is_success() {
            return Err(MigrationError::auth(format!(
                "pocketbase login returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        let login: LoginResponse = serde_json::from_str(&body)
            .map_err(|e| MigrationError::auth(format!("pocketbase response invalid: {e}")))?;
        if login.token.is_empty() {
            return Err(MigrationError::auth("pocketbase response has no token"));
        }
        Ok(login.token)
    }
}

pub(super) fn factory(raw: serde_json::Value) -> MigrateResult<Arc<dyn AuthMethod>> {
    let config: PocketBaseConfig = decode_config(KIND, raw)?;
    Ok(Arc::new(PocketBaseAuth::new(config)?))
}
