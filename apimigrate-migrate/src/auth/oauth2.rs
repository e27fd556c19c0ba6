//! OAuth2 token acquisition.
//!
//! The `password` and `client_credentials` grants POST a form to the token
//! endpoint and send `<token_type> <access_token>`. The `implicit` grant cannot
//! complete without a browser, so it yields the authorization URL the user
//! has to visit instead of a token.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{AUTHORIZATION, AuthMethod, decode_config};
use crate::error::{MigrateResult, MigrationError};

pub(super) const KIND: &str = "oauth2";

/// OAuth2 grant type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuth2Flow {
    /// Resource owner password credentials.
    #[default]
    Password,
    /// Client credentials.
    #[serde(alias = "client-credentials")]
    ClientCredentials,
    /// Implicit grant.
    Implicit,
}

/// Configuration for the `oauth2` provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuth2Config {
    /// Grant type.
    #[serde(alias = "grant_type")]
    pub flow: OAuth2Flow,
    /// Token endpoint (password and client credentials).
    pub token_url: String,
    /// Authorization endpoint (implicit).
    pub auth_url: String,
    /// Client identifier.
    pub client_id: String,
    /// Client secret.
    pub client_secret: String,
    /// Resource owner name (password grant).
    pub username: String,
    /// Resource owner password (password grant).
    pub password: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Redirect URI (implicit).
    pub redirect_url: String,
    /// Header override.
    pub header: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
}

/// OAuth2 provider.
#[derive(Debug, Clone)]
pub struct OAuth2Auth {
    config: OAuth2Config,
}

impl OAuth2Auth {
    /// Create the provider, checking the fields its grant needs.
    pub fn new(config: OAuth2Config) -> MigrateResult<Self> {
        match config.flow {
            OAuth2Flow::Password | OAuth2Flow::ClientCredentials if config.token_url.is_empty() => {
                return Err(MigrationError::config("oauth2 requires token_url"));
            }
            OAuth2Flow::Implicit if config.auth_url.is_empty() => {
                return Err(MigrationError::config("oauth2 implicit flow requires auth_url"));
            }
            _ => {}
        }
        if config.client_id.is_empty() {
            return Err(MigrationError::config("oauth2 requires client_id"));
        }
        Ok(Self { config })
    }

    /// The URL a user must visit to complete the implicit grant.
    pub fn authorization_url(&self) -> MigrateResult<String> {
        let mut url = Url::parse(&self.config.auth_url)
            .map_err(|e| MigrationError::config(format!("invalid oauth2 auth_url: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("response_type", "token");
            pairs.append_pair("client_id", &self.config.client_id);
            if !self.config.redirect_url.is_empty() {
                pairs.append_pair("redirect_uri", &self.config.redirect_url);
            }
            if !self.config.scopes.is_empty() {
                pairs.append_pair("scope", &self.config.scopes.join(" "));
            }
        }
        Ok(url.into())
    }

    fn form(&self) -> Vec<(&'static str, String)> {
        let config = &self.config;
        let mut form = Vec::new();
        match config.flow {
            OAuth2Flow::Password => {
                form.push(("grant_type", "password".to_string()));
                form.push(("username", config.username.clone()));
                form.push(("password", config.password.clone()));
            }
            OAuth2Flow::ClientCredentials => {
                form.push(("grant_type", "client_credentials".to_string()));
            }
            OAuth2Flow::Implicit => {}
        }
        form.push(("client_id", config.client_id.clone()));
        if !config.client_secret.is_empty() {
            form.push(("client_secret", config.client_secret.clone()));
        }
        if !config.scopes.is_empty() {
            form.push(("scope", config.scopes.join(" ")));
        }
        form
    }
}

#[async_trait]
impl AuthMethod for OAuth2Auth {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn header_name(&self) -> &str {
        self.config.header.as_deref().unwrap_or(AUTHORIZATION)
    }

    async fn acquire(&self, client: &reqwest::Client) -> MigrateResult<String> {
        if self.config.flow == OAuth2Flow::Implicit {
            return self.authorization_url();
        }

        debug!(token_url = %self.config.token_url, flow = ?self.config.flow, "Requesting OAuth2 token");
        let response = client
            .post(&self.config.token_url)
            .form(&self.form())
            .send()
            .await
            .map_err(|e| MigrationError::auth(format!("oauth2 token request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MigrationError::auth(format!("oauth2 token response unreadable: {e}")))?;
        if !status.is_success() {
            return Err(MigrationError::auth(format!(
                "oauth2 token endpoint returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| MigrationError::auth(format!("oauth2 token response invalid: {e}")))?;
        if token.access_token.is_empty() {
            return Err(MigrationError::auth("oauth2 token response has empty access_token"));
        }

        let token_type = match token.token_type.as_deref() {
            None | Some("") => "Bearer".to_string(),
            Some(t) if t.eq_ignore_ascii_case("bearer") => "Bearer".to_string(),
            Some(t) => t.to_string(),
        };
        Ok(format!("{} {}", token_type, token.access_token))
    }
}

pub(super) fn factory(raw: serde_json::Value) -> MigrateResult<Arc<dyn AuthMethod>> {
    let config: OAuth2Config = decode_config(KIND, raw)?;
    Ok(Arc::new(OAuth2Auth::new(config)?))
}
