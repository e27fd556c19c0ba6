//! Migration task definitions as written in `NNN_description.yaml` files.
//!
//! ```yaml
//! up:
//!   name: create widget
//!   env:
//!     kind: gadget
//!   request:
//!     method: POST
//!     url: "{{.env.base_url}}/widgets"
//!     headers:
//!       X-Request-Source: apimigrate
//!     body: '{"kind": "{{.env.kind}}"}'
//!     auth: api
//!   response:
//!     result_code: ["200", "201"]
//!     env_from:
//!       widget_id: id
//!     env_missing: fail
//! down:
//!   name: delete widget
//!   method: DELETE
//!   url: "{{.env.base_url}}/widgets/{{.env.widget_id}}"
//!   auth: api
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{MigrateResult, MigrationError};

/// A complete migration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationTask {
    /// Forward half.
    pub up: UpTask,
    /// Rollback half.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<DownTask>,
}

impl MigrationTask {
    /// Parse a migration from YAML text.
    pub fn from_yaml(content: &str) -> MigrateResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Read and parse a migration file.
    pub async fn load(path: &Path) -> MigrateResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        serde_yaml::from_str(&content).map_err(|e| {
            MigrationError::invalid_migration(format!("{}: {}", path.display(), e))
        })
    }
}

/// The forward half of a migration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpTask {
    /// Human readable name.
    pub name: String,
    /// Declared local variables.
    pub env: BTreeMap<String, String>,
    /// The request to send.
    pub request: RequestSpec,
    /// How to judge and mine the response.
    pub response: ResponseSpec,
}

/// The rollback half of a migration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownTask {
    /// Human readable name.
    pub name: String,
    /// Declared local variables.
    pub env: BTreeMap<String, String>,
    /// Optional lookup run before the main call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub find: Option<FindSpec>,
    /// HTTP method (default `DELETE`).
    pub method: Option<String>,
    /// Target URL.
    pub url: String,
    /// Extra headers.
    pub headers: BTreeMap<String, String>,
    /// Query parameters.
    pub queries: BTreeMap<String, String>,
    /// Request body.
    #[serde(deserialize_with = "body_as_string")]
    pub body: Option<String>,
    /// Named auth provider to attach.
    pub auth: Option<String>,
}

impl DownTask {
    /// The main rollback call expressed as a request.
    pub fn request(&self) -> RequestSpec {
        RequestSpec {
            method: Some(self.method.clone().unwrap_or_else(|| "DELETE".to_string())),
            url: self.url.clone(),
            headers: self.headers.clone(),
            queries: self.queries.clone(),
            body: self.body.clone(),
            body_file: None,
            auth: self.auth.clone(),
        }
    }
}

/// A preliminary request whose extracted variables feed the rollback call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FindSpec {
    /// The lookup request.
    pub request: RequestSpec,
    /// Status validation and extraction.
    pub response: ResponseSpec,
}

/// An HTTP request template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSpec {
    /// HTTP method; falls back to the caller's default, then `GET`.
    pub method: Option<String>,
    /// Target URL; falls back to the caller's default.
    pub url: String,
    /// Extra headers. Explicit headers are never replaced by auth.
    pub headers: BTreeMap<String, String>,
    /// Query parameters.
    pub queries: BTreeMap<String, String>,
    /// Inline body. YAML mappings and sequences are sent as JSON.
    #[serde(deserialize_with = "body_as_string")]
    pub body: Option<String>,
    /// Body read from a file relative to the migration directory.
    pub body_file: Option<String>,
    /// Named auth provider to attach.
    pub auth: Option<String>,
}

/// Response expectations for a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseSpec {
    /// Accepted status codes, literal or templated. Empty accepts anything.
    #[serde(deserialize_with = "codes_as_strings")]
    pub result_code: Vec<String>,
    /// Variable name to JSON path.
    pub env_from: BTreeMap<String, String>,
    /// What to do when a path is missing.
    pub env_missing: EnvMissing,
}

/// Policy for extraction paths that do not resolve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvMissing {
    /// Omit the variable.
    #[default]
    Skip,
    /// Fail the task after collecting everything else.
    Fail,
}

fn body_as_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(other) => serde_json::to_string(&other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn codes_as_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Option::<Vec<serde_yaml::Value>>::deserialize(deserializer)?.unwrap_or_default();
    values
        .into_iter()
        .map(|value| match value {
            serde_yaml::Value::String(s) => Ok(s),
            serde_yaml::Value::Number(n) => Ok(n.to_string()),
            other => Err(serde::de::Error::custom(format!(
                "result_code entries must be strings or numbers, got {other:?}"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_full_migration() {
        let task = MigrationTask::from_yaml(
            r#"
up:
  name: create
  env:
    kind: gadget
  request:
    method: POST
    url: "{{.env.base}}/create"
    headers:
      X-Trace: "1"
    body:
      kind: "{{.env.kind}}"
    auth: api
  response:
    result_code: [200, "201", "{{.env.ok}}"]
    env_from:
      rid: id
    env_missing: fail
down:
  name: delete
  find:
    request:
      url: "{{.env.base}}/lookup"
    response:
      env_from:
        rid: items[0].id
  url: "{{.env.base}}/delete/{{.env.rid}}"
"#,
        )
        .unwrap();

        assert_eq!(task.up.name, "create");
        assert_eq!(task.up.request.method.as_deref(), Some("POST"));
        assert_eq!(
            task.up.request.body.as_deref(),
            Some(r#"{"kind":"{{.env.kind}}"}"#)
        );
        assert_eq!(task.up.response.result_code, vec!["200", "201", "{{.env.ok}}"]);
        assert_eq!(task.up.response.env_missing, EnvMissing::Fail);

        let down = task.down.unwrap();
        assert!(down.find.is_some());
        let request = down.request();
        assert_eq!(request.method.as_deref(), Some("DELETE"));
        assert_eq!(request.url, "{{.env.base}}/delete/{{.env.rid}}");
    }

    #[test]
    fn test_defaults() {
        let task = MigrationTask::from_yaml("up:\n  request:\n    url: http://x/health\n").unwrap();
        assert!(task.down.is_none());
        assert!(task.up.response.result_code.is_empty());
        assert_eq!(task.up.response.env_missing, EnvMissing::Skip);
        assert_eq!(task.up.request.body, None);
    }

    #[test]
    fn test_string_body_kept_verbatim() {
        let task =
            MigrationTask::from_yaml("up:\n  request:\n    url: u\n    body: plain text\n").unwrap();
        assert_eq!(task.up.request.body.as_deref(), Some("plain text"));
    }

    #[test]
    fn test_invalid_missing_policy() {
        let err = MigrationTask::from_yaml("up:\n  response:\n    env_missing: maybe\n");
        assert!(err.is_err());
    }
}
