//! HTTP execution of migration tasks.
//!
//! Field rendering policy:
//!
//! | field | mode |
//! |---|---|
//! | method, URL, headers, queries | lenient |
//! | body, body_file, result_code | strict |
//!
//! Explicit headers always win over injected auth headers. Extraction only
//! runs once the status has been accepted.

use std::path::PathBuf;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::{ClientConfig, TlsVersion};
use crate::env::Env;
use crate::error::{MigrateResult, MigrationError, PartialFailure, PartialResult};
use crate::jsonpath;
use crate::store::EnvMap;
use crate::task::{DownTask, EnvMissing, RequestSpec, ResponseSpec, UpTask};

/// Placeholder logged instead of sensitive header values.
pub const MASK: &str = "********";

/// Caller-supplied method and URL used when a request leaves them out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDefaults {
    /// Default method.
    pub method: Option<String>,
    /// Default URL.
    pub url: Option<String>,
}

/// Outcome of one HTTP call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Observed status, when a response was received.
    pub status: Option<u16>,
    /// Response body.
    pub body: String,
    /// Extracted variables.
    pub env: EnvMap,
}

#[derive(Debug, Clone, Copy)]
enum Expect<'a> {
    Codes(&'a [u16]),
    Success,
}

impl Expect<'_> {
    fn accepts(&self, status: u16) -> bool {
        match self {
            Self::Codes(codes) => codes.is_empty() || codes.contains(&status),
            Self::Success => (200..300).contains(&status),
        }
    }
}

#[derive(Debug)]
struct Prepared {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<String>,
}

/// Build the shared HTTP client from `client:` settings.
pub fn build_client(config: &ClientConfig) -> MigrateResult<reqwest::Client> {
    if let (Some(TlsVersion::Tls13), Some(TlsVersion::Tls12)) =
        (config.min_tls_version, config.max_tls_version)
    {
        return Err(MigrationError::config(
            "min_tls_version must not exceed max_tls_version",
        ));
    }

    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .danger_accept_invalid_certs(config.insecure);
    if let Some(version) = config.min_tls_version {
        builder = builder.min_tls_version(tls_version(version));
    }
    if let Some(version) = config.max_tls_version {
        builder = builder.max_tls_version(tls_version(version));
    }
    if let Some(timeout) = config.timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| MigrationError::config(format!("cannot build HTTP client: {e}")))
}

fn tls_version(version: TlsVersion) -> reqwest::tls::Version {
    match version {
        TlsVersion::Tls12 => reqwest::tls::Version::TLS_1_2,
        TlsVersion::Tls13 => reqwest::tls::Version::TLS_1_3,
    }
}

/// Whether a header carries credentials.
pub fn is_sensitive_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    matches!(
        name.as_str(),
        "authorization" | "proxy-authorization" | "cookie" | "set-cookie"
    ) || ["token", "secret", "api-key", "apikey"]
        .iter()
        .any(|needle| name.contains(needle))
}

/// Header pairs suitable for logging.
pub fn masked_headers(headers: &HeaderMap, mask: bool) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let shown = if mask && is_sensitive_header(name.as_str()) {
                MASK.to_string()
            } else {
                value.to_str().unwrap_or("<binary>").to_string()
            };
            (name.as_str().to_string(), shown)
        })
        .collect()
}

/// Renders, sends and validates task requests.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    base_dir: PathBuf,
    mask_sensitive: bool,
    cancel: CancellationToken,
}

impl HttpExecutor {
    /// Create an executor around a client.
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_dir: PathBuf::from("."),
            mask_sensitive: true,
            cancel: CancellationToken::new(),
        }
    }

    /// Directory `body_file` paths are relative to.
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    /// Whether to redact credentials in logs.
    pub fn with_masking(mut self, mask_sensitive: bool) -> Self {
        self.mask_sensitive = mask_sensitive;
        self
    }

    /// Abort in-flight calls when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The underlying client.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Run the forward half of a task.
    pub async fn execute_up(
        &self,
        task: &UpTask,
        env: &Env,
        defaults: &RequestDefaults,
    ) -> PartialResult<ExecResult> {
        self.execute(&task.request, &task.response, env, defaults)
            .await
    }

    /// Run the rollback half of a task: the optional find step, then the main
    /// call, which must return a 2xx status.
    ///
    /// Variables extracted by the find step are added to `env`'s local layer
    /// and returned in the result.
    pub async fn execute_down(&self, task: &DownTask, env: &mut Env) -> PartialResult<ExecResult> {
        let mut found = EnvMap::new();
        if let Some(find) = &task.find {
            debug!(name = %task.name, "Running find step");
            let result = self
                .execute(&find.request, &find.response, env, &RequestDefaults::default())
                .await?;
            env.extend_local(result.env.clone());
            found = result.env;
        }

        let request = task.request();
        let mut result = self
            .send(&request, Expect::Success, env, &RequestDefaults::default())
            .await
            .map_err(|failure| {
                let found = found.clone();
                failure.map(|mut r| {
                    r.env = found;
                    r
                })
            })?;
        result.env = found;
        Ok(result)
    }

    /// Render, send, validate and extract.
    pub async fn execute(
        &self,
        request: &RequestSpec,
        response: &ResponseSpec,
        env: &Env,
        defaults: &RequestDefaults,
    ) -> PartialResult<ExecResult> {
        let codes = render_codes(&response.result_code, env).await?;
        let mut result = self
            .send(request, Expect::Codes(&codes), env, defaults)
            .await?;

        match extract(&result.body, response) {
            Ok(vars) => {
                result.env = vars;
                Ok(result)
            }
            Err(failure) => {
                result.env = failure.partial;
                Err(PartialFailure::new(result, failure.error))
            }
        }
    }

    async fn send(
        &self,
        request: &RequestSpec,
        expect: Expect<'_>,
        env: &Env,
        defaults: &RequestDefaults,
    ) -> PartialResult<ExecResult> {
        let prepared = self.prepare(request, env, defaults).await?;
        let (status, body) = self.dispatch(prepared).await?;

        let result = ExecResult {
            status: Some(status),
            body,
            env: EnvMap::new(),
        };
        if !expect.accepts(status) {
            let error = MigrationError::UnexpectedStatus {
                status,
                body: result.body.clone(),
            };
            return Err(PartialFailure::new(result, error));
        }
        Ok(result)
    }

    async fn prepare(
        &self,
        request: &RequestSpec,
        env: &Env,
        defaults: &RequestDefaults,
    ) -> MigrateResult<Prepared> {
        let method = request
            .method
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .or(defaults.method.as_deref())
            .unwrap_or("GET");
        let method = env.render_lenient(method).await?;
        let method = Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| MigrationError::invalid_migration(format!("invalid method '{method}'")))?;

        let url = if request.url.trim().is_empty() {
            defaults.url.clone().unwrap_or_default()
        } else {
            request.url.clone()
        };
        if url.trim().is_empty() {
            return Err(MigrationError::invalid_migration("request has no url"));
        }
        let rendered_url = env.render_lenient(&url).await?;
        let mut url = Url::parse(rendered_url.trim()).map_err(|e| {
            MigrationError::invalid_migration(format!("invalid url '{rendered_url}': {e}"))
        })?;

        if !request.queries.is_empty() {
            let mut pairs = Vec::with_capacity(request.queries.len());
            for (key, value) in &request.queries {
                pairs.push((key.clone(), env.render_lenient(value).await?));
            }
            url.query_pairs_mut().extend_pairs(pairs);
        }

        let mut headers = HeaderMap::new();
        for (key, value) in &request.headers {
            let value = env.render_lenient(value).await?;
            insert_header(&mut headers, key, &value)?;
        }

        if let Some(name) = request.auth.as_deref().filter(|n| !n.is_empty()) {
            self.inject_auth(&mut headers, name, env).await?;
        }

        let raw_body = match (&request.body, &request.body_file) {
            (Some(body), _) => Some(body.clone()),
            (None, Some(file)) => {
                let path = crate::config::resolve(&self.base_dir, std::path::Path::new(file));
                Some(tokio::fs::read_to_string(&path).await.map_err(|e| {
                    MigrationError::invalid_migration(format!(
                        "cannot read body_file {}: {}",
                        path.display(),
                        e
                    ))
                })?)
            }
            (None, None) => None,
        };
        let body = match raw_body {
            Some(raw) => Some(env.render_strict(&raw).await?),
            None => None,
        };

        if let Some(body) = &body {
            if !headers.contains_key(CONTENT_TYPE)
                && serde_json::from_str::<serde_json::Value>(body).is_ok()
            {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
        }

        Ok(Prepared {
            method,
            url,
            headers,
            body,
        })
    }

    async fn inject_auth(&self, headers: &mut HeaderMap, name: &str, env: &Env) -> MigrateResult<()> {
        if let Some(entry) = env.auth(name) {
            if header_present(headers, &entry.header) {
                debug!(auth = %name, header = %entry.header, "Explicit header kept, auth not injected");
                return Ok(());
            }
            let value = entry.value.resolve().await?;
            return insert_header(headers, &entry.header, &value);
        }

        // Unregistered names fall back to a plain variable holding the header value.
        if let Some(value) = env.lookup(name) {
            if !header_present(headers, crate::auth::AUTHORIZATION) {
                insert_header(headers, crate::auth::AUTHORIZATION, value)?;
            }
            return Ok(());
        }

        Err(MigrationError::config(format!(
            "request references auth '{name}' which is not configured"
        )))
    }

    async fn dispatch(&self, prepared: Prepared) -> MigrateResult<(u16, String)> {
        let Prepared {
            method,
            url,
            headers,
            body,
        } = prepared;

        info!(method = %method, url = %url, "Sending request");
        debug!(headers = ?masked_headers(&headers, self.mask_sensitive), "Request headers");
        if let Some(body) = &body {
            trace!(body = %body, "Request body");
        }

        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(MigrationError::Cancelled),
            response = builder.send() => response?,
        };
        let status = response.status().as_u16();
        let body = tokio::select! {
            _ = self.cancel.cancelled() => return Err(MigrationError::Cancelled),
            body = response.text() => body?,
        };

        info!(status, "Received response");
        trace!(body = %body, "Response body");
        Ok((status, body))
    }
}

fn header_present(headers: &HeaderMap, name: &str) -> bool {
    HeaderName::from_bytes(name.as_bytes())
        .map(|name| headers.contains_key(name))
        .unwrap_or(false)
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> MigrateResult<()> {
    let header = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| MigrationError::invalid_migration(format!("invalid header name '{name}'")))?;
    let value = HeaderValue::from_str(value).map_err(|_| {
        MigrationError::invalid_migration(format!("invalid value for header '{name}'"))
    })?;
    headers.insert(header, value);
    Ok(())
}

async fn render_codes(codes: &[String], env: &Env) -> MigrateResult<Vec<u16>> {
    let mut parsed = Vec::with_capacity(codes.len());
    for code in codes {
        let rendered = env.render_strict(code).await?;
        let status = rendered.trim().parse::<u16>().map_err(|_| {
            MigrationError::invalid_migration(format!("result_code '{rendered}' is not a status code"))
        })?;
        parsed.push(status);
    }
    Ok(parsed)
}

/// Apply `response.env_from` to a body.
///
/// Under [`EnvMissing::Fail`] every resolvable key is still collected and
/// returned alongside an error naming the first missing key.
pub fn extract(body: &str, response: &ResponseSpec) -> Result<EnvMap, PartialFailure<EnvMap>> {
    let mut vars = EnvMap::new();
    if response.env_from.is_empty() {
        return Ok(vars);
    }

    let json = serde_json::from_str::<serde_json::Value>(body).ok();
    let mut first_missing = None;
    for (key, path) in &response.env_from {
        match json.as_ref().and_then(|j| jsonpath::select_string(j, path)) {
            Some(value) => {
                vars.insert(key.clone(), value);
            }
            None => {
                debug!(key = %key, path = %path, "Extraction path not found");
                first_missing.get_or_insert_with(|| (key.clone(), path.clone()));
            }
        }
    }

    match (response.env_missing, first_missing) {
        (EnvMissing::Fail, Some((key, path))) => {
            Err(PartialFailure::new(vars, MigrationError::MissingEnv { key, path }))
        }
        _ => Ok(vars),
    }
}
