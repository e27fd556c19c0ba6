//! Pre-run health check.

use std::time::Duration;

use reqwest::Method;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::WaitConfig;
use crate::env::Env;
use crate::error::{MigrateResult, MigrationError};

/// Poll `config.url` until it answers with the expected status.
///
/// Transport errors count as "not ready yet". Fails with
/// [`MigrationError::WaitTimeout`] once `config.timeout` has elapsed.
pub async fn wait_until_ready(
    client: &reqwest::Client,
    config: &WaitConfig,
    env: &Env,
    cancel: &CancellationToken,
) -> MigrateResult<()> {
    let url = env.render_lenient(&config.url).await?;
    let method = env.render_lenient(&config.method).await?;
    let method = Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| MigrationError::config(format!("invalid wait method '{method}'")))?;

    info!(url = %url, expected = config.expected_status, "Waiting for service");
    let deadline = Instant::now() + config.timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return Err(MigrationError::Cancelled),
            r = tokio::time::timeout(remaining, client.request(method.clone(), &url).send()) => r,
        };
        let last = match attempt {
            Ok(Ok(response)) if response.status().as_u16() == config.expected_status => {
                info!(attempts, "Service is ready");
                return Ok(());
            }
            Ok(Ok(response)) => format!("status {}", response.status().as_u16()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "no response before the deadline".to_string(),
        };
        debug!(attempt = attempts, last = %last, "Service not ready");

        let now = Instant::now();
        if now >= deadline {
            return Err(MigrationError::WaitTimeout(format!(
                "{} not ready after {} attempts ({})",
                url, attempts, last
            )));
        }
        let pause = config.interval.min(deadline - now).max(Duration::from_millis(1));
        tokio::select! {
            _ = cancel.cancelled() => return Err(MigrationError::Cancelled),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;

    use super::*;
    use crate::test_support::serve;

    fn config(url: String) -> WaitConfig {
        WaitConfig {
            url,
            method: "GET".into(),
            expected_status: 200,
            timeout: Duration::from_secs(2),
            interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_waits_until_ready() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let base = serve(Router::new().route(
            "/health",
            get(move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        ))
        .await;

        let mut env = Env::new();
        env.set_global("base", base);
        wait_until_ready(
            &reqwest::Client::new(),
            &config("{{.env.base}}/health".into()),
            &env,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let base = serve(Router::new().route(
            "/health",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                StatusCode::OK
            }),
        ))
        .await;

        let mut wait = config(format!("{base}/health"));
        wait.timeout = Duration::from_millis(100);
        let started = Instant::now();
        let err = wait_until_ready(
            &reqwest::Client::new(),
            &wait,
            &Env::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MigrationError::WaitTimeout(_)), "unexpected error: {err}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_times_out() {
        let mut wait = config("http://127.0.0.1:9/health".into());
        wait.timeout = Duration::from_millis(100);
        let err = wait_until_ready(
            &reqwest::Client::new(),
            &wait,
            &Env::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MigrationError::WaitTimeout(_)));
    }
}
