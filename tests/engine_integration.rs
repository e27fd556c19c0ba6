//! End-to-end tests for a single migration directory.
//!
//! Each test serves a small API with axum, writes a `config.yaml` and its
//! migrations to a temp directory and runs the engine against a SQLite
//! store opened through [`DriverStoreFactory`].

use std::path::Path;
use std::sync::{Arc, Mutex};

use apimigrate::prelude::*;
use apimigrate::{Direction, MigrationStatus, VersionResult};
use axum::Router;
use axum::extract::Path as UrlPath;
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

type Calls = Arc<Mutex<Vec<String>>>;

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn api(calls: Calls) -> Router {
    let create_calls = Arc::clone(&calls);
    let use_calls = Arc::clone(&calls);
    let cleanup_calls = Arc::clone(&calls);
    let delete_calls = Arc::clone(&calls);
    Router::new()
        .route(
            "/create",
            post(move || {
                create_calls.lock().unwrap().push("create".to_string());
                async { (StatusCode::CREATED, axum::Json(json!({ "id": "r-42" }))) }
            }),
        )
        .route(
            "/use/{rid}",
            get(move |UrlPath(rid): UrlPath<String>| {
                use_calls.lock().unwrap().push(format!("use:{rid}"));
                async { StatusCode::OK }
            })
            .delete(move |UrlPath(rid): UrlPath<String>| {
                cleanup_calls.lock().unwrap().push(format!("cleanup:{rid}"));
                async { StatusCode::OK }
            }),
        )
        .route(
            "/delete/{rid}",
            delete(move |UrlPath(rid): UrlPath<String>| {
                delete_calls.lock().unwrap().push(format!("delete:{rid}"));
                async { StatusCode::NO_CONTENT }
            }),
        )
        .route("/conflict", post(|| async { StatusCode::CREATED }))
}

fn write_project(dir: &Path, base: &str, migrations: &[(&str, &str)]) {
    std::fs::create_dir_all(dir.join("migrations")).unwrap();
    std::fs::write(
        dir.join("config.yaml"),
        format!(
            "migration_delay_ms: 0\nenv:\n  - name: base\n    value: {base}\nstore:\n  driver: sqlite\n  path: state/apimigrate.db\n  save_response_body: true\n"
        ),
    )
    .unwrap();
    for (name, content) in migrations {
        std::fs::write(dir.join("migrations").join(name), content).unwrap();
    }
}

async fn engine(dir: &Path) -> MigrationEngine {
    let project = ProjectConfig::load(&dir.join("config.yaml")).unwrap();
    let store = DriverStoreFactory
        .open(&project.store, &project.base_dir)
        .await
        .unwrap();
    MigrationEngine::builder(&project)
        .store(store)
        .build()
        .await
        .unwrap()
}

fn versions(results: &[VersionResult]) -> Vec<(i64, Direction)> {
    results.iter().map(|r| (r.version, r.direction)).collect()
}

const CREATE: &str = r#"
up:
  request:
    method: POST
    url: "{{.env.base}}/create"
  response:
    result_code: ["201"]
    env_from:
      rid: id
down:
  method: DELETE
  url: "{{.env.base}}/delete/{{.env.rid}}"
"#;

const USE: &str = r#"
up:
  request:
    method: GET
    url: "{{.env.base}}/use/{{.env.rid}}"
down:
  method: DELETE
  url: "{{.env.base}}/use/{{.env.rid}}"
"#;

const CONFLICT: &str = r#"
up:
  request:
    method: POST
    url: "{{.env.base}}/conflict"
  response:
    result_code: ["200", "409"]
"#;

#[tokio::test]
async fn test_up_then_down_round_trip() {
    let calls: Calls = Arc::default();
    let base = serve(api(Arc::clone(&calls))).await;
    let dir = TempDir::new().unwrap();
    write_project(
        dir.path(),
        &base,
        &[("002_use.yaml", USE), ("001_create.yaml", CREATE)],
    );

    let engine = engine(dir.path()).await;
    let applied = engine.up(None).await.unwrap();
    assert_eq!(versions(&applied), vec![(1, Direction::Up), (2, Direction::Up)]);
    assert_eq!(applied[0].env.get("rid").map(String::as_str), Some("r-42"));
    assert_eq!(engine.exported_env().await.unwrap().get("rid").unwrap(), "r-42");

    // Idempotent
    assert!(engine.up(None).await.unwrap().is_empty());

    let rolled_back = engine.down(0).await.unwrap();
    assert_eq!(
        versions(&rolled_back),
        vec![(2, Direction::Down), (1, Direction::Down)]
    );
    assert_eq!(rolled_back[1].status, Some(204));

    let store = engine.store();
    assert_eq!(store.current_version().await.unwrap(), 0);
    assert_eq!(store.load_stored_env(1).await.unwrap(), None);
    assert_eq!(store.load_stored_env(2).await.unwrap(), None);
    assert_eq!(store.list_runs().await.unwrap().len(), 4);
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["create", "use:r-42", "cleanup:r-42", "delete:r-42"]
    );
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let base = serve(api(Arc::default())).await;
    let dir = TempDir::new().unwrap();
    write_project(dir.path(), &base, &[("001_create.yaml", CREATE)]);

    engine(dir.path()).await.up(None).await.unwrap();
    assert!(dir.path().join("state").join("apimigrate.db").exists());

    std::fs::write(dir.path().join("migrations").join("002_use.yaml"), USE).unwrap();
    let reopened = engine(dir.path()).await;
    let MigrationStatus {
        current_version,
        pending,
        ..
    } = reopened.status(false).await.unwrap();
    assert_eq!(current_version, 1);
    assert_eq!(pending.len(), 1);

    // Version 2 renders `rid` from version 1's stored env.
    let results = reopened.up(None).await.unwrap();
    assert_eq!(versions(&results), vec![(2, Direction::Up)]);
    assert_eq!(results[0].status, Some(200));
}

#[tokio::test]
async fn test_rejected_status_is_recorded_not_applied() {
    let base = serve(api(Arc::default())).await;
    let dir = TempDir::new().unwrap();
    write_project(
        dir.path(),
        &base,
        &[("001_create.yaml", CREATE), ("002_conflict.yaml", CONFLICT), ("003_use.yaml", USE)],
    );

    let engine = engine(dir.path()).await;
    let failure = engine.up(None).await.unwrap_err();
    assert_eq!(failure.error.status_code(), Some(201));
    assert_eq!(versions(&failure.partial), vec![(1, Direction::Up), (2, Direction::Up)]);
    assert!(failure.partial[1].failed);
    assert_eq!(failure.partial[1].status, Some(201));

    let status = engine.status(true).await.unwrap();
    assert_eq!(status.applied, vec![1]);
    let history = status.history.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[1].failed);
    assert_eq!(history[1].status_code, Some(201));
    assert_eq!(history[0].body.as_deref(), Some(r#"{"id":"r-42"}"#));
}
