//! End-to-end tests for stage orchestration over SQLite stores.

use std::path::Path;
use std::sync::{Arc, Mutex};

use apimigrate::prelude::*;
use apimigrate::{StageOutcome, StageReport};
use axum::Router;
use axum::extract::Path as UrlPath;
use axum::http::StatusCode;
use axum::routing::post;
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
    let org_calls = Arc::clone(&calls);
    let drop_calls = Arc::clone(&calls);
    let project_calls = Arc::clone(&calls);
    let unproject_calls = Arc::clone(&calls);
    Router::new()
        .route(
            "/orgs",
            post(move || {
                org_calls.lock().unwrap().push("org".to_string());
                async { (StatusCode::CREATED, axum::Json(json!({ "org": { "id": 7 } }))) }
            }),
        )
        .route(
            "/orgs/{id}",
            axum::routing::delete(move |UrlPath(id): UrlPath<String>| {
                drop_calls.lock().unwrap().push(format!("drop-org:{id}"));
                async { StatusCode::NO_CONTENT }
            }),
        )
        .route(
            "/orgs/{id}/projects",
            post(move |UrlPath(id): UrlPath<String>| {
                project_calls.lock().unwrap().push(format!("project:{id}"));
                async { StatusCode::CREATED }
            })
            .delete(move |UrlPath(id): UrlPath<String>| {
                unproject_calls.lock().unwrap().push(format!("unproject:{id}"));
                async { StatusCode::OK }
            }),
        )
}

const ORG: &str = r#"
up:
  request:
    method: POST
    url: "{{.env.base}}/orgs"
  response:
    result_code: ["201"]
    env_from:
      org_id: org.id
down:
  method: DELETE
  url: "{{.env.base}}/orgs/{{.env.org_id}}"
"#;

const PROJECT: &str = r#"
up:
  request:
    method: POST
    url: "{{.env.base}}/orgs/{{.env.org_id}}/projects"
down:
  method: DELETE
  url: "{{.env.base}}/orgs/{{.env.org_id}}/projects"
"#;

const STAGES: &str = r#"
stages:
  - name: accounts
    config_path: accounts
  - name: projects
    config_path: projects
    depends_on: [accounts]
    env_from_stages:
      - stage: accounts
        vars: [org_id]
"#;

fn write_stage(root: &Path, name: &str, migration: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(dir.join("migrations")).unwrap();
    std::fs::write(
        dir.join("config.yaml"),
        "migration_delay_ms: 0\nstore:\n  driver: sqlite\n  path: state.db\n",
    )
    .unwrap();
    std::fs::write(dir.join("migrations").join("001_init.yaml"), migration).unwrap();
}

fn write_stages(root: &Path, base: &str) {
    write_stage(root, "accounts", ORG);
    write_stage(root, "projects", PROJECT);
    std::fs::write(
        root.join("stages.yaml"),
        format!("{STAGES}\nglobal:\n  env:\n    base: {base}\n"),
    )
    .unwrap();
}

fn orchestrator(root: &Path) -> Orchestrator {
    Orchestrator::load(&root.join("stages.yaml"), Arc::new(DriverStoreFactory)).unwrap()
}

fn outcomes(reports: &[StageReport]) -> Vec<(String, StageOutcome)> {
    reports
        .iter()
        .map(|r| (r.stage.clone(), r.outcome.clone()))
        .collect()
}

#[tokio::test]
async fn test_dependency_gate_uses_store_state() {
    let calls: Calls = Arc::default();
    let base = serve(api(Arc::clone(&calls))).await;
    let root = TempDir::new().unwrap();
    write_stages(root.path(), &base);

    let failure = orchestrator(root.path())
        .up(&StageSelection::only("projects"))
        .await
        .unwrap_err();
    assert!(
        failure.error.to_string().contains("has not been executed"),
        "unexpected error: {}",
        failure.error
    );
    assert!(calls.lock().unwrap().is_empty());

    let reports = orchestrator(root.path())
        .up(&StageSelection::only("accounts"))
        .await
        .unwrap();
    assert_eq!(
        outcomes(&reports),
        vec![("accounts".to_string(), StageOutcome::Succeeded)]
    );

    // A fresh invocation reads the accounts export from its SQLite store.
    let reports = orchestrator(root.path())
        .up(&StageSelection::only("projects"))
        .await
        .unwrap();
    assert_eq!(
        outcomes(&reports),
        vec![("projects".to_string(), StageOutcome::Succeeded)]
    );
    assert_eq!(*calls.lock().unwrap(), vec!["org", "project:7"]);
    assert!(root.path().join("accounts").join("state.db").exists());
    assert!(root.path().join("projects").join("state.db").exists());
}

#[tokio::test]
async fn test_stages_up_status_down() {
    let calls: Calls = Arc::default();
    let base = serve(api(Arc::clone(&calls))).await;
    let root = TempDir::new().unwrap();
    write_stages(root.path(), &base);
    let orchestrator = orchestrator(root.path());

    let reports = orchestrator.up(&StageSelection::all()).await.unwrap();
    assert!(reports.iter().all(|r| r.outcome == StageOutcome::Succeeded));

    let statuses = orchestrator
        .status(&StageSelection::all(), true)
        .await
        .unwrap();
    let versions: Vec<(String, i64)> = statuses
        .iter()
        .map(|s| (s.stage.clone(), s.status.current_version))
        .collect();
    assert_eq!(
        versions,
        vec![("accounts".to_string(), 1), ("projects".to_string(), 1)]
    );

    let reports = orchestrator.down(&StageSelection::all()).await.unwrap();
    let order: Vec<&str> = reports.iter().map(|r| r.stage.as_str()).collect();
    assert_eq!(order, vec!["projects", "accounts"]);
    assert_eq!(
        *calls.lock().unwrap(),
        vec!["org", "project:7", "unproject:7", "drop-org:7"]
    );

    let statuses = orchestrator
        .status(&StageSelection::all(), false)
        .await
        .unwrap();
    assert!(statuses.iter().all(|s| s.status.current_version == 0));
}
