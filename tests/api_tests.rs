//! HTTP API tests: the full router driven in-process with fake shell agents.

mod common;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use common::{THREE_PHASES, Workspace, head_of};
use evolve::config::Config;
use evolve::server::{AppState, build_router};

fn app(ws: &Workspace) -> (Arc<AppState>, Router) {
    let config = Config::load(&ws.state_dir()).unwrap();
    config.ensure_directories().unwrap();
    let state = Arc::new(AppState::from_config(&config));
    (state.clone(), build_router(state))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, json: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(json.to_string()))
        .unwrap()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn run_job(app: &Router, project: &str) -> (String, Vec<serde_json::Value>) {
    let resp = app
        .clone()
        .oneshot(post("/execute", serde_json::json!({"project_path": project})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let job_id = body_json(resp).await["job_id"]
        .as_str()
        .unwrap()
        .to_string();

    let resp = app
        .clone()
        .oneshot(get(&format!("/stream/{}", job_id)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let events = String::from_utf8(bytes.to_vec())
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    (job_id, events)
}

#[tokio::test]
async fn test_execute_streams_events_in_order() {
    let ws = Workspace::new();
    ws.write_config("");
    ws.add_project("demo", THREE_PHASES);
    let (state, app) = app(&ws);

    let (job_id, events) = run_job(&app, "demo").await;
    let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert_eq!(types.first(), Some(&"job_started"));
    assert_eq!(types.last(), Some(&"job_complete"));
    assert_eq!(events.last().unwrap()["status"], "completed");

    let completed: Vec<&str> = events
        .iter()
        .filter(|e| e["type"] == "phase_complete")
        .map(|e| e["phase_id"].as_str().unwrap())
        .collect();
    assert_eq!(completed, vec!["design", "impl", "docs"]);

    let classes: Vec<&str> = events
        .iter()
        .filter(|e| e["type"] == "output_line")
        .map(|e| e["event"]["class"].as_str().unwrap())
        .collect();
    assert!(classes.contains(&"text"));
    assert!(classes.contains(&"tool_use"));
    assert!(classes.contains(&"result"));
    assert!(classes.contains(&"unknown"));

    state.engine.wait_for_completion(&job_id).await.unwrap();
    let resp = app
        .clone()
        .oneshot(get(&format!("/jobs/{}", job_id)))
        .await
        .unwrap();
    let job = body_json(resp).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["phases"][1]["attempts"].as_array().unwrap().len(), 2);
    assert_eq!(job["usage"]["attempts"], 4);

    // A late subscriber replays the whole history.
    let resp = app
        .clone()
        .oneshot(get(&format!("/stream/{}", job_id)))
        .await
        .unwrap();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(String::from_utf8(bytes.to_vec()).unwrap().lines().count(), events.len());

    let resp = app.oneshot(get("/jobs")).await.unwrap();
    let jobs = body_json(resp).await;
    assert_eq!(jobs.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_escalation_over_http() {
    let ws = Workspace::new();
    ws.write_config("");
    // The impl test gate can never pass.
    ws.add_project(
        "stuck",
        &THREE_PHASES.replace("test -f new/fixed.txt", "false"),
    );
    let (state, app) = app(&ws);

    let (job_id, events) = run_job(&app, "stuck").await;
    assert!(events.iter().any(|e| e["type"] == "escalated"));
    let job = state.engine.wait_for_completion(&job_id).await.unwrap();
    assert_eq!(
        job.last_failure.as_ref().map(|f| f.category.as_str()),
        Some("escalation")
    );

    let resp = app.clone().oneshot(get("/escalations")).await.unwrap();
    let escalations = body_json(resp).await;
    assert_eq!(escalations[0]["phase_id"], "impl");
    assert_eq!(escalations[0]["attempts"].as_array().unwrap().len(), 3);

    let resp = app
        .clone()
        .oneshot(post(
            &format!("/jobs/{}/resume", job_id),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = app
        .clone()
        .oneshot(post(
            &format!("/escalations/{}/impl/resolve", job_id),
            serde_json::json!({"note": "looked at it"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["resolution"]["state"], "resolved");

    // Skipping past the escalated phase is refused.
    let resp = app
        .clone()
        .oneshot(post(
            &format!("/jobs/{}/resume", job_id),
            serde_json::json!({"from_phase": "docs"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_hostile_input_is_rejected() {
    let ws = Workspace::new();
    ws.write_config("");
    let (_state, app) = app(&ws);

    let resp = app
        .clone()
        .oneshot(post(
            "/execute",
            serde_json::json!({"project_path": "../outside"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .clone()
        .oneshot(get("/jobs/bad;rm%20-rf"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .clone()
        .oneshot(get("/evolution/projects/..%2F..%2Fetc"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .oneshot(post(
            "/sessions/x%00y/messages",
            serde_json::json!({"content": "hi"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_evolution_promotion_and_rollback_over_http() {
    let ws = Workspace::new();
    let (test_env, production) = ws.add_environments();
    ws.write_config(&ws.environments_toml());
    ws.add_project("demo", THREE_PHASES);
    let (state, app) = app(&ws);
    let production_before = head_of(&production);

    let (job_id, _) = run_job(&app, "demo").await;
    state.engine.wait_for_completion(&job_id).await.unwrap();

    // Integrate before validation is a precondition failure.
    let resp = app
        .clone()
        .oneshot(post("/evolution/projects/demo/integrate", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);

    let resp = app
        .clone()
        .oneshot(post("/evolution/projects/demo/deploy", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let record = body_json(resp).await;
    assert_eq!(record["stage"], "deployed");
    assert_eq!(record["baseline"], production_before.as_str());
    assert!(test_env.join("impl.txt").exists());

    let resp = app
        .clone()
        .oneshot(post("/evolution/projects/demo/validate", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await["stage"], "validated");

    // Rollback restores the test env to its pre-deploy revision.
    let resp = app
        .clone()
        .oneshot(post("/evolution/projects/demo/rollback", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["stage"], "rolled_back");
    assert!(!test_env.join("impl.txt").exists());
    assert_eq!(head_of(&production), production_before);

    let resp = app
        .clone()
        .oneshot(get("/evolution/projects/demo"))
        .await
        .unwrap();
    let status = body_json(resp).await;
    assert_eq!(status["stage"], "rolled_back");
    assert_eq!(status["project_status"], "rolled_back");
}

#[tokio::test]
async fn test_sessions_converge_over_http() {
    let ws = Workspace::new();
    ws.write_config("");
    let (_state, app) = app(&ws);

    let mut handles = Vec::new();
    for i in 0..6 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            let resp = app
                .oneshot(post(
                    "/sessions",
                    serde_json::json!({"correlation_id": "thread-9", "message": format!("m{}", i)}),
                ))
                .await
                .unwrap();
            let status = resp.status();
            (status, body_json(resp).await)
        }));
    }
    let mut created = 0;
    for handle in handles {
        let (status, body) = handle.await.unwrap();
        assert!(status == StatusCode::CREATED || status == StatusCode::OK);
        assert_eq!(body["session_id"], "thread-9");
        if body["created"] == true {
            created += 1;
        }
    }
    assert_eq!(created, 1);

    let resp = app.clone().oneshot(get("/sessions/thread-9")).await.unwrap();
    assert_eq!(body_json(resp).await["messages"].as_array().unwrap().len(), 6);

    let resp = app
        .oneshot(post("/sessions/archive", serde_json::json!({"max_age_secs": 0})))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await["archived"][0], "thread-9");
}
