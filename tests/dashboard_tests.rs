
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;

use jobfleet::coordinator::CoordinatorHandle;
use jobfleet::dashboard::{router, DashboardState};
use jobfleet::job::JobState;
use test_harness::{simple_job, TestCoordinator};

const USER: &str = "alice@example.com";

fn app(coord: &TestCoordinator) -> Router {
    router(DashboardState {
        coordinator: coord.handle.clone(),
    })
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_workers_endpoint_empty() {
    let coord = TestCoordinator::start().await;

    let (status, json) = get_json(app(&coord), "/api/workers").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, Value::Array(vec![]));

    coord.shutdown().await;
}

#[tokio::test]
async fn test_workers_endpoint_lists_connected_workers() {
    let coord = TestCoordinator::start().await;
    let _worker = coord.worker("ws1", &[12.5, 80.0]).await;

    let (status, json) = get_json(app(&coord), "/api/workers").await;
    assert_eq!(status, StatusCode::OK);
    let workers = json.as_array().unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0]["name"], "ws1");
    assert_eq!(workers[0]["os"], "Linux");
    assert_eq!(workers[0]["cpu_count"], 2);
    assert_eq!(workers[0]["cpu_load"][1], 80.0);
    assert_eq!(workers[0]["maintenance"], false);
    assert!(workers[0]["last_report"].is_string());

    coord.shutdown().await;
}

#[tokio::test]
async fn test_jobs_endpoint_shows_state_names() {
    let coord = TestCoordinator::start().await;
    let owner = coord.add_user(USER, false);
    let job_id = coord.submit(USER, simple_job("sim")).await;
    coord
        .wait_for_state(job_id, JobState::WaitingForWorkstation)
        .await;

    let (status, json) = get_json(app(&coord), "/api/jobs").await;
    assert_eq!(status, StatusCode::OK);
    let jobs = json.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["id"], job_id);
    assert_eq!(jobs[0]["name"], "sim");
    assert_eq!(jobs[0]["owner"], owner.id);
    assert_eq!(jobs[0]["state"], "WAITING_FOR_WORKSTATION");
    assert!(jobs[0]["workstation"].is_null());
    assert!(jobs[0]["added"].is_string());

    coord.shutdown().await;
}

#[tokio::test]
async fn test_queue_endpoint_lists_waiting_jobs() {
    let coord = TestCoordinator::start().await;
    coord.add_user(USER, false);
    let first = coord.submit(USER, simple_job("a")).await;
    let second = coord.submit(USER, simple_job("b")).await;
    coord
        .wait_for_state(second, JobState::WaitingForWorkstation)
        .await;

    let (status, json) = get_json(app(&coord), "/api/queue").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["length"], 2);
    let mut queued: Vec<u64> = json["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|id| id.as_u64().unwrap())
        .collect();
    queued.sort_unstable();
    assert_eq!(queued, vec![first, second]);

    coord.shutdown().await;
}

#[tokio::test]
async fn test_stopped_coordinator_gives_service_unavailable() {
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let app = router(DashboardState {
        coordinator: CoordinatorHandle::new(tx),
    });

    let (status, json) = get_json(app, "/api/jobs").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(json["error"].as_str().unwrap().contains("coordinator"));
}

#[tokio::test]
async fn test_cors_headers_present() {
    let coord = TestCoordinator::start().await;

    let response = app(&coord)
        .oneshot(
            Request::builder()
                .uri("/api/queue")
                .header("Origin", "http://localhost:3000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );

    coord.shutdown().await;
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let coord = TestCoordinator::start().await;

    let response = app(&coord)
        .oneshot(Request::builder().uri("/api/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    coord.shutdown().await;
}
