mod test_harness;

use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tower::ServiceExt;
use uuid::Uuid;

use grid_lite::config::LoadBalancerConfig;
use grid_lite::management::router;
use grid_lite::{Job, TaskSpec, Unit};
use test_harness::{test_driver_config, TestGrid};

fn app(grid: &TestGrid) -> Router {
    router(grid.management().clone())
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn with_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn sleep_job(units: usize) -> Job {
    let mut job = Job::new("queued");
    for _ in 0..units {
        job.add_unit(Unit::new(TaskSpec::new("sleep", "10000")));
    }
    job
}

#[tokio::test]
async fn test_statistics_endpoint() {
    let grid = TestGrid::fixed(2).await;
    let (status, body) = send(app(&grid), get("/api/statistics")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs_admitted"], 0);
    assert_eq!(body["executors"], 0);
    assert_eq!(body["jobs_queued"], 0);
}

#[tokio::test]
async fn test_executors_endpoint_lists_connected_nodes() {
    let mut grid = TestGrid::fixed(2).await;
    let node = grid.add_node(3).await;

    let (status, body) = send(app(&grid), get("/api/executors")).await;
    assert_eq!(status, StatusCode::OK);
    let executors = body.as_array().unwrap();
    assert_eq!(executors.len(), 1);
    assert_eq!(executors[0]["uuid"], node.to_string());
    assert_eq!(executors[0]["processing_threads"], 3);
    assert_eq!(executors[0]["state"], "Idle");
}

#[tokio::test]
async fn test_jobs_endpoint_and_cancel() {
    let grid = TestGrid::fixed(2).await;
    let client = grid.client().await;
    let handle = client.submit(sleep_job(3)).await.unwrap();
    let job_id = handle.job_id();

    let (status, body) = send(app(&grid), get("/api/jobs")).await;
    assert_eq!(status, StatusCode::OK);
    let jobs = body.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["id"], job_id.to_string());
    assert_eq!(jobs[0]["pending"], 3);
    assert_eq!(jobs[0]["status"], "pending");

    let uri = format!("/api/jobs/{job_id}/cancel");
    let (status, body) = send(app(&grid), post(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], true);

    let report = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(report.cancelled);

    // Already gone
    let (status, body) = send(app(&grid), post(&uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains(&job_id.to_string()));
}

#[tokio::test]
async fn test_load_balancer_get_and_put() {
    let grid = TestGrid::fixed(5).await;

    let (status, body) = send(app(&grid), get("/api/load-balancer")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"algorithm": "fixed", "size": 5}));

    let (status, body) = send(
        app(&grid),
        with_json(
            "PUT",
            "/api/load-balancer",
            json!({"algorithm": "node_threads", "multiplier": 2, "max_size": 50}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let generation = body["generation"].as_u64().unwrap();

    let (_, body) = send(app(&grid), get("/api/load-balancer")).await;
    assert_eq!(body["algorithm"], "node_threads");

    // Invalid settings leave the current configuration in place
    let (status, _) = send(
        app(&grid),
        with_json(
            "PUT",
            "/api/load-balancer",
            json!({"algorithm": "fixed", "size": 0}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(grid.driver.state().bundlers.generation(), generation);
}

#[tokio::test]
async fn test_threads_endpoint() {
    let mut grid = TestGrid::fixed(2).await;
    let node = grid.add_node(1).await;

    let uri = format!("/api/executors/{node}/threads");
    let (status, _) = send(app(&grid), with_json("POST", &uri, json!({"size": 2}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _) = send(app(&grid), with_json("POST", &uri, json!({"size": 0}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let unknown = format!("/api/executors/{}/threads", Uuid::new_v4());
    let (status, body) = send(app(&grid), with_json("POST", &unknown, json!({"size": 2}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().starts_with("Executor not found"));
}

#[tokio::test]
async fn test_management_listener_serves_api() {
    let config = test_driver_config(LoadBalancerConfig::Fixed { size: 1 })
        .with_management("127.0.0.1:0".parse().unwrap());
    let grid = TestGrid::start(config).await;
    let addr = grid.driver.management_addr().expect("management listener bound");

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /api/statistics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("jobs_admitted"));
}
