#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use engine::{JobLedger, SimulatedAdapter};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

/// Ledger backed by a simulated engine that takes `delay` per backtest
pub fn simulated_ledger(delay: Duration) -> Arc<JobLedger> {
    Arc::new(JobLedger::new(Arc::new(SimulatedAdapter::new(delay))))
}

/// Full application router, as served by `lean-service serve`
pub fn build_test_app(ledger: Arc<JobLedger>) -> Router {
    lean_service::router(ledger)
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("failed to read response body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("response body is not JSON")
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn post_raw(app: &Router, uri: &str, body: &str) -> Response<Body> {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.clone().oneshot(request).await.unwrap()
}

pub async fn post_json(app: &Router, uri: &str, body: &Value) -> Response<Body> {
    post_raw(app, uri, &body.to_string()).await
}

/// Poll `GET /backtest/{id}` until the job leaves `running`
pub async fn wait_until_finished(app: &Router, id: &str) -> Value {
    for _ in 0..200 {
        let response = get(app, &format!("/backtest/{id}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        if json["status"] != "running" {
            return json;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("backtest {id} did not finish in time");
}
