//! HTTP surface, driven through the router without binding a socket.

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use kisan_advisor::{
    auth::AuthManager,
    catalog::names,
    engine::{InvocationResult, ScriptedEngine},
    server::{create_router, AppState, HistoryResponse, SimpleResponse},
    storage::ConversationStore,
    Orchestrator, Settings,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;
use tracing_test::traced_test;

const BOUNDARY: &str = "kisan-test-boundary";

struct Harness {
    router: Router,
    token: String,
    media_dir: TempDir,
}

fn harness() -> Harness {
    harness_with(ScriptedEngine::offline_demo(), |_| {})
}

fn harness_with(engine: ScriptedEngine, configure: impl FnOnce(&mut Settings)) -> Harness {
    let media_dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::offline();
    settings.security.enable_authentication = true;
    settings.security.jwt_secret = Some("http-test-secret".to_string());
    settings.storage.media_dir = media_dir.path().to_path_buf();
    configure(&mut settings);

    let token = AuthManager::from_config(&settings.security)
        .unwrap()
        .issue_token("farmer-7")
        .unwrap();
    let orchestrator = Orchestrator::with_engine(&settings, Arc::new(engine)).unwrap();
    let state = AppState::new(settings, orchestrator, ConversationStore::temporary().unwrap()).unwrap();
    Harness {
        router: create_router(state),
        token,
        media_dir,
    }
}

enum Field<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a str, &'a str, &'a [u8]),
}

fn multipart(fields: &[Field]) -> Vec<u8> {
    let mut body = Vec::new();
    for field in fields {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match field {
            Field::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n", name, value).as_bytes(),
                );
            }
            Field::File(name, filename, mime, data) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                        name, filename, mime
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
                body.extend_from_slice(b"\r\n");
            }
        }
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn simple_request(token: Option<&str>, fields: &[Field]) -> Request<Body> {
    let mut builder = Request::post("/api/simple").header(
        header::CONTENT_TYPE,
        format!("multipart/form-data; boundary={}", BOUNDARY),
    );
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(multipart(fields))).unwrap()
}

async fn json_body<T: DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn ping_is_public() {
    let h = harness();
    let response = h
        .router
        .oneshot(Request::get("/api/ping").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    let body: serde_json::Value = json_body(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn health_reports_the_coordinator() {
    let h = harness();
    let response = h
        .router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body: serde_json::Value = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["strategy"], "dispatcher");
    assert_eq!(body["engine"], "scripted");
}

#[tokio::test]
#[traced_test]
async fn questions_require_a_token() {
    let h = harness();
    let response = h
        .router
        .oneshot(simple_request(None, &[Field::Text("query", "tomato price")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let h = harness();
    let response = h
        .router
        .oneshot(simple_request(Some("not-a-jwt"), &[Field::Text("query", "tomato price")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
#[traced_test]
async fn empty_form_is_rejected() {
    let h = harness();
    let response = h.router.oneshot(simple_request(Some(&h.token), &[])).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = json_body(response).await;
    assert!(body["detail"].is_string());
}

#[tokio::test]
#[traced_test]
async fn answers_are_recorded_in_history() {
    let h = harness();
    let response = h
        .router
        .clone()
        .oneshot(simple_request(
            Some(&h.token),
            &[Field::Text("query", "What is the tomato price in Hubli?")],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let answer: SimpleResponse = json_body(response).await;
    assert!(answer.response.contains("Hold"));

    let response = h
        .router
        .oneshot(
            Request::get("/api/chat-history?limit=5")
                .header(header::AUTHORIZATION, format!("Bearer {}", h.token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let history: HistoryResponse = json_body(response).await;
    assert_eq!(history.history.len(), 1);
    let entry = &history.history[0];
    assert_eq!(entry.query.as_deref(), Some("What is the tomato price in Hubli?"));
    assert_eq!(entry.response, answer.response);
    assert!(entry.image_url.is_none());
}

#[tokio::test]
#[traced_test]
async fn uploaded_photo_is_stored_and_diagnosed() {
    let h = harness();
    let response = h
        .router
        .clone()
        .oneshot(simple_request(
            Some(&h.token),
            &[Field::File("image", "leaf.png", "image/png", &[0x89, b'P', b'N', b'G'])],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let answer: SimpleResponse = json_body(response).await;
    assert!(answer.response.contains("Early blight"));

    let response = h
        .router
        .oneshot(
            Request::get("/api/chat-history")
                .header(header::AUTHORIZATION, format!("Bearer {}", h.token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let history: HistoryResponse = json_body(response).await;
    let entry = &history.history[0];
    assert!(entry.query.is_none());
    assert_eq!(entry.image_filename.as_deref(), Some("leaf.png"));
    let url = entry.image_url.as_deref().unwrap();
    let relative = url.split("/media/").nth(1).unwrap();
    assert!(relative.starts_with("artifacts/kisan-advisor/users/farmer-7/images/"));
    assert!(h.media_dir.path().join(relative).exists());
}

#[tokio::test]
async fn empty_upload_is_a_bad_request() {
    let h = harness();
    let response = h
        .router
        .oneshot(simple_request(
            Some(&h.token),
            &[Field::File("image", "leaf.jpg", "image/jpeg", &[])],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
#[traced_test]
async fn unanswered_photo_is_not_kept() {
    let engine = ScriptedEngine::offline_demo()
        .on(names::ORCHESTRATOR, |_| vec![InvocationResult::error("model unavailable")]);
    let h = harness_with(engine, |_| {});
    let response = h
        .router
        .oneshot(simple_request(
            Some(&h.token),
            &[Field::File("image", "leaf.png", "image/png", &[0x89, b'P', b'N', b'G'])],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(std::fs::read_dir(h.media_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
#[traced_test]
async fn slow_answers_hit_the_request_timeout() {
    let engine = ScriptedEngine::offline_demo().with_latency(names::ORCHESTRATOR, Duration::from_millis(1500));
    let h = harness_with(engine, |s| s.server.request_timeout_seconds = 1);
    let response = h
        .router
        .oneshot(simple_request(Some(&h.token), &[Field::Text("query", "tomato price")]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
}
