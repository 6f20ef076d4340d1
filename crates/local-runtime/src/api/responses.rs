//! `POST /v1/responses`: JSON response, or an SSE stream of envelope events.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::State,
    http::HeaderMap,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::StreamExt;
use serde_json::Value;
use tracing::{info, warn};

use super::{build_request, ApiError, AppState};
use crate::model_spec::{Endpoint, ModelKind};
use crate::orchestrator::RunResult;
use crate::stream::StreamEvent;

pub async fn create_response(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    let request = build_request(
        &state,
        &headers,
        payload,
        ModelKind::Llm,
        &[Endpoint::Responses, Endpoint::ChatCompletions],
    )?;
    info!(model_id = %request.model, request_id = %request.request_id, stream = request.stream, "Response request");

    match state.orchestrator.run(request).await? {
        RunResult::Response(response) => Ok(Json(response).into_response()),
        RunResult::Events(events) => {
            let stream = events.map(|event| Ok::<_, Infallible>(sse_event(&event)));
            Ok(Sse::new(stream)
                .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
                .into_response())
        }
    }
}

pub(crate) fn sse_event(event: &StreamEvent) -> Event {
    let sse = Event::default().event(event.sse_name());
    match sse.json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            warn!("Failed to encode stream event: {}", e);
            Event::default().event("response.error").data(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::echo_router;
    use crate::backends::ECHO_ID;
    use crate::model_spec::{ModelKind, ModelSpec};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn post(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/responses")
            .header("content-type", "application/json")
            .header("x-request-id", "req_fixed")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_json_response() {
        let (app, _) = echo_router(vec![]);
        let resp = app.oneshot(post(json!({"model": ECHO_ID, "input": "Hello"}))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = serde_json::from_slice(&to_bytes(resp.into_body(), usize::MAX).await.unwrap()).unwrap();
        assert_eq!(body["object"], "response");
        assert_eq!(body["status"], "completed");
        assert_eq!(body["output_text"], "Hello");
        assert_eq!(body["request_id"], "req_fixed");
        assert_eq!(body["output"][0]["content"][0]["text"], "Hello");
    }

    #[tokio::test]
    async fn test_default_model_by_kind() {
        let (app, _) = echo_router(vec![]);
        let resp = app.oneshot(post(json!({"input": "no model named"}))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_sse_event_order() {
        let (app, _) = echo_router(vec![]);
        let resp = app
            .oneshot(post(json!({"model": "echo", "input": "one two", "stream": true})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()["content-type"].to_str().unwrap().starts_with("text/event-stream"));

        let body = String::from_utf8(to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec()).unwrap();
        let names: Vec<&str> = body
            .lines()
            .filter_map(|l| l.strip_prefix("event: "))
            .collect();
        assert_eq!(
            names,
            vec![
                "response.created",
                "response.output_text.delta",
                "response.output_text.delta",
                "response.output_text.done",
                "response.completed",
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_model_is_404() {
        let (app, state) = echo_router(vec![]);
        let resp = app.oneshot(post(json!({"model": "local//llm/missing"}))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(!state.orchestrator.registry().is_tracked("local//llm/missing"));
    }

    #[tokio::test]
    async fn test_wrong_endpoint_is_400() {
        let tts = ModelSpec::new("local//tts/echo-voice", ModelKind::Tts).with_platforms(["linux-x64"]);
        let (app, _) = echo_router(vec![tts]);
        let resp = app.oneshot(post(json!({"model": "local//tts/echo-voice"}))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_incompatible_model_is_409() {
        let mac_only = ModelSpec::new("local//llm/mac", ModelKind::Llm).with_platforms(["darwin-arm64"]);
        let (app, _) = echo_router(vec![mac_only]);
        let resp = app.oneshot(post(json!({"model": "local//llm/mac"}))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
