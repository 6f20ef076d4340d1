//! `POST /v1/audio/speech`: audio bytes, or a chunked body when streaming.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tracing::{info, warn};

use super::{build_request, ApiError, AppState};
use crate::adapter::Fragment;
use crate::backends::http_worker::DEFAULT_AUDIO_CONTENT_TYPE;
use crate::model_spec::{Endpoint, ModelKind};
use crate::orchestrator::RunResult;
use crate::stream::{DeltaData, StreamEvent};

pub async fn create_speech(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    let request = build_request(&state, &headers, payload, ModelKind::Tts, &[Endpoint::AudioSpeech])?;
    info!(model_id = %request.model, request_id = %request.request_id, stream = request.stream, "Speech request");

    match state.orchestrator.run(request).await? {
        RunResult::Response(response) => {
            let audio = response.audio.ok_or_else(|| ApiError {
                status: StatusCode::BAD_GATEWAY,
                code: "generation_error",
                message: format!("model {} produced no audio", response.model),
                retry_after: None,
            })?;
            Ok(([(header::CONTENT_TYPE, audio.content_type)], audio.data).into_response())
        }
        RunResult::Events(events) => {
            // The first error aborts the body; the client sees a truncated transfer.
            let body = events.filter_map(|event| async move {
                match event {
                    StreamEvent::Delta(DeltaData {
                        delta: Fragment::Binary { data },
                        ..
                    }) => Some(Ok::<Bytes, std::io::Error>(data)),
                    StreamEvent::Error(e) => {
                        warn!("Speech stream failed: {}", e.error.message);
                        Some(Err(std::io::Error::new(std::io::ErrorKind::Other, e.error.message)))
                    }
                    _ => None,
                }
            });
            // No length is known, so the server frames this body as chunked.
            Ok(([(header::CONTENT_TYPE, DEFAULT_AUDIO_CONTENT_TYPE)], Body::from_stream(body)).into_response())
        }
    }
}
