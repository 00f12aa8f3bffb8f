//! Anthropic-protocol front-door endpoints.
//!
//! `/v1/messages` translates the request to the OpenAI schema, dispatches
//! to the matching backend, and translates the response back — buffered
//! for plain requests, through the [`crate::sse::StreamConverter`] state
//! machine for `stream: true`. Errors on these paths always use the
//! Anthropic error envelope.

use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde_json::{json, Value};

use crate::{
    error::{AnthropicError, Error},
    proxy::{backend_base_url, backend_tag, resolve_running_backend},
    reqlog::RequestLogEntry,
    sse::{SseLineBuffer, StreamConverter},
    translate::{anthropic_to_openai_request, estimate_input_tokens, openai_to_anthropic_response},
};

use super::FrontState;

/// `POST /v1/messages/count_tokens` — the fixed chars/4 estimate.
pub async fn count_tokens(Json(body): Json<Value>) -> impl IntoResponse {
    Json(json!({ "input_tokens": estimate_input_tokens(&body) }))
}

/// `POST /v1/messages`.
pub async fn messages(
    State(state): State<Arc<FrontState>>,
    Json(body): Json<Value>,
) -> Result<Response, AnthropicError> {
    let model = body["model"]
        .as_str()
        .ok_or_else(|| Error::Validation("`model` field is required".into()))?
        .to_string();
    let entry = RequestLogEntry::new(&model, "/v1/messages", "POST").with_prompt(&body);
    let t0 = Instant::now();

    let openai_request = anthropic_to_openai_request(&body)?;

    let backend = match resolve_running_backend(&state.store, &model) {
        Ok(backend) => backend,
        Err(e) => {
            state.log.record(
                entry
                    .with_duration(t0.elapsed().as_millis() as u64)
                    .failed(e.status_code().as_u16(), &e.to_string()),
            );
            return Err(e.into());
        }
    };

    let url = format!("{}/v1/chat/completions", backend_base_url(&backend));
    let entry = entry.with_backend(&backend_tag(&backend));

    if body["stream"].as_bool().unwrap_or(false) {
        return stream_messages(state, entry, t0, &url, openai_request, &model, &body).await;
    }

    match state.proxy.post_json(&url, &openai_request).await {
        Ok((status, response)) if status.is_success() => {
            state.log.record(
                entry
                    .with_duration(t0.elapsed().as_millis() as u64)
                    .succeeded(200),
            );
            Ok(Json(openai_to_anthropic_response(&response, &model)).into_response())
        }
        Ok((status, response)) => {
            let e = Error::Upstream(format!("backend returned HTTP {status}: {response}"));
            state.log.record(
                entry
                    .with_duration(t0.elapsed().as_millis() as u64)
                    .failed(e.status_code().as_u16(), &e.to_string()),
            );
            Err(e.into())
        }
        Err(e) => {
            state.log.record(
                entry
                    .with_duration(t0.elapsed().as_millis() as u64)
                    .failed(e.status_code().as_u16(), &e.to_string()),
            );
            Err(e.into())
        }
    }
}

async fn stream_messages(
    state: Arc<FrontState>,
    entry: RequestLogEntry,
    t0: Instant,
    url: &str,
    mut openai_request: Value,
    model: &str,
    original: &Value,
) -> Result<Response, AnthropicError> {
    openai_request["stream"] = json!(true);

    let upstream = match state.proxy.post_stream(url, &openai_request).await {
        Ok(r) => r,
        Err(e) => {
            state.log.record(
                entry
                    .with_duration(t0.elapsed().as_millis() as u64)
                    .failed(e.status_code().as_u16(), &e.to_string()),
            );
            return Err(e.into());
        }
    };
    state.log.record(
        entry
            .with_duration(t0.elapsed().as_millis() as u64)
            .succeeded(200),
    );

    let converter = StreamConverter::new(model, estimate_input_tokens(original));
    let body = Body::from_stream(convert_stream(upstream, converter));

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|e| Error::Internal(e.into()))?)
}

struct ConvertState {
    upstream: reqwest::Response,
    buffer: SseLineBuffer,
    converter: StreamConverter,
    done: bool,
}

/// Drive the upstream byte stream through the SSE converter. A chunk that
/// fails to parse is logged and skipped; the stream continues. When the
/// upstream ends (cleanly or not) the converter's closing sequence is
/// flushed.
fn convert_stream(
    upstream: reqwest::Response,
    converter: StreamConverter,
) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> {
    let state = ConvertState {
        upstream,
        buffer: SseLineBuffer::new(),
        converter,
        done: false,
    };

    futures_util::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        loop {
            match st.upstream.chunk().await {
                Ok(Some(bytes)) => {
                    let mut out = String::new();
                    for payload in st.buffer.push(&bytes) {
                        if payload == "[DONE]" {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&payload) {
                            Ok(chunk) => {
                                for event in st.converter.process(&chunk) {
                                    out.push_str(&event.to_wire());
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "skipping malformed upstream chunk");
                            }
                        }
                    }
                    if out.is_empty() {
                        continue;
                    }
                    return Some((Ok(Bytes::from(out)), st));
                }
                Ok(None) => {
                    st.done = true;
                    let mut out = String::new();
                    for event in st.converter.finish() {
                        out.push_str(&event.to_wire());
                    }
                    if out.is_empty() {
                        return None;
                    }
                    return Some((Ok(Bytes::from(out)), st));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "upstream stream error; closing message");
                    st.done = true;
                    let mut out = String::new();
                    for event in st.converter.finish() {
                        out.push_str(&event.to_wire());
                    }
                    return Some((Ok(Bytes::from(out)), st));
                }
            }
        }
    })
}
