//! OpenAI-protocol front-door endpoints.
//!
//! Thin handlers: resolve the backend from the request's `model` field,
//! forward the body, hand the response back verbatim. Streaming responses
//! are piped chunk-by-chunk with no buffering beyond the transport's own.

use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::TryStreamExt as _;
use serde_json::{json, Value};

use crate::{
    config::ServiceStatus,
    error::{ApiError, Error},
    proxy::{backend_base_url, backend_tag, resolve_running_backend},
    reqlog::RequestLogEntry,
};

use super::FrontState;

/// `GET /v1/models` — every running backend as a model object.
pub async fn list_models(State(state): State<Arc<FrontState>>) -> impl IntoResponse {
    let data: Vec<Value> = state
        .store
        .list_backends()
        .into_iter()
        .filter(|b| b.status == ServiceStatus::Running)
        .map(|b| {
            json!({
                "id": b.model_name,
                "object": "model",
                "created": b.created_at.timestamp(),
                "owned_by": "local",
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

/// `GET /v1/models/{id}` — single descriptor. Unknown ids still get a
/// plausible record: clients probing cloud model names expect a 200 here.
pub async fn get_model(
    State(state): State<Arc<FrontState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let known = crate::proxy::match_backend(&state.store.list_backends(), &id);
    let descriptor = match known {
        Some(backend) => json!({
            "id": backend.model_name,
            "object": "model",
            "created": backend.created_at.timestamp(),
            "owned_by": "local",
        }),
        None => json!({
            "id": id,
            "object": "model",
            "created": chrono::Utc::now().timestamp(),
            "owned_by": "local",
        }),
    };
    Json(descriptor)
}

/// `POST /v1/chat/completions` — proxy to the matching backend.
pub async fn chat_completions(
    State(state): State<Arc<FrontState>>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    proxy_openai(state, body, "/v1/chat/completions", false).await
}

/// `POST /v1/embeddings` — proxy, requiring an embeddings-enabled backend.
pub async fn embeddings(
    State(state): State<Arc<FrontState>>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    proxy_openai(state, body, "/v1/embeddings", true).await
}

async fn proxy_openai(
    state: Arc<FrontState>,
    body: Value,
    endpoint: &str,
    require_embeddings: bool,
) -> Result<Response, ApiError> {
    let model = body["model"]
        .as_str()
        .ok_or_else(|| Error::Validation("`model` field is required".into()))?
        .to_string();
    let entry = RequestLogEntry::new(&model, endpoint, "POST").with_prompt(&body);
    let t0 = Instant::now();

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

    if require_embeddings && !backend.embeddings {
        let e = Error::Validation(format!(
            "server {} does not have embeddings enabled",
            backend.id
        ));
        state.log.record(
            entry
                .with_backend(&backend_tag(&backend))
                .with_duration(t0.elapsed().as_millis() as u64)
                .failed(400, &e.to_string()),
        );
        return Err(e.into());
    }

    let url = format!("{}{}", backend_base_url(&backend), endpoint);
    let entry = entry.with_backend(&backend_tag(&backend));

    if body["stream"].as_bool().unwrap_or(false) {
        // Streaming pass-through: upstream bytes forwarded untouched.
        // Latency recorded is time-to-first-byte.
        let upstream = match state.proxy.post_stream(&url, &body).await {
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

        let stream = upstream.bytes_stream().map_err(std::io::Error::other);
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(stream))
            .map_err(|e| Error::Internal(e.into()))?);
    }

    match state.proxy.post_json(&url, &body).await {
        Ok((status, response)) => {
            state.log.record(
                entry
                    .with_duration(t0.elapsed().as_millis() as u64)
                    .succeeded(status.as_u16()),
            );
            Ok((status, Json(response)).into_response())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, BackendPaths, TuningDefaults};
    use crate::proxy::ProxyClient;
    use crate::reqlog::RequestLog;
    use crate::store::StateStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt as _;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<StateStore>,
        app: axum::Router,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().to_path_buf()).unwrap());
        let state = Arc::new(crate::api::FrontState {
            store: Arc::clone(&store),
            proxy: ProxyClient::new(Duration::from_secs(5)),
            log: RequestLog::new(store.router_log_path(), false),
            started_at: Instant::now(),
        });
        let app = crate::api::front(state);
        Fixture { _dir: dir, store, app }
    }

    fn add_running_backend(store: &StateStore, model_name: &str, port: u16, embeddings: bool) {
        let mut backend = BackendConfig::new(
            model_name,
            std::path::Path::new(&format!("/models/{model_name}")),
            port,
            BackendPaths {
                plist: "/tmp/p".into(),
                stdout: "/tmp/o".into(),
                stderr: "/tmp/e".into(),
                http_log: "/tmp/h".into(),
            },
            &TuningDefaults::default(),
        );
        backend.status = ServiceStatus::Running;
        backend.embeddings = embeddings;
        store.save_backend(&backend).unwrap();
    }

    async fn post_json(app: &axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn get(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    // -----------------------------------------------------------------------
    // Model listing
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn models_lists_only_running_backends() {
        let f = fixture();
        add_running_backend(&f.store, "up.gguf", 9000, false);
        let mut stopped = f.store.load_backend("up").unwrap().unwrap();
        stopped.id = "down".into();
        stopped.model_name = "down.gguf".into();
        stopped.port = 9001;
        stopped.status = ServiceStatus::Stopped;
        f.store.save_backend(&stopped).unwrap();

        let (status, body) = get(&f.app, "/v1/models").await;
        assert_eq!(status, StatusCode::OK);
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["id"], "up.gguf");
        assert_eq!(data[0]["owned_by"], "local");
    }

    #[tokio::test]
    async fn unknown_model_id_still_gets_a_descriptor() {
        let f = fixture();
        let (status, body) = get(&f.app, "/v1/models/gpt-4o").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "gpt-4o");
        assert_eq!(body["object"], "model");
    }

    // -----------------------------------------------------------------------
    // Chat completions proxying (start → route of the e2e flow)
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn chat_completion_is_forwarded_verbatim_from_the_backend() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cmpl-1",
                "choices": [{ "message": { "role": "assistant", "content": "hello from backend" } }],
            })))
            .mount(&backend)
            .await;
        let port = backend.address().port();

        let f = fixture();
        add_running_backend(&f.store, "m.gguf", port, false);

        let (status, body) = post_json(
            &f.app,
            "/v1/chat/completions",
            json!({ "model": "m.gguf", "messages": [{ "role": "user", "content": "hi" }] }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "cmpl-1");
        assert_eq!(
            body["choices"][0]["message"]["content"],
            "hello from backend"
        );
    }

    #[tokio::test]
    async fn stopped_backend_yields_503() {
        let f = fixture();
        add_running_backend(&f.store, "m.gguf", 9000, false);
        let mut backend = f.store.load_backend("m").unwrap().unwrap();
        backend.status = ServiceStatus::Stopped;
        f.store.save_backend(&backend).unwrap();

        let (status, body) = post_json(
            &f.app,
            "/v1/chat/completions",
            json!({ "model": "m.gguf", "messages": [] }),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "BACKEND_DOWN");
    }

    #[tokio::test]
    async fn unknown_model_yields_404_and_unreachable_backend_502() {
        let f = fixture();
        let (status, _) = post_json(
            &f.app,
            "/v1/chat/completions",
            json!({ "model": "ghost", "messages": [] }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Running per the store, but nothing is listening on the port.
        add_running_backend(&f.store, "m.gguf", 1, false);
        let (status, body) = post_json(
            &f.app,
            "/v1/chat/completions",
            json!({ "model": "m.gguf", "messages": [] }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "UPSTREAM_ERROR");
    }

    // -----------------------------------------------------------------------
    // Embeddings gate
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn embeddings_require_an_embeddings_backend() {
        let f = fixture();
        add_running_backend(&f.store, "m.gguf", 9000, false);

        let (status, body) = post_json(
            &f.app,
            "/v1/embeddings",
            json!({ "model": "m.gguf", "input": "text" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["details"]
            .as_str()
            .unwrap()
            .contains("embeddings"));
    }

    #[tokio::test]
    async fn embeddings_proxy_through_when_enabled() {
        let backend = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [{ "embedding": [0.1, 0.2] }],
            })))
            .mount(&backend)
            .await;

        let f = fixture();
        add_running_backend(&f.store, "m.gguf", backend.address().port(), true);

        let (status, body) = post_json(
            &f.app,
            "/v1/embeddings",
            json!({ "model": "m.gguf", "input": "text" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"][0]["embedding"].is_array());
    }
}
