//! Backend selection and upstream dispatch.
//!
//! The router resolves the request's `model` field to one backend via a
//! tolerant matching chain, then opens an outbound HTTP connection to the
//! backend's loopback port. Non-streaming bodies are buffered and
//! forwarded verbatim; streaming responses hand back the reqwest response
//! for chunk-by-chunk forwarding.

use std::{sync::Arc, time::Duration};

use reqwest::StatusCode;
use serde_json::Value;

use crate::{
    config::{BackendConfig, ServiceStatus},
    error::Error,
    lifecycle::connect_host,
    store::StateStore,
};

/// Normalize a model name for the last stage of matching: lowercase,
/// strip `.gguf`, and unify `_`/`-` to `-`.
pub fn normalize_model_name(name: &str) -> String {
    let lower = name.to_lowercase();
    let stem = lower.strip_suffix(".gguf").unwrap_or(&lower);
    stem.replace('_', "-")
}

/// Match a requested model name against the backend set. Tries, in order:
/// exact model name; case-insensitive model name; case-insensitive with a
/// `.gguf` suffix appended to the request; normalized equality.
pub fn match_backend(backends: &[BackendConfig], requested: &str) -> Option<BackendConfig> {
    if let Some(hit) = backends.iter().find(|b| b.model_name == requested) {
        return Some(hit.clone());
    }
    if let Some(hit) = backends
        .iter()
        .find(|b| b.model_name.eq_ignore_ascii_case(requested))
    {
        return Some(hit.clone());
    }
    let with_ext = format!("{requested}.gguf");
    if let Some(hit) = backends
        .iter()
        .find(|b| b.model_name.eq_ignore_ascii_case(&with_ext))
    {
        return Some(hit.clone());
    }
    let normalized = normalize_model_name(requested);
    backends
        .iter()
        .find(|b| normalize_model_name(&b.model_name) == normalized)
        .cloned()
}

/// Resolve a request's model to a running backend. The store is re-read on
/// every call: the backend set can change while the router is live.
pub fn resolve_running_backend(
    store: &Arc<StateStore>,
    requested: &str,
) -> Result<BackendConfig, Error> {
    let backends = store.list_backends();
    let backend = match_backend(&backends, requested).ok_or_else(|| {
        Error::NotFound(format!("no server is configured for model `{requested}`"))
    })?;
    if backend.status != ServiceStatus::Running {
        return Err(Error::BackendDown(format!(
            "server {} for model `{requested}` is not running",
            backend.id
        )));
    }
    Ok(backend)
}

/// Outbound loopback base URL for a backend. A 0.0.0.0 bind address is a
/// listen-side wildcard and is rewritten for connecting.
pub fn backend_base_url(backend: &BackendConfig) -> String {
    format!("http://{}:{}", connect_host(&backend.host), backend.port)
}

/// Host:port tag used in request log entries.
pub fn backend_tag(backend: &BackendConfig) -> String {
    format!("{}:{}", connect_host(&backend.host), backend.port)
}

/// HTTP client pair for talking to backends.
pub struct ProxyClient {
    /// Buffered requests — carries the configured request timeout.
    client: reqwest::Client,
    /// Streaming requests — no overall timeout; the body arrives
    /// incrementally. The TCP connect timeout still applies.
    stream_client: reqwest::Client,
}

impl ProxyClient {
    pub fn new(request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build proxy client");
        let stream_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build streaming proxy client");
        Self { client, stream_client }
    }

    /// Forward a JSON body and buffer the upstream response verbatim.
    pub async fn post_json(
        &self,
        url: &str,
        body: &Value,
    ) -> Result<(StatusCode, Value), Error> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(classify_reqwest_error)?;
        let value = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        });
        Ok((status, value))
    }

    /// Forward a JSON body and return the live upstream response for
    /// streaming.
    pub async fn post_stream(
        &self,
        url: &str,
        body: &Value,
    ) -> Result<reqwest::Response, Error> {
        let response = self
            .stream_client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!(
                "backend returned HTTP {status}: {text}"
            )));
        }
        Ok(response)
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::UpstreamTimeout
    } else {
        Error::Upstream(e.to_string())
    }
}
