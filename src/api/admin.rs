//! Admin API — operator-facing control plane.
//!
//! Authenticated CRUD over backends, models, download jobs, and the router
//! singleton, plus aggregate status and the bundled web UI. Every `/api/*`
//! route requires the shared API key (see [`super::admin_auth`]); `/health`
//! and static files are open. CORS is wide open — the UI may be served
//! from a file:// origin or a dev server.

use std::{path::PathBuf, sync::Arc, time::Instant};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{any, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::{
    catalog::Catalog,
    config::{
        generate_api_key, sanitize_model_name, validate_alias, validate_port, BackendConfig,
        ServiceStatus,
    },
    downloads::DownloadManager,
    error::{ApiError, Error},
    hub::HubClient,
    lifecycle::LifecycleEngine,
    manage::ModelManager,
    ports,
    store::StateStore,
    supervisor::remove_unit,
    update::{BackendPatch, UpdateService},
};

use super::{
    admin_auth::{require_api_key, SharedKey},
    static_files::{self, StaticDir},
};

pub struct AdminState {
    pub store: Arc<StateStore>,
    pub catalog: Arc<Catalog>,
    pub lifecycle: Arc<LifecycleEngine>,
    pub updates: UpdateService,
    pub models: ModelManager,
    pub downloads: Arc<DownloadManager>,
    pub hub: Arc<HubClient>,
    pub api_key: SharedKey,
    pub started_at: Instant,
}

/// Build the admin router, serving the static UI from `web_root`.
pub fn admin(state: Arc<AdminState>, web_root: PathBuf) -> Router {
    let api = Router::new()
        .route("/servers", get(list_servers).post(create_server))
        .route(
            "/servers/{id}",
            get(get_server).patch(patch_server).delete(delete_server),
        )
        .route("/servers/{id}/start", post(start_server))
        .route("/servers/{id}/stop", post(stop_server))
        .route("/servers/{id}/restart", post(restart_server))
        .route("/servers/{id}/logs", get(server_logs))
        .route("/servers/{id}/history", get(server_history))
        .route("/models", get(list_models))
        .route("/models/search", get(search_models))
        .route("/models/download", post(download_model))
        .route("/models/{name}", get(get_model).delete(delete_model))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/router", get(get_router).patch(patch_router))
        .route("/router/start", post(start_router))
        .route("/router/stop", post(stop_router))
        .route("/router/restart", post(restart_router))
        .route("/router/logs", get(router_logs))
        .route("/status", get(status))
        .route("/config", get(get_config).patch(patch_config))
        .route("/admin/rotate-key", post(rotate_key))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.api_key),
            require_api_key,
        ));

    Router::new()
        .nest("/api", api)
        .route("/health", get(admin_health))
        .fallback_service(
            any(static_files::serve).with_state(StaticDir(Arc::new(web_root))),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn admin_health(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "admin",
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

// ---------------------------------------------------------------------------
// Servers
// ---------------------------------------------------------------------------

async fn list_servers(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(json!({ "servers": state.store.list_backends() }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CreateServerRequest {
    model: String,
    alias: Option<String>,
    port: Option<u16>,
    host: Option<String>,
    threads: Option<u32>,
    ctx_size: Option<u32>,
    gpu_layers: Option<u32>,
    verbose: Option<bool>,
    embeddings: Option<bool>,
    jinja: Option<bool>,
    custom_flags: Option<Vec<String>>,
}

async fn create_server(
    State(state): State<Arc<AdminState>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let request: CreateServerRequest = serde_json::from_value(body)
        .map_err(|e| Error::Validation(format!("invalid request body: {e}")))?;

    let model_path = state.catalog.resolve(&request.model).ok_or_else(|| {
        Error::NotFound(format!(
            "model `{}` not found in the models directory",
            request.model
        ))
    })?;
    let model_name = model_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| request.model.clone());

    let id = sanitize_model_name(&model_name);
    if state.store.backend_exists(&id) {
        return Err(Error::Conflict(format!("a server with id `{id}` already exists")).into());
    }
    if state.store.server_exists_for_model(&model_path) {
        return Err(Error::Conflict(format!(
            "model {} is already served",
            model_path.display()
        ))
        .into());
    }

    if let Some(alias) = request.alias.as_deref() {
        validate_alias(alias)?;
        let taken = state.store.list_backends().iter().any(|b| {
            b.alias
                .as_deref()
                .is_some_and(|existing| existing.eq_ignore_ascii_case(alias))
        });
        if taken {
            return Err(Error::Conflict(format!("alias `{alias}` is already in use")).into());
        }
    }

    let global = state.store.global()?;
    let used = state.store.used_ports();
    let port = match request.port {
        Some(port) => {
            ports::check_requested(port, &used, None)?;
            port
        }
        None => ports::find_available_from(global.port_base, &used)?,
    };
    let mut backend = BackendConfig::new(
        &model_name,
        &model_path,
        port,
        state.store.backend_paths(&id),
        &global.defaults,
    );
    backend.alias = request.alias;
    if let Some(host) = request.host {
        backend.host = host;
    }
    if let Some(threads) = request.threads {
        backend.threads = Some(threads);
    }
    if let Some(ctx) = request.ctx_size {
        backend.ctx_size = Some(ctx);
    }
    if let Some(layers) = request.gpu_layers {
        backend.gpu_layers = Some(layers);
    }
    backend.verbose = request.verbose.unwrap_or(false);
    backend.embeddings = request.embeddings.unwrap_or(false);
    backend.jinja = request.jinja.unwrap_or(false);
    backend.custom_flags = request.custom_flags.unwrap_or_default();

    state.store.save_backend(&backend)?;
    state.lifecycle.unit_spec(&backend).write()?;

    Ok((StatusCode::CREATED, Json(json!({ "server": backend }))))
}

async fn get_server(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let backend = state
        .store
        .find_by_identifier(&id)
        .ok_or_else(|| Error::NotFound(format!("no server matches `{id}`")))?;
    Ok(Json(json!({ "server": backend })))
}

async fn patch_server(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let patch: BackendPatch = serde_json::from_value(body)
        .map_err(|e| Error::Validation(format!("invalid request body: {e}")))?;
    let outcome = state.updates.apply(&id, patch).await?;
    Ok(Json(json!({
        "server": outcome.backend,
        "migrated": outcome.migrated,
        "oldId": outcome.old_id,
    })))
}

async fn delete_server(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let backend = state
        .store
        .find_by_identifier(&id)
        .ok_or_else(|| Error::NotFound(format!("no server matches `{id}`")))?;

    if backend.status == ServiceStatus::Running {
        if let Err(e) = state.lifecycle.stop(&backend.id).await {
            warn!(id = %backend.id, error = %e, "stop during delete failed");
        }
    }
    remove_unit(&backend.plist_path)?;
    state.store.delete_backend(&backend.id)?;
    state.store.delete_history(&backend.id);

    Ok(Json(json!({ "deleted": true, "id": backend.id })))
}

async fn start_server(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let backend = state.lifecycle.start(&id).await?;
    Ok(Json(json!({ "server": backend })))
}

async fn stop_server(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let backend = state.lifecycle.stop(&id).await?;
    Ok(Json(json!({ "server": backend })))
}

async fn restart_server(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let backend = state.lifecycle.restart(&id).await?;
    Ok(Json(json!({ "server": backend })))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    #[serde(rename = "type", default = "default_log_type")]
    kind: String,
    #[serde(default = "default_log_lines")]
    lines: usize,
}

fn default_log_type() -> String {
    "stdout".into()
}
fn default_log_lines() -> usize {
    100
}

async fn server_logs(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let backend = state
        .store
        .find_by_identifier(&id)
        .ok_or_else(|| Error::NotFound(format!("no server matches `{id}`")))?;

    let path = match query.kind.as_str() {
        "stdout" => &backend.stdout_path,
        "stderr" => &backend.stderr_path,
        "http" => &backend.http_log_path,
        other => {
            return Err(Error::Validation(format!(
                "unknown log type `{other}`; expected stdout, stderr or http"
            ))
            .into())
        }
    };
    let lines = state.store.read_log_tail(path, query.lines).await?;
    Ok(Json(json!({ "id": backend.id, "type": query.kind, "lines": lines })))
}

async fn server_history(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let backend = state
        .store
        .find_by_identifier(&id)
        .ok_or_else(|| Error::NotFound(format!("no server matches `{id}`")))?;
    let events = state.store.read_history(&backend.id).await?;
    Ok(Json(json!({ "id": backend.id, "history": events })))
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

async fn list_models(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let models: Vec<Value> = state
        .catalog
        .scan()
        .into_iter()
        .map(|entry| {
            let dependents = state.models.dependents_for(&entry);
            let mut value = serde_json::to_value(&entry).unwrap_or_default();
            value["dependents"] = json!(dependents);
            value
        })
        .collect();
    Json(json!({ "models": models }))
}

async fn get_model(
    State(state): State<Arc<AdminState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let entry = state
        .catalog
        .resolve_entry(&name)
        .ok_or_else(|| Error::NotFound(format!("model `{name}` not found")))?;
    let dependents = state.models.dependents_for(&entry);
    let mut value = serde_json::to_value(&entry).unwrap_or_default();
    value["dependents"] = json!(dependents);
    Ok(Json(value))
}

#[derive(Debug, Deserialize)]
struct CascadeQuery {
    #[serde(default)]
    cascade: bool,
}

async fn delete_model(
    State(state): State<Arc<AdminState>>,
    Path(name): Path<String>,
    Query(query): Query<CascadeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.models.delete(&name, query.cascade).await?;
    Ok(Json(json!(report)))
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

fn default_search_limit() -> usize {
    20
}

async fn search_models(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let results = state.hub.search(&query.q, query.limit).await?;
    Ok(Json(json!({ "results": results })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct DownloadRequest {
    repo: String,
    filename: String,
}

async fn download_model(
    State(state): State<Arc<AdminState>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let request: DownloadRequest = serde_json::from_value(body)
        .map_err(|e| Error::Validation(format!("invalid request body: {e}")))?;
    let job = state.downloads.create(&request.repo, &request.filename);
    Ok((StatusCode::ACCEPTED, Json(json!({ "jobId": job.id }))))
}

// ---------------------------------------------------------------------------
// Download jobs
// ---------------------------------------------------------------------------

async fn list_jobs(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(json!({ "jobs": state.downloads.list() }))
}

async fn get_job(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .downloads
        .get(&id)
        .ok_or_else(|| Error::NotFound(format!("download job {id} not found")))?;
    Ok(Json(json!(job)))
}

async fn cancel_job(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.downloads.cancel(&id)?;
    Ok(Json(json!(job)))
}

// ---------------------------------------------------------------------------
// Router singleton
// ---------------------------------------------------------------------------

async fn get_router(
    State(state): State<Arc<AdminState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(json!({ "router": state.store.router_config()? })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RouterPatch {
    port: Option<u16>,
    host: Option<String>,
    request_timeout: Option<u64>,
    verbose: Option<bool>,
}

async fn patch_router(
    State(state): State<Arc<AdminState>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let patch: RouterPatch = serde_json::from_value(body)
        .map_err(|e| Error::Validation(format!("invalid request body: {e}")))?;

    let mut router = state.store.router_config()?;
    if let Some(port) = patch.port {
        validate_port(port)?;
        router.port = port;
    }
    if let Some(host) = patch.host {
        if host.trim().is_empty() {
            return Err(Error::Validation("host must not be empty".into()).into());
        }
        router.host = host;
    }
    if let Some(timeout) = patch.request_timeout {
        router.request_timeout = timeout;
    }
    if let Some(verbose) = patch.verbose {
        router.verbose = verbose;
    }
    state.store.save_router_config(&router)?;
    // Updates persist now and take effect on next start.
    Ok(Json(json!({ "router": router })))
}

async fn start_router(
    State(state): State<Arc<AdminState>>,
) -> Result<impl IntoResponse, ApiError> {
    state.lifecycle.start_router().await?;
    Ok(Json(json!({ "router": state.store.router_config()? })))
}

async fn stop_router(
    State(state): State<Arc<AdminState>>,
) -> Result<impl IntoResponse, ApiError> {
    state.lifecycle.stop_router().await?;
    Ok(Json(json!({ "router": state.store.router_config()? })))
}

async fn restart_router(
    State(state): State<Arc<AdminState>>,
) -> Result<impl IntoResponse, ApiError> {
    state.lifecycle.restart_router().await?;
    Ok(Json(json!({ "router": state.store.router_config()? })))
}

async fn router_logs(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<LogQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let router = state.store.router_config()?;
    let path = match query.kind.as_str() {
        "stdout" => router.stdout_path.clone(),
        "stderr" => router.stderr_path.clone(),
        "requests" => state.store.router_log_path(),
        other => {
            return Err(Error::Validation(format!(
                "unknown log type `{other}`; expected stdout, stderr or requests"
            ))
            .into())
        }
    };
    let lines = state.store.read_log_tail(&path, query.lines).await?;
    Ok(Json(json!({ "type": query.kind, "lines": lines })))
}

// ---------------------------------------------------------------------------
// Status, config, key rotation
// ---------------------------------------------------------------------------

async fn status(State(state): State<Arc<AdminState>>) -> Result<impl IntoResponse, ApiError> {
    let backends = state.store.list_backends();
    let running = backends
        .iter()
        .filter(|b| b.status == ServiceStatus::Running)
        .count();
    let jobs = state.downloads.list();
    let active_jobs = jobs.iter().filter(|j| !j.status.is_finished()).count();
    let router = state.store.router_config()?;

    Ok(Json(json!({
        "servers": { "total": backends.len(), "running": running },
        "models": state.catalog.scan().len(),
        "jobs": { "total": jobs.len(), "active": active_jobs },
        "router": { "status": router.status, "port": router.port },
        "uptime": state.started_at.elapsed().as_secs(),
    })))
}

async fn get_config(
    State(state): State<Arc<AdminState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(json!({ "config": state.store.global()? })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GlobalPatch {
    models_directory: Option<PathBuf>,
    port_base: Option<u16>,
    defaults: Option<crate::config::TuningDefaults>,
}

async fn patch_config(
    State(state): State<Arc<AdminState>>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let patch: GlobalPatch = serde_json::from_value(body)
        .map_err(|e| Error::Validation(format!("invalid request body: {e}")))?;

    let mut global = state.store.global()?;
    if let Some(dir) = patch.models_directory {
        global.models_directory = dir;
    }
    if let Some(base) = patch.port_base {
        validate_port(base)?;
        global.port_base = base;
    }
    if let Some(defaults) = patch.defaults {
        global.defaults = defaults;
    }
    state.store.save_global(&global)?;
    Ok(Json(json!({ "config": global })))
}

async fn rotate_key(
    State(state): State<Arc<AdminState>>,
) -> Result<impl IntoResponse, ApiError> {
    let mut admin = state.store.admin_config()?;
    admin.api_key = generate_api_key();
    state.store.save_admin_config(&admin)?;
    *state.api_key.write().expect("api key lock") = admin.api_key.clone();
    Ok(Json(json!({ "apiKey": admin.api_key })))
}
