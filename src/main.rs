use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;

mod api;
mod catalog;
mod config;
mod downloads;
mod error;
mod hub;
mod lifecycle;
mod manage;
mod ports;
mod proxy;
mod reqlog;
mod sse;
mod store;
mod supervisor;
mod translate;
mod update;

use catalog::Catalog;
use downloads::DownloadManager;
use hub::HubClient;
use lifecycle::LifecycleEngine;
use manage::ModelManager;
use proxy::ProxyClient;
use reqlog::RequestLog;
use store::{ModelsDirProvider, StateStore};
use supervisor::Launchd;
use update::UpdateService;

/// Local control plane for a fleet of llama.cpp backends.
#[derive(Parser)]
#[command(name = "llama-fleet", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the front-door router (OpenAI + Anthropic protocols).
    Router,
    /// Run the admin control plane (REST API + web UI).
    Admin,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llama_fleet=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let store = Arc::new(
        StateStore::open(StateStore::default_root()).context("opening the state directory")?,
    );

    match cli.command {
        Command::Router => run_router(store).await,
        Command::Admin => run_admin(store).await,
    }
}

async fn run_router(store: Arc<StateStore>) -> anyhow::Result<()> {
    let router_config = store.router_config().context("loading router config")?;

    let state = Arc::new(api::FrontState {
        proxy: ProxyClient::new(std::time::Duration::from_secs(router_config.request_timeout)),
        log: RequestLog::new(store.router_log_path(), router_config.verbose),
        store,
        started_at: Instant::now(),
    });

    let addr: SocketAddr = format!("{}:{}", router_config.host, router_config.port)
        .parse()
        .context("router bind address")?;
    info!(%addr, "router listening");

    let app = api::front(state).layer(trace_layer());
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("router server error")?;
    info!("router drained; exiting");
    Ok(())
}

async fn run_admin(store: Arc<StateStore>) -> anyhow::Result<()> {
    let admin_config = store.admin_config().context("loading admin config")?;

    let supervisor = Arc::new(Launchd);
    let catalog = Arc::new(Catalog::new(
        Arc::clone(&store) as Arc<dyn ModelsDirProvider>
    ));
    let lifecycle = Arc::new(LifecycleEngine::new(
        Arc::clone(&store),
        supervisor,
        inference_binary(),
    ));
    let hub = Arc::new(HubClient::new(hub_base_url()));
    let downloads = Arc::new(DownloadManager::new(
        Arc::clone(&hub),
        Arc::clone(&store) as Arc<dyn ModelsDirProvider>,
    ));
    downloads.spawn_cleanup_task();

    let state = Arc::new(api::admin::AdminState {
        updates: UpdateService::new(
            Arc::clone(&store),
            Arc::clone(&catalog),
            Arc::clone(&lifecycle),
        ),
        models: ModelManager::new(
            Arc::clone(&store),
            Arc::clone(&catalog),
            Arc::clone(&lifecycle),
        ),
        catalog,
        lifecycle,
        downloads,
        hub,
        api_key: Arc::new(std::sync::RwLock::new(admin_config.api_key.clone())),
        store,
        started_at: Instant::now(),
    });

    let addr: SocketAddr = format!("{}:{}", admin_config.host, admin_config.port)
        .parse()
        .context("admin bind address")?;
    info!(%addr, "admin API listening");

    let app = api::admin::admin(state, web_dist_dir()).layer(trace_layer());
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("admin server error")?;
    info!("admin drained; exiting");
    Ok(())
}

fn trace_layer() -> tower_http::trace::TraceLayer<
    tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>,
> {
    tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO))
}

/// The llama-server binary placed in generated units.
fn inference_binary() -> PathBuf {
    std::env::var("LLF_INFERENCE_BINARY")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/opt/homebrew/bin/llama-server"))
}

fn hub_base_url() -> String {
    std::env::var("LLF_HUB_URL").unwrap_or_else(|_| hub::DEFAULT_HUB_URL.to_string())
}

/// The bundled web UI, next to the installed binary by default.
fn web_dist_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LLF_WEB_DIST") {
        return PathBuf::from(dir);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("web/dist")))
        .unwrap_or_else(|| PathBuf::from("web/dist"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("interrupt received; shutting down"),
        _ = terminate => info!("terminate received; shutting down"),
    }
}
