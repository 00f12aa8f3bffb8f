//! Bundled web UI serving.
//!
//! Non-`/api` paths fall through to the static bundle under `web/dist`,
//! with a path-traversal guard and SPA fallback: unknown extensionless
//! paths get `index.html` so client-side routing works after a reload.

use std::path::{Component, Path, PathBuf};

use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
};

#[derive(Clone)]
pub struct StaticDir(pub std::sync::Arc<PathBuf>);

/// Fallback handler for every non-API route.
pub async fn serve(State(StaticDir(root)): State<StaticDir>, uri: Uri) -> Response {
    let requested = uri.path().trim_start_matches('/');

    let Some(relative) = sanitize_path(requested) else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };

    let mut target = if relative.as_os_str().is_empty() {
        root.join("index.html")
    } else {
        root.join(&relative)
    };

    if !target.is_file() {
        // SPA fallback: routes like /servers/qwen reload into the app
        // shell; real missing assets (anything with an extension) 404.
        if relative.extension().is_some() {
            return (StatusCode::NOT_FOUND, "not found").into_response();
        }
        target = root.join("index.html");
    }

    match tokio::fs::read(&target).await {
        Ok(contents) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type(&target))],
            contents,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

/// Reject any path that could escape the web root.
fn sanitize_path(requested: &str) -> Option<PathBuf> {
    let path = Path::new(requested);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            // ParentDir, RootDir, Prefix: all escape attempts.
            _ => return None,
        }
    }
    Some(clean)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        Some("map") => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_components_are_rejected() {
        assert!(sanitize_path("../etc/passwd").is_none());
        assert!(sanitize_path("a/../../b").is_none());
        assert!(sanitize_path("/etc/passwd").is_none(), "rooted paths escape");
        assert!(sanitize_path("assets/app.js").is_some());
        assert_eq!(sanitize_path("./a/b").unwrap(), Path::new("a/b"));
    }

    #[tokio::test]
    async fn serves_files_and_falls_back_to_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>app</html>").unwrap();
        std::fs::write(dir.path().join("app.js"), "console.log(1)").unwrap();
        let state = StaticDir(std::sync::Arc::new(dir.path().to_path_buf()));

        // Real asset.
        let response = serve(State(state.clone()), "/app.js".parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);

        // SPA route reload.
        let response = serve(State(state.clone()), "/servers/qwen".parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);

        // Missing asset with extension.
        let response = serve(State(state), "/missing.css".parse().unwrap()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
