//! Shared-secret authentication for the admin API.
//!
//! Every `/api/*` route requires the singleton API key, either as
//! `Authorization: Bearer <key>` or — for curl-from-the-terminal
//! convenience — as an `?api_key=<key>` query parameter. `/health` and
//! static files stay open.

use std::sync::{Arc, RwLock};

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::{ApiError, Error};

/// The current API key, swap-able at runtime by the rotate endpoint.
pub type SharedKey = Arc<RwLock<String>>;

/// Axum middleware guarding admin routes.
pub async fn require_api_key(
    State(key): State<SharedKey>,
    req: Request,
    next: Next,
) -> Response {
    let expected = key.read().expect("api key lock").clone();

    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    let query_key = req.uri().query().and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("api_key="))
            .map(str::to_string)
    });

    let provided = bearer.or(query_key);
    match provided {
        Some(token) if token == expected => next.run(req).await,
        _ => ApiError(Error::Unauthorized).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, routing::get, Router};
    use tower::ServiceExt as _;

    fn app(key: &str) -> Router {
        let shared: SharedKey = Arc::new(RwLock::new(key.to_string()));
        Router::new()
            .route("/api/ping", get(|| async { "pong" }))
            .layer(axum::middleware::from_fn_with_state(
                Arc::clone(&shared),
                require_api_key,
            ))
    }

    async fn send(app: Router, uri: &str, auth: Option<&str>) -> StatusCode {
        let mut request = axum::http::Request::builder().uri(uri);
        if let Some(auth) = auth {
            request = request.header("authorization", auth);
        }
        let response = app
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn bearer_token_grants_access() {
        let status = send(app("sekret"), "/api/ping", Some("Bearer sekret")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn query_parameter_fallback_grants_access() {
        let status = send(app("sekret"), "/api/ping?api_key=sekret", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_or_wrong_key_is_unauthorized() {
        assert_eq!(
            send(app("sekret"), "/api/ping", None).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            send(app("sekret"), "/api/ping", Some("Bearer nope")).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            send(app("sekret"), "/api/ping?api_key=nope", None).await,
            StatusCode::UNAUTHORIZED
        );
    }
}
