//! API layer -- read-only run history for an external controller.

mod routes;
pub mod state;

use self::state::AppState;
use axum::Router;
use tower_http::trace::TraceLayer;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app() -> (Router, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("lisorch.db");
        let pool = crate::storage::open_pool(&db).unwrap();
        (router(AppState { pool }), dir)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _dir) = app();
        let (status, body) = get(app, "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn test_runs_empty_and_unknown_id() {
        let (app, _dir) = app();
        let (status, body) = get(app.clone(), "/api/v1/runs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["total"], 0);

        let (status, _) = get(app, "/api/v1/runs/does-not-exist").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (app, _dir) = app();
        let (status, _) = get(app, "/api/v2/anything").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
