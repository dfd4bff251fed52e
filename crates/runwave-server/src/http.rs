//! HTTP transport for code execution.
//!
//! ## Endpoints
//!
//! - `POST /execute` - Run code on a fresh sandbox pod
//! - `GET /health` - Pool occupancy
//! - `GET /` - Server info

use crate::server::RunwaveServer;
use crate::types::{ExecuteRequest, ExecuteResponse};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json},
    routing::{get, post},
    Router,
};
use runwave_core::HealthReport;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

/// Build the HTTP router.
///
/// The returned router can be served directly with axum or composed
/// into a larger application.
pub fn build_router(server: RunwaveServer) -> Router {
    tracing::debug!("Building HTTP router");

    let router = Router::new()
        .route("/execute", post(execute_handler))
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(server);

    tracing::debug!("HTTP router built with routes: /, /health, /execute");
    router
}

/// Run submitted code.
async fn execute_handler(
    State(server): State<RunwaveServer>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> (StatusCode, Json<ExecuteResponse>) {
    let request_id = uuid::Uuid::new_v4();

    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            tracing::debug!(%request_id, error = %rejection, "Rejected execute request");
            return (
                StatusCode::BAD_REQUEST,
                Json(ExecuteResponse::error(rejection.body_text())),
            );
        }
    };

    if request.code.len() > server.max_code_bytes() {
        tracing::debug!(
            %request_id,
            code_len = request.code.len(),
            limit = server.max_code_bytes(),
            "Code too large"
        );
        return (
            StatusCode::BAD_REQUEST,
            Json(ExecuteResponse::error(format!(
                "Code exceeds the maximum size of {} bytes",
                server.max_code_bytes()
            ))),
        );
    }

    let span = tracing::info_span!("execute", %request_id, language = %request.language);
    async move {
        tracing::info!(code_len = request.code.len(), "Execute request");
        tracing::trace!(code = %preview(&request.code), "Code preview");

        let result = server.execute(&request.code, &request.language).await;
        if let Err(e) = &result {
            tracing::debug!(error = %e, "Execute request failed");
        }

        let (status, body) = ExecuteResponse::from_result(result);
        tracing::info!(status = status.as_u16(), "Execute request complete");
        (status, Json(body))
    }
    .instrument(span)
    .await
}

/// Pool occupancy.
async fn health_handler(State(server): State<RunwaveServer>) -> Json<HealthReport> {
    tracing::trace!("Health check request");
    Json(server.health())
}

/// Root endpoint with server info.
async fn root_handler() -> impl IntoResponse {
    tracing::trace!("Root page request");
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>RunWave</title>
    <style>
        body { font-family: system-ui; max-width: 800px; margin: 50px auto; padding: 20px; }
        code { background: #f4f4f4; padding: 2px 6px; border-radius: 3px; }
        pre { background: #f4f4f4; padding: 16px; border-radius: 6px; overflow-x: auto; }
    </style>
</head>
<body>
    <h1>RunWave</h1>
    <p>Runs untrusted code on single-use sandbox pods from a warm pool.</p>

    <h2>Endpoints</h2>
    <ul>
        <li><code>POST /execute</code> - Run code, body <code>{"code": "...", "language": "python"}</code></li>
        <li><code>GET /health</code> - Standby and in-use pods</li>
    </ul>

    <h2>Example</h2>
    <pre>curl -X POST http://localhost:8080/execute \
  -H "Content-Type: application/json" \
  -d '{"code":"print(1 + 1)","language":"python"}'</pre>
</body>
</html>"#,
    )
}

/// First 80 characters of `code`, for trace logs.
fn preview(code: &str) -> String {
    const PREVIEW_CHARS: usize = 80;
    let mut preview: String = code.chars().take(PREVIEW_CHARS).collect();
    if code.chars().nth(PREVIEW_CHARS).is_some() {
        preview.push_str("...");
    }
    preview
}

/// Start the HTTP server.
///
/// This function runs until the server is shut down via the provided
/// shutdown signal.
pub async fn serve(
    server: RunwaveServer,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(server);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerConfig;

    #[tokio::test]
    async fn test_serve_reports_bind_failure() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let server = RunwaveServer::new(&ServerConfig::default()).expect("valid config");

        let err = serve(server, addr, std::future::pending())
            .await
            .expect_err("port is already bound");
        assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);
    }

    #[test]
    fn test_preview() {
        assert_eq!(preview("print(1)"), "print(1)");
        let long = "x".repeat(100);
        let p = preview(&long);
        assert_eq!(p.len(), 83);
        assert!(p.ends_with("..."));
    }
}
