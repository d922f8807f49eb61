use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::metrics::Metrics;
use crate::protocol::Counters;
use crate::sandbox::SandboxHandle;
use crate::sandbox::SandboxState;
use crate::upstream::ClientStatus;
use crate::upstream::UpstreamHandle;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
}

/// Response for the /v1/status endpoint
#[derive(Serialize)]
struct StatusResponse {
    /// None once the client has stopped
    upstream: Option<ClientStatus>,
    /// None when no automation script is configured
    automation: Option<SandboxState>,
    counters: Counters,
}

/// Where /v1/status reads from
#[derive(Debug, Clone)]
pub struct StatusSource {
    pub client: UpstreamHandle,
    pub sandbox: Option<SandboxHandle>,
    pub metrics: Metrics,
}

/// Shared application state
struct AppState {
    version: &'static str,
    status: StatusSource,
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
        }),
    )
}

/// Handler for GET /v1/status
#[tracing::instrument(skip(state))]
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/status request");

    let source = &state.status;
    let upstream = source.client.status().await;
    let code = if upstream.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(StatusResponse {
            upstream,
            automation: source.sandbox.as_ref().map(SandboxHandle::state),
            counters: source.metrics.snapshot(),
        }),
    )
}

/// Create the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to `listen:port` and serves until `shutdown_rx` fires.
pub async fn serve(
    listen: String,
    port: u16,
    status: StatusSource,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let version = env!("CARGO_PKG_VERSION");

    let state = Arc::new(AppState { version, status });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("[api] Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("[api] HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::bridge::mock::MockBridge;
    use crate::metrics::Metric;
    use crate::upstream::mock::MockConnector;
    use crate::upstream::ClientOptions;
    use crate::upstream::UpstreamClient;

    fn router() -> (Router, Metrics, UpstreamHandle) {
        let (connector, _peers) = MockConnector::new();
        let metrics = Metrics::new();
        let (client, handle) = UpstreamClient::new(
            ClientOptions {
                url: "wss://upstream.test/bridge".to_string(),
                api_key: "key".to_string(),
                development: false,
            },
            connector,
            Arc::new(MockBridge::new(vec![])),
            metrics.clone(),
        );
        client.spawn();

        let state = Arc::new(AppState {
            version: "test",
            status: StatusSource {
                client: handle.clone(),
                sandbox: None,
                metrics: metrics.clone(),
            },
        });
        (create_router(state), metrics, handle)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_ping() {
        let (app, _, _) = router();
        let (status, body) = get_json(app, "/v1/ping").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_info() {
        let (app, _, _) = router();
        let (status, body) = get_json(app, "/v1/info").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], "test");
        assert!(body["hostname"].is_string());
    }

    #[tokio::test]
    async fn test_status() {
        let (app, metrics, _) = router();
        metrics.increment(Metric::SetOk);

        let (status, body) = get_json(app, "/v1/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["upstream"]["state"], "disconnected");
        assert_eq!(body["upstream"]["ready"], false);
        assert!(body["automation"].is_null());
        assert_eq!(body["counters"]["setOK"], 1);
        assert_eq!(body["counters"]["automationCrashes"], 0);
    }

    #[tokio::test]
    async fn test_status_after_client_stopped() {
        let (app, _, handle) = router();
        handle.shutdown().await;

        let (status, body) = get_json(app, "/v1/status").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["upstream"].is_null());
    }
}
