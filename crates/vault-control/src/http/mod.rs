pub mod api;

use std::net::SocketAddr;

use axum::Router;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::HttpServerConfig;
use crate::control::ControlPlane;

#[derive(Clone)]
pub struct HttpState {
    pub control: ControlPlane,
}

impl HttpState {
    pub fn new(control: ControlPlane) -> Self {
        Self { control }
    }
}

/// Operational routes plus the Swagger UI.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/api/docs").url("/api/openapi.json", api::openapi()))
        .merge(api::router())
        .with_state(state)
}

pub fn spawn_http_server(
    config: HttpServerConfig,
    control: ControlPlane,
    shutdown_tx: broadcast::Sender<()>,
) -> Option<JoinHandle<()>> {
    if !config.enabled {
        return None;
    }
    let app = router(HttpState::new(control));

    Some(tokio::spawn(async move {
        let addr = config.bind;
        if let Err(err) = serve(addr, app, shutdown_tx).await {
            tracing::error!("http server error: {err}");
        }
    }))
}

async fn serve(
    addr: SocketAddr,
    app: Router,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), String> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind {addr}: {e}"))?;
    tracing::info!("HTTP server listening on http://{}", addr);
    let mut shutdown_rx = shutdown_tx.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .map_err(|e| format!("serve {addr}: {e}"))
}
