pub mod api;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::HttpServerConfig;
use crate::document::NotebookStore;
use crate::kernel::KernelManager;
use crate::stack::ExecutionStack;

#[derive(Clone)]
pub struct HttpState {
    pub stack: ExecutionStack,
    pub kernels: Arc<KernelManager>,
    pub documents: Arc<NotebookStore>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl HttpState {
    pub fn new(
        stack: ExecutionStack,
        kernels: Arc<KernelManager>,
        documents: Arc<NotebookStore>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            stack,
            kernels,
            documents,
            shutdown_tx,
        }
    }
}

/// The full application: `/api` routes plus the API docs.
pub fn app(state: HttpState) -> Router {
    let spec = api::openapi();
    let docs = SwaggerUi::new("/api/docs").url("/api/openapi.json", spec);
    Router::new()
        .merge(docs)
        .nest("/api", api::router())
        .with_state(state)
}

pub fn spawn_http_server(config: HttpServerConfig, state: HttpState) -> JoinHandle<()> {
    let shutdown_tx = state.shutdown_tx.clone();
    let app = app(state);

    tokio::spawn(async move {
        let addr = config.bind;
        if let Err(err) = serve(addr, app, shutdown_tx).await {
            tracing::error!("http server error: {err}");
        }
    })
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
