use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use jagc_core::RunService;
use jagc_store::Store;
use jagc_tasks::TaskEngine;

mod http;

pub use http::router;

#[derive(Clone)]
pub struct AppState {
    pub runs: Arc<RunService>,
    pub store: Store,
    pub tasks: Option<Arc<TaskEngine>>,
}

pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("http surface listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
