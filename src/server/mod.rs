pub mod api;
mod ws;

use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ServerConfig;
pub use api::{router, AppState};

/// Run the server until `shutdown` resolves, then close every push channel
pub async fn serve(
    config: ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let bind = config.bind;
    let state = AppState::new(config).context("failed to open state store")?;
    let hub = state.hub.clone();

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %listener.local_addr()?, "Sync server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            let closed = hub.close_all();
            info!(closed, "Shutting down, closed push channels");
        })
        .await?;

    Ok(())
}

/// A server running on a background task
pub struct ServerHandle {
    addr: SocketAddr,
    state: AppState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base `http://` URL clients should use
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop accepting connections, close push channels and wait for the task
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.state.hub.close_all();
        (&mut self.task).await.context("server task panicked")??;
        Ok(())
    }
}

/// Bind and start serving in the background; `bind` may use port 0
pub async fn spawn(config: ServerConfig) -> Result<ServerHandle> {
    let bind = config.bind;
    let state = AppState::new(config).context("failed to open state store")?;

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let app = router(state.clone());
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
    });
    info!(addr = %addr, "Sync server started");

    Ok(ServerHandle {
        addr,
        state,
        shutdown_tx: Some(shutdown_tx),
        task,
    })
}
