//!
//! The HTTP host: listener, graceful shutdown, and the wiring that puts
//! the gate supervisor in front of every request.
//!

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use axum_server::Handle;

use crate::supervisor::GateSupervisor;

/// The running service. Owns the supervisor, the config watcher and the
/// listener lifecycle.
pub struct Server {
    supervisor: Arc<GateSupervisor>,
}

impl Server {
    /// Bring the whole stack up and serve until `SIGINT`/`SIGTERM`.
    pub async fn run(config_path: PathBuf) -> anyhow::Result<()> {
        let supervisor = GateSupervisor::start(config_path).await?;
        let _watcher = supervisor.watch()?;
        let server = Self {
            supervisor: Arc::clone(&supervisor),
        };

        let bind = {
            let config = supervisor.server_config();
            format!("{}:{}", config.host, config.port)
        };
        let addr: SocketAddr = bind
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address {bind:?}: {e}"))?;
        let grace = Duration::from_secs(supervisor.server_config().graceful_shutdown_s);

        let handle = Handle::new();
        tokio::spawn(shutdown_on_signal(
            handle.clone(),
            Arc::clone(&supervisor),
            grace,
        ));

        tracing::info!(%addr, "chatbotgate listening");
        axum_server::bind(addr)
            .handle(handle)
            .serve(
                server
                    .router()
                    .into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await?;

        // Listener closed: release stores and sweepers.
        supervisor.shutdown().await;
        tracing::info!("shutdown complete");
        Ok(())
    }

    fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(Arc::clone(&self.supervisor))
    }
}

/// Every request takes one atomic read of the published middleware and
/// stays on that snapshot.
async fn dispatch(State(supervisor): State<Arc<GateSupervisor>>, req: Request) -> Response {
    supervisor.handle(req).await
}

async fn shutdown_on_signal(handle: Handle, supervisor: Arc<GateSupervisor>, grace: Duration) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("installing SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, draining");
    // Readiness flips first so load balancers stop routing to us, then
    // in-flight requests get the grace window.
    supervisor.start_draining();
    handle.graceful_shutdown(Some(grace));
}
