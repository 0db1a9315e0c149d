//!
//! Atomic hot-swap of the live middleware.
//!
//! The supervisor owns the single published [`AuthGate`] reference.
//! Requests dereference it once at entry and keep that snapshot for their
//! whole lifetime; reload builds the replacement completely before
//! publishing it, and any load or build error keeps the current gate.
//!

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use sha2::{Digest, Sha256};

use crate::config::{Config, ServerConfig};
use crate::constants::{DEFAULT_WATCH_DEBOUNCE, RELOAD_TEARDOWN_GRACE};
use crate::gate::AuthGate;
use crate::proxy::ProxySupervisor;
use crate::watcher::FileWatcher;

/// Owner of the currently-published middleware.
pub struct GateSupervisor {
    config_path: PathBuf,
    current: ArcSwap<AuthGate>,
    proxy: Arc<ProxySupervisor>,
    /// Server binding from the initial config; rebinding needs a restart.
    server: ServerConfig,
    /// Content hash of the last applied config file.
    last_hash: tokio::sync::Mutex<Option<[u8; 32]>>,
}

impl GateSupervisor {
    /// Load the config, build the first gate, publish it.
    pub async fn start(config_path: PathBuf) -> anyhow::Result<Arc<Self>> {
        let config = Config::load(&config_path)?;
        let proxy = Arc::new(
            ProxySupervisor::new(config.upstream.as_ref())
                .map_err(|e| anyhow::anyhow!("upstream: {e}"))?,
        );
        let gate = AuthGate::build(&config, Arc::clone(&proxy)).await?;

        let hash = std::fs::read(&config_path)
            .ok()
            .map(|bytes| Sha256::digest(&bytes).into());

        Ok(Arc::new(Self {
            config_path,
            current: ArcSwap::from_pointee(gate),
            proxy,
            server: config.server.clone(),
            last_hash: tokio::sync::Mutex::new(hash),
        }))
    }

    pub fn server_config(&self) -> &ServerConfig {
        &self.server
    }

    /// The middleware snapshot for one request.
    pub fn current(&self) -> Arc<AuthGate> {
        self.current.load_full()
    }

    /// Serve one request against a consistent snapshot.
    pub async fn handle(&self, req: Request<Body>) -> Response {
        let gate = self.current();
        gate.handle(req).await
    }

    /// Reload the config file and publish a new gate.
    ///
    /// 1. Unchanged file content is a no-op (spurious watch events).
    /// 2. Load/validation errors log every problem and keep the current
    ///    gate.
    /// 3. Build errors keep the current gate.
    /// 4. The superseded gate drains and its stores are torn down after a
    ///    grace delay.
    pub async fn reload(&self) {
        let mut last_hash = self.last_hash.lock().await;

        let bytes = match std::fs::read(&self.config_path) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::error!(path = %self.config_path.display(), %error, "config read failed, keeping current middleware");
                return;
            }
        };
        let hash: [u8; 32] = Sha256::digest(&bytes).into();
        if last_hash.as_ref() == Some(&hash) {
            tracing::debug!("config content unchanged, skipping reload");
            return;
        }

        let config = match Config::load(&self.config_path) {
            Ok(config) => config,
            Err(error) => {
                tracing::error!(path = %self.config_path.display(), %error, "config reload rejected, keeping current middleware");
                return;
            }
        };

        let gate = match AuthGate::build(&config, Arc::clone(&self.proxy)).await {
            Ok(gate) => gate,
            Err(error) => {
                tracing::error!(%error, "middleware rebuild failed, keeping current middleware");
                return;
            }
        };

        if let Err(error) = self.proxy.replace(config.upstream.as_ref()) {
            tracing::error!(%error, "upstream forwarder rebuild failed, keeping current middleware");
            gate.close().await;
            return;
        }

        *last_hash = Some(hash);
        let superseded = self.current.swap(Arc::new(gate));
        tracing::info!("configuration reloaded, new middleware published");

        // Let in-flight requests drain before the old stores go away.
        superseded.start_draining();
        tokio::spawn(async move {
            tokio::time::sleep(RELOAD_TEARDOWN_GRACE).await;
            superseded.close().await;
        });
    }

    /// Watch the config file and reload on every (debounced) change.
    /// The returned watcher must be kept alive.
    pub fn watch(self: &Arc<Self>) -> Result<FileWatcher, notify::Error> {
        let (watcher, mut events) = FileWatcher::start(&self.config_path, DEFAULT_WATCH_DEBOUNCE)?;
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Some(error) = event.error {
                    tracing::warn!(%error, "config watcher error");
                    continue;
                }
                supervisor.reload().await;
            }
        });
        Ok(watcher)
    }

    /// Move the published gate to draining ahead of shutdown.
    pub fn start_draining(&self) {
        self.current().start_draining();
    }

    /// Release the published gate's resources.
    pub async fn shutdown(&self) {
        let gate = self.current();
        gate.start_draining();
        gate.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::io::Write;
    use std::time::Duration;

    fn config_yaml(service_name: &str) -> String {
        format!(
            r#"
service:
  name: {service_name}
  base_url: https://gate.example.com
auth:
  cookie:
    secret: "0123456789abcdef0123456789abcdef"
  password:
    password: letmein
"#
        )
    }

    fn write_config(path: &std::path::Path, contents: &str) {
        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    async fn login_page_body(supervisor: &GateSupervisor) -> String {
        let req = Request::builder()
            .uri("/_auth/login")
            .body(Body::empty())
            .unwrap();
        let response = supervisor.handle(req).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_reload_publishes_new_middleware() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.yml");
        write_config(&path, &config_yaml("Before"));

        let supervisor = GateSupervisor::start(path.clone()).await.unwrap();
        assert!(login_page_body(&supervisor).await.contains("Before"));

        write_config(&path, &config_yaml("After"));
        supervisor.reload().await;
        assert!(login_page_body(&supervisor).await.contains("After"));
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_current_middleware() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.yml");
        write_config(&path, &config_yaml("Stable"));

        let supervisor = GateSupervisor::start(path.clone()).await.unwrap();
        let before = supervisor.current();

        write_config(&path, "definitely: [not, valid, gate, config");
        supervisor.reload().await;

        // Same snapshot, still serving.
        assert!(Arc::ptr_eq(&before, &supervisor.current()));
        assert!(login_page_body(&supervisor).await.contains("Stable"));

        // Restoring the file publishes a fresh middleware again.
        write_config(&path, &config_yaml("Recovered"));
        supervisor.reload().await;
        assert!(!Arc::ptr_eq(&before, &supervisor.current()));
        assert!(login_page_body(&supervisor).await.contains("Recovered"));
    }

    #[tokio::test]
    async fn test_unchanged_content_skips_republish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.yml");
        write_config(&path, &config_yaml("Same"));

        let supervisor = GateSupervisor::start(path.clone()).await.unwrap();
        let before = supervisor.current();

        // Touch the file without changing its content.
        write_config(&path, &config_yaml("Same"));
        supervisor.reload().await;
        assert!(Arc::ptr_eq(&before, &supervisor.current()));
    }

    #[tokio::test]
    async fn test_in_flight_snapshot_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.yml");
        write_config(&path, &config_yaml("Old"));

        let supervisor = GateSupervisor::start(path.clone()).await.unwrap();
        // A request that already dereferenced its snapshot.
        let pinned = supervisor.current();

        write_config(&path, &config_yaml("New"));
        supervisor.reload().await;

        // The pinned snapshot still answers with the old config.
        let req = Request::builder()
            .uri("/_auth/login")
            .body(Body::empty())
            .unwrap();
        let response = pinned.handle(req).await;
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        assert!(String::from_utf8(bytes.to_vec()).unwrap().contains("Old"));

        // Fresh requests see the new one.
        assert!(login_page_body(&supervisor).await.contains("New"));
        drop(pinned);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
