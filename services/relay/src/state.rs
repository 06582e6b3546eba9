//! Process-wide singletons, wired once at boot: directory first, then
//! registry and correlator; all live for the process lifetime.

use crate::auth::{ApiKeyAuth, PermissiveAuth, StaticKeyAuth};
use crate::config::RelayConfig;
use crate::correlator::Correlator;
use crate::directory::{replica_addr_key, Directory};
use crate::registry::Registry;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub directory: Arc<dyn Directory>,
    pub registry: Arc<Registry>,
    pub correlator: Arc<Correlator>,
    pub auth: Arc<dyn ApiKeyAuth>,
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn new(config: RelayConfig, directory: Arc<dyn Directory>) -> Self {
        let correlator = Arc::new(Correlator::new());
        let registry = Arc::new(Registry::new(
            &config.replica_id,
            Arc::clone(&correlator),
            Arc::clone(&directory),
            config.directory_ttl(),
        ));
        let auth: Arc<dyn ApiKeyAuth> = if config.api_keys.is_empty() {
            Arc::new(PermissiveAuth)
        } else {
            Arc::new(StaticKeyAuth::new(&config.api_keys))
        };
        let http_client = reqwest::Client::builder()
            .build()
            .expect("failed to build http client");
        Self {
            config: Arc::new(config),
            directory,
            registry,
            correlator,
            auth,
            http_client,
        }
    }

    pub fn advertise_addr(&self) -> String {
        self.config.advertise_addr.clone().unwrap_or_else(|| {
            self.config.peer_fallback_addr(&self.config.replica_id)
        })
    }

    /// Publish this replica's reachable address so peers can resolve it for
    /// forwarding and preemption.
    pub async fn publish_replica_addr(&self) {
        let addr = self.advertise_addr();
        if let Err(e) = self
            .directory
            .set(
                &replica_addr_key(&self.config.replica_id),
                &addr,
                self.config.directory_ttl(),
            )
            .await
        {
            warn!(error = %e, "failed to publish replica address");
        }
    }
}
