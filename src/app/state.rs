use std::sync::Arc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::app::config::GatewayConfig;
use crate::error::Result;
use crate::gateway::Gateway;
use crate::health::{build_report, Clock, HealthMonitor, HealthReport, MemoryHealthStore, SystemClock};
use crate::pricing::StaticPriceCatalog;
use crate::routing::Router;

/// Wired-up gateway components for one process.
pub struct AppState {
    config: Arc<RwLock<GatewayConfig>>,
    store: Arc<MemoryHealthStore>,
    monitor: Arc<HealthMonitor>,
    catalog: Arc<StaticPriceCatalog>,
    gateway: Arc<Gateway>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: GatewayConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        info!("Initializing gateway state");
        config.validate()?;

        let store = Arc::new(MemoryHealthStore::new(clock.clone()));
        let monitor = Arc::new(HealthMonitor::new(store.clone(), clock, config.to_health_settings()));

        let catalog = Arc::new(StaticPriceCatalog::new());
        match &config.pricing.cards_dir {
            Some(dir) if dir.is_dir() => {
                catalog.load_dir(dir)?;
            }
            Some(dir) => warn!("Price card directory {:?} not found, starting without cards", dir),
            None => debug!("No price card directory configured"),
        }

        let router = Router::new(monitor.clone(), config.routing.presets.clone());
        let gateway = Arc::new(Gateway::new(
            monitor.clone(),
            router,
            catalog.clone(),
            config.to_execution_settings(),
        ));

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            store,
            monitor,
            catalog,
            gateway,
        })
    }

    pub fn get_config(&self) -> GatewayConfig {
        self.config.read().clone()
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn catalog(&self) -> &Arc<StaticPriceCatalog> {
        &self.catalog
    }

    /// Re-read the configured card directory into the catalog.
    pub fn reload_cards(&self) -> Result<usize> {
        let dir = self.config.read().pricing.cards_dir.clone();
        match dir {
            Some(dir) => self.catalog.load_dir(&dir),
            None => Ok(0),
        }
    }

    pub async fn health_report(&self, endpoint: &str, model: &str, providers: &[String]) -> Result<HealthReport> {
        let snapshots = self.monitor.read_many(endpoint, model, providers).await?;
        let ordered: Vec<_> = providers.iter().filter_map(|p| snapshots.get(p).cloned()).collect();
        let purged = self.store.purge_expired();
        debug!("Health report for {}/{} over {} providers ({} expired keys purged)", endpoint, model, ordered.len(), purged);
        Ok(build_report(&ordered))
    }
}
