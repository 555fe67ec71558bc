pub mod batch;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod control;
pub mod errors;
pub mod export;
pub mod ingestion;
pub mod model;
pub mod providers;
pub mod retry;
pub mod strategy;
pub mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::batch::{BatchController, RunStats, RunSummary};
pub use crate::cache::GeocodeCache;
pub use crate::checkpoint::{Checkpoint, CheckpointStore};
pub use crate::config::{GeocoderConfig, PublicGeocoderConfig};
pub use crate::control::{ControlState, RunControl};
pub use crate::errors::{AppError, AppResult};
pub use crate::model::{
    AddressRecord, BoundingBox, Coordinate, Dataset, GeocodeResult, OutcomeStatus,
    ResolutionMethod,
};
pub use crate::providers::{GeocodingProvider, ProviderChain, ProviderError};
pub use crate::telemetry::{EventLevel, EventLog, RunEvent};

#[derive(Debug, Serialize)]
pub struct EngineHealth {
    pub cache_path: Option<String>,
    pub cache_entries: usize,
    pub event_journal_path: Option<String>,
    pub event_queue_depth: usize,
    pub providers: Vec<String>,
    pub config: PublicGeocoderConfig,
}

/// Shared pieces a run needs: cache loaded from disk, provider chain and
/// event log. Each call to [`GeocoderEngine::controller`] gets its own
/// control cell.
pub struct GeocoderEngine {
    config: GeocoderConfig,
    cache: Arc<GeocodeCache>,
    providers: ProviderChain,
    events: EventLog,
}

impl GeocoderEngine {
    pub fn initialize(config: GeocoderConfig, data_dir: Option<&Path>) -> AppResult<Self> {
        init_tracing();
        let providers = ProviderChain::from_config(&config);
        Self::with_providers(config, providers, data_dir)
    }

    pub fn with_providers(
        config: GeocoderConfig,
        providers: ProviderChain,
        data_dir: Option<&Path>,
    ) -> AppResult<Self> {
        if providers.is_empty() {
            return Err(AppError::Config("no geocoding provider is configured".into()));
        }

        let cache = match resolve_cache_path(&config, data_dir) {
            Some(path) => GeocodeCache::with_path(path),
            None => GeocodeCache::in_memory(),
        };
        let loaded = cache.load_from_disk();

        let events = match data_dir {
            Some(dir) => EventLog::with_journal(dir, &config)?,
            None => EventLog::in_memory(),
        };
        info!(
            providers = ?providers.names(),
            cache_entries = loaded,
            "geocoder engine ready"
        );

        Ok(Self {
            config,
            cache: Arc::new(cache),
            providers,
            events,
        })
    }

    pub fn config(&self) -> &GeocoderConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<GeocodeCache> {
        &self.cache
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn controller(&self) -> BatchController {
        BatchController::new(
            &self.config,
            self.providers.clone(),
            Arc::clone(&self.cache),
            self.events.clone(),
        )
    }

    pub fn health(&self) -> EngineHealth {
        EngineHealth {
            cache_path: self.cache.path().map(|p| p.to_string_lossy().to_string()),
            cache_entries: self.cache.len(),
            event_journal_path: self
                .events
                .journal_path()
                .map(|p| p.to_string_lossy().to_string()),
            event_queue_depth: self.events.queue_depth(),
            providers: self.providers.names(),
            config: self.config.public_profile(),
        }
    }

    pub fn shutdown(&self) {
        if let Err(err) = self.cache.persist_to_disk() {
            warn!(?err, "failed to persist geocode cache on shutdown");
        }
        if let Err(err) = self.events.flush() {
            warn!(?err, "failed to flush event journal on shutdown");
        }
    }
}

fn resolve_cache_path(config: &GeocoderConfig, data_dir: Option<&Path>) -> Option<PathBuf> {
    let file = config.cache_file.as_ref()?;
    match data_dir {
        Some(dir) if file.is_relative() => Some(dir.join(file)),
        _ => Some(file.clone()),
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,registry_geocoder=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
    });
}
