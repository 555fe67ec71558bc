use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

use crate::model::BoundingBox;

const DEFAULT_EVENT_LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_EVENT_LOG_MAX_FILES: usize = 5;
const DEFAULT_PROVIDERS: &str = "nominatim,photon,arcgis";
const DEFAULT_BBOX: BoundingBox = BoundingBox {
    min_lat: -22.0,
    max_lat: -17.0,
    min_lon: -42.0,
    max_lon: -38.0,
};

#[derive(Clone, Debug)]
pub struct GeocoderConfig {
    pub providers: Vec<String>,
    pub max_retries: u32,
    pub backoff_unit_ms: u64,
    pub provider_timeout_secs: u64,
    pub rate_limit_ms: u64,
    pub checkpoint_every: usize,
    pub pause_poll_ms: u64,
    pub cache_file: Option<PathBuf>,
    pub bounding_box: BoundingBox,
    pub region: String,
    pub country: String,
    pub user_agent: String,
    pub google_api_key: Option<SecretString>,
    pub event_log_enabled: bool,
    pub event_log_batch_size: usize,
    pub event_log_max_bytes: u64,
    pub event_log_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicGeocoderConfig {
    pub providers: Vec<String>,
    pub max_retries: u32,
    pub backoff_unit_ms: u64,
    pub provider_timeout_secs: u64,
    pub rate_limit_ms: u64,
    pub checkpoint_every: usize,
    pub cache_file: Option<String>,
    pub bounding_box: BoundingBox,
    pub region: String,
    pub country: String,
    pub has_google_api_key: bool,
    pub event_log_enabled: bool,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            providers: split_list(DEFAULT_PROVIDERS),
            max_retries: 3,
            backoff_unit_ms: 1_000,
            provider_timeout_secs: 30,
            rate_limit_ms: 300,
            checkpoint_every: 25,
            pause_poll_ms: 100,
            cache_file: Some(PathBuf::from("geocoding_cache.json")),
            bounding_box: DEFAULT_BBOX,
            region: "Espírito Santo".to_string(),
            country: "Brasil".to_string(),
            user_agent: "registry_geocoder".to_string(),
            google_api_key: None,
            event_log_enabled: true,
            event_log_batch_size: 25,
            event_log_max_bytes: DEFAULT_EVENT_LOG_MAX_BYTES,
            event_log_max_files: DEFAULT_EVENT_LOG_MAX_FILES,
        }
    }
}

impl GeocoderConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            providers: env::var("GEOCODER_PROVIDERS")
                .map(|v| split_list(&v))
                .ok()
                .filter(|list| !list.is_empty())
                .unwrap_or(defaults.providers),
            max_retries: parse_u32("GEOCODER_MAX_RETRIES", defaults.max_retries).max(1),
            backoff_unit_ms: parse_u64("GEOCODER_BACKOFF_UNIT_MS", defaults.backoff_unit_ms),
            provider_timeout_secs: parse_u64(
                "GEOCODER_TIMEOUT_SECS",
                defaults.provider_timeout_secs,
            )
            .max(1),
            rate_limit_ms: parse_u64("GEOCODER_RATE_LIMIT_MS", defaults.rate_limit_ms),
            checkpoint_every: parse_usize("GEOCODER_CHECKPOINT_EVERY", defaults.checkpoint_every)
                .max(1),
            pause_poll_ms: parse_u64("GEOCODER_PAUSE_POLL_MS", defaults.pause_poll_ms).max(10),
            cache_file: match env::var("GEOCODER_CACHE_FILE") {
                Ok(v) if v.trim().is_empty() => None,
                Ok(v) => Some(PathBuf::from(v)),
                Err(_) => defaults.cache_file,
            },
            bounding_box: env::var("GEOCODER_BBOX")
                .ok()
                .and_then(|v| parse_bbox(&v))
                .unwrap_or(defaults.bounding_box),
            region: env::var("GEOCODER_REGION").unwrap_or(defaults.region),
            country: env::var("GEOCODER_COUNTRY").unwrap_or(defaults.country),
            user_agent: env::var("GEOCODER_USER_AGENT").unwrap_or(defaults.user_agent),
            google_api_key: env::var("GOOGLE_GEOCODING_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            event_log_enabled: parse_bool("EVENT_LOG_ENABLED", defaults.event_log_enabled),
            event_log_batch_size: parse_usize(
                "EVENT_LOG_BATCH_SIZE",
                defaults.event_log_batch_size,
            )
            .max(1),
            event_log_max_bytes: parse_u64("EVENT_LOG_MAX_BYTES", defaults.event_log_max_bytes),
            event_log_max_files: parse_usize("EVENT_LOG_MAX_FILES", defaults.event_log_max_files)
                .max(1),
        }
    }

    pub fn public_profile(&self) -> PublicGeocoderConfig {
        PublicGeocoderConfig {
            providers: self.providers.clone(),
            max_retries: self.max_retries,
            backoff_unit_ms: self.backoff_unit_ms,
            provider_timeout_secs: self.provider_timeout_secs,
            rate_limit_ms: self.rate_limit_ms,
            checkpoint_every: self.checkpoint_every,
            cache_file: self
                .cache_file
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            bounding_box: self.bounding_box,
            region: self.region.clone(),
            country: self.country.clone(),
            has_google_api_key: self.google_api_key.is_some(),
            event_log_enabled: self.event_log_enabled,
        }
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }

    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

fn parse_bbox(value: &str) -> Option<BoundingBox> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    let [min_lat, max_lat, min_lon, max_lon] = parts.as_slice() else {
        warn!(value, "GEOCODER_BBOX needs four comma separated numbers");
        return None;
    };
    if min_lat > max_lat || min_lon > max_lon {
        warn!(value, "GEOCODER_BBOX bounds are inverted; using defaults");
        return None;
    }
    Some(BoundingBox {
        min_lat: *min_lat,
        max_lat: *max_lat,
        min_lon: *min_lon,
        max_lon: *max_lon,
    })
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}
