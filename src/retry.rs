use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, GeocodeCache};
use crate::config::GeocoderConfig;
use crate::control::RunControl;
use crate::errors::AppResult;
use crate::model::{BoundingBox, Coordinate};
use crate::providers::ProviderChain;

const MAX_BACKOFF_EXPONENT: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff_unit: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GeocoderConfig) -> Self {
        Self {
            backoff_unit: config.backoff_unit(),
            call_timeout: config.provider_timeout(),
        }
    }

    /// `2^attempt` backoff units.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_unit
            .checked_mul(1_u32 << attempt.min(MAX_BACKOFF_EXPONENT))
            .unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeKind {
    Resolved {
        coordinate: Coordinate,
        provider: String,
    },
    Cached {
        coordinate: Coordinate,
        provider: String,
    },
    EmptyQuery,
    AllProvidersFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    pub kind: OutcomeKind,
    pub provider_calls: u32,
}

impl ResolutionOutcome {
    fn new(kind: OutcomeKind, provider_calls: u32) -> Self {
        Self {
            kind,
            provider_calls,
        }
    }

    pub fn coordinate(&self) -> Option<Coordinate> {
        match &self.kind {
            OutcomeKind::Resolved { coordinate, .. } | OutcomeKind::Cached { coordinate, .. } => {
                Some(*coordinate)
            }
            _ => None,
        }
    }
}

/// Wraps provider calls with the cache, bounded retries and exponential
/// backoff, walking the provider chain in order.
pub struct RetryController {
    cache: Arc<GeocodeCache>,
    bounds: BoundingBox,
    policy: RetryPolicy,
    control: RunControl,
}

impl RetryController {
    pub fn new(
        cache: Arc<GeocodeCache>,
        bounds: BoundingBox,
        policy: RetryPolicy,
        control: RunControl,
    ) -> Self {
        Self {
            cache,
            bounds,
            policy,
            control,
        }
    }

    pub fn cache(&self) -> &Arc<GeocodeCache> {
        &self.cache
    }

    pub fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    /// Fails only with `AppError::Interrupted`, when a stop lands before a
    /// provider call or during a backoff delay.
    pub async fn resolve(
        &self,
        query: &str,
        providers: &ProviderChain,
        max_retries: u32,
    ) -> AppResult<ResolutionOutcome> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(ResolutionOutcome::new(OutcomeKind::EmptyQuery, 0));
        }

        if let Some(entry) = self.cache.lookup(query) {
            if self.bounds.contains(entry.coordinate()) {
                debug!(query = %truncate(query), provider = %entry.provider, "cache hit");
                return Ok(ResolutionOutcome::new(
                    OutcomeKind::Cached {
                        coordinate: entry.coordinate(),
                        provider: entry.provider,
                    },
                    0,
                ));
            }
            warn!(
                query = %truncate(query),
                lat = entry.lat,
                lon = entry.lon,
                "cached coordinates outside bounding box; ignoring entry"
            );
        }

        let mut calls = 0;
        for provider in providers.iter() {
            let name = provider.name();
            for attempt in 0..max_retries {
                let has_more = attempt + 1 < max_retries;
                debug!(
                    provider = name,
                    attempt = attempt + 1,
                    max_retries,
                    query = %truncate(query),
                    "geocoding attempt"
                );
                self.control.check_stopped()?;
                calls += 1;
                match provider.geocode(query, self.policy.call_timeout).await {
                    Ok(Some(coordinate)) if self.bounds.contains(coordinate) => {
                        self.cache.store(query, CacheEntry::new(coordinate, name));
                        info!(provider = name, lat = coordinate.lat, lon = coordinate.lon, "geocoded");
                        return Ok(ResolutionOutcome::new(
                            OutcomeKind::Resolved {
                                coordinate,
                                provider: name.to_string(),
                            },
                            calls,
                        ));
                    }
                    Ok(Some(coordinate)) => {
                        warn!(
                            provider = name,
                            lat = coordinate.lat,
                            lon = coordinate.lon,
                            "coordinates outside bounding box; discarding"
                        );
                    }
                    Ok(None) => {
                        if has_more {
                            self.control
                                .sleep_unless_stopped(self.policy.backoff_delay(attempt))
                                .await?;
                        }
                    }
                    Err(err) if err.is_retryable() => {
                        warn!(provider = name, attempt = attempt + 1, %err, "provider call failed");
                        if has_more {
                            self.control
                                .sleep_unless_stopped(self.policy.backoff_delay(attempt))
                                .await?;
                        }
                    }
                    Err(err) => {
                        warn!(provider = name, %err, "unexpected provider failure; trying next provider");
                        break;
                    }
                }
            }
        }

        warn!(query = %truncate(query), calls, "all providers failed");
        Ok(ResolutionOutcome::new(OutcomeKind::AllProvidersFailed, calls))
    }
}

fn truncate(query: &str) -> &str {
    match query.char_indices().nth(50) {
        Some((idx, _)) => &query[..idx],
        None => query,
    }
}
