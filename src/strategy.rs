use tracing::debug;

use crate::errors::AppResult;
use crate::model::{AddressRecord, GeocodeResult, OutcomeStatus, ResolutionMethod};
use crate::providers::ProviderChain;
use crate::retry::{OutcomeKind, ResolutionOutcome, RetryController};

pub const POSTAL_CODE_DIGITS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldMatcher {
    Exact(String),
    /// Case-insensitive substring of the column name.
    Contains(String),
}

impl FieldMatcher {
    fn matches(&self, column: &str) -> bool {
        match self {
            FieldMatcher::Exact(name) => column == name,
            FieldMatcher::Contains(fragment) => column
                .to_lowercase()
                .contains(&fragment.to_lowercase()),
        }
    }
}

/// Picks the postal-code column of a dataset. Matchers are tried in order and
/// the first column satisfying one wins.
#[derive(Debug, Clone)]
pub struct PostalFieldResolver {
    matchers: Vec<FieldMatcher>,
}

impl Default for PostalFieldResolver {
    fn default() -> Self {
        Self::new(vec![
            FieldMatcher::Exact("V19".into()),
            FieldMatcher::Exact("cep".into()),
            FieldMatcher::Contains("cep".into()),
            FieldMatcher::Contains("postal".into()),
        ])
    }
}

impl PostalFieldResolver {
    pub fn new(matchers: Vec<FieldMatcher>) -> Self {
        Self { matchers }
    }

    pub fn resolve<'a>(&self, columns: &'a [String]) -> Option<&'a str> {
        self.matchers.iter().find_map(|matcher| {
            columns
                .iter()
                .find(|column| matcher.matches(column))
                .map(String::as_str)
        })
    }
}

/// Strips separators and checks the CEP is exactly eight digits.
pub fn clean_postal_code(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '-' | '.') && !c.is_whitespace())
        .collect();
    if cleaned.len() == POSTAL_CODE_DIGITS && cleaned.chars().all(|c| c.is_ascii_digit()) {
        Some(cleaned)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordResolution {
    pub result: GeocodeResult,
    pub provider_calls: u32,
}

pub struct ResolutionStrategy {
    retry: RetryController,
    providers: ProviderChain,
    max_retries: u32,
    region: String,
    country: String,
}

impl ResolutionStrategy {
    pub fn new(
        retry: RetryController,
        providers: ProviderChain,
        max_retries: u32,
        region: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self {
            retry,
            providers,
            max_retries: max_retries.max(1),
            region: region.into(),
            country: country.into(),
        }
    }

    pub fn retry(&self) -> &RetryController {
        &self.retry
    }

    pub fn providers(&self) -> &ProviderChain {
        &self.providers
    }

    /// Full address first, postal code second. `postal_field` is the column
    /// chosen once per dataset by [`PostalFieldResolver`].
    pub async fn resolve_record(
        &self,
        record: &AddressRecord,
        postal_field: Option<&str>,
    ) -> AppResult<RecordResolution> {
        let mut calls = 0;
        let mut address_attempted = false;

        if let Some(address) = record.full_address.as_deref() {
            let outcome = self.lookup(address).await?;
            calls += outcome.provider_calls;
            match outcome.kind {
                OutcomeKind::Resolved {
                    coordinate,
                    provider,
                } => {
                    return Ok(RecordResolution {
                        result: GeocodeResult::resolved(
                            coordinate,
                            ResolutionMethod::AddressProvider(provider),
                            OutcomeStatus::Success,
                        ),
                        provider_calls: calls,
                    })
                }
                OutcomeKind::Cached {
                    coordinate,
                    provider,
                } => {
                    return Ok(RecordResolution {
                        result: GeocodeResult::resolved(
                            coordinate,
                            ResolutionMethod::CacheHit(provider),
                            OutcomeStatus::Cache,
                        ),
                        provider_calls: calls,
                    })
                }
                OutcomeKind::EmptyQuery | OutcomeKind::AllProvidersFailed => {
                    address_attempted = true;
                }
            }
        }

        let Some(field) = postal_field else {
            let method = if address_attempted {
                ResolutionMethod::AllProvidersFailed
            } else {
                ResolutionMethod::NoAddress
            };
            return Ok(RecordResolution {
                result: GeocodeResult::failed(method),
                provider_calls: calls,
            });
        };

        let raw = record.field(field).unwrap_or_default().trim();
        if raw.is_empty() {
            let method = if address_attempted {
                ResolutionMethod::NoPostalCode
            } else {
                ResolutionMethod::NoAddress
            };
            return Ok(RecordResolution {
                result: GeocodeResult::failed(method),
                provider_calls: calls,
            });
        }
        let Some(cep) = clean_postal_code(raw) else {
            debug!(field, value = raw, "malformed postal code");
            return Ok(RecordResolution {
                result: GeocodeResult::failed(ResolutionMethod::InvalidPostalCode),
                provider_calls: calls,
            });
        };

        let query = self.postal_query(&cep);
        let outcome = self.lookup(&query).await?;
        calls += outcome.provider_calls;
        let result = match outcome.kind {
            OutcomeKind::Resolved {
                coordinate,
                provider,
            } => GeocodeResult::resolved(
                coordinate,
                ResolutionMethod::PostalProvider(provider),
                OutcomeStatus::Success,
            ),
            OutcomeKind::Cached {
                coordinate,
                provider,
            } => GeocodeResult::resolved(
                coordinate,
                ResolutionMethod::PostalProvider(provider),
                OutcomeStatus::Cache,
            ),
            OutcomeKind::EmptyQuery => GeocodeResult::failed(ResolutionMethod::NoPostalCode),
            OutcomeKind::AllProvidersFailed => {
                GeocodeResult::failed(ResolutionMethod::AllProvidersFailed)
            }
        };
        Ok(RecordResolution {
            result,
            provider_calls: calls,
        })
    }

    fn postal_query(&self, cep: &str) -> String {
        format!(
            "{}-{}, {}, {}",
            &cep[..5],
            &cep[5..],
            self.region,
            self.country
        )
    }

    async fn lookup(&self, query: &str) -> AppResult<ResolutionOutcome> {
        self.retry
            .resolve(query, &self.providers, self.max_retries)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::cache::GeocodeCache;
    use crate::control::RunControl;
    use crate::model::{BoundingBox, Coordinate};
    use crate::providers::{GeocodingProvider, ProviderError};
    use crate::retry::test_support::ScriptedProvider;
    use crate::retry::RetryPolicy;

    const INSIDE: Coordinate = Coordinate {
        lat: -20.3,
        lon: -40.3,
    };

    fn strategy(provider: Arc<ScriptedProvider>) -> ResolutionStrategy {
        let control = RunControl::new();
        control.begin().unwrap();
        let retry = RetryController::new(
            Arc::new(GeocodeCache::in_memory()),
            BoundingBox {
                min_lat: -22.0,
                max_lat: -17.0,
                min_lon: -42.0,
                max_lon: -38.0,
            },
            RetryPolicy {
                backoff_unit: Duration::from_millis(10),
                call_timeout: Duration::from_secs(1),
            },
            control,
        );
        let chain = ProviderChain::new(vec![provider as Arc<dyn GeocodingProvider>]);
        ResolutionStrategy::new(retry, chain, 3, "Espírito Santo", "Brasil")
    }

    fn record(address: Option<&str>, cep: Option<&str>) -> AddressRecord {
        let fields = cep
            .map(|value| vec![("cep_empresa".to_string(), value.to_string())])
            .unwrap_or_default();
        AddressRecord::new(address.map(str::to_string), fields)
    }

    #[test]
    fn resolver_prefers_earlier_matchers() {
        let columns = vec![
            "nome".to_string(),
            "CodigoPostal".to_string(),
            "CEP_Empresa".to_string(),
            "V19".to_string(),
        ];
        let resolver = PostalFieldResolver::default();
        assert_eq!(resolver.resolve(&columns), Some("V19"));
        assert_eq!(resolver.resolve(&columns[..3]), Some("CEP_Empresa"));
        assert_eq!(resolver.resolve(&columns[..2]), Some("CodigoPostal"));
        assert_eq!(resolver.resolve(&columns[..1]), None);
    }

    #[test]
    fn cleans_postal_codes() {
        assert_eq!(clean_postal_code("29.000-000").as_deref(), Some("29000000"));
        assert_eq!(clean_postal_code(" 29000 000 ").as_deref(), Some("29000000"));
        assert!(clean_postal_code("2900000").is_none());
        assert!(clean_postal_code("290000000").is_none());
        assert!(clean_postal_code("2900000A").is_none());
    }

    #[tokio::test]
    async fn falls_back_to_postal_code() {
        let provider = Arc::new(ScriptedProvider::new(
            "Nominatim",
            vec![Ok(None), Ok(None), Ok(None)],
            Ok(Some(INSIDE)),
        ));
        let strategy = strategy(provider.clone());
        let resolution = strategy
            .resolve_record(
                &record(Some("Rua Inexistente, 0"), Some("29000-000")),
                Some("cep_empresa"),
            )
            .await
            .unwrap();
        assert_eq!(resolution.result.status, OutcomeStatus::Success);
        assert_eq!(resolution.result.method.label(), "CEP-Nominatim");
        assert!(resolution.result.is_postal_fallback());
        assert_eq!(resolution.provider_calls, 4);
    }

    #[tokio::test]
    async fn invalid_postal_code_makes_no_calls() {
        let provider = Arc::new(ScriptedProvider::always("P", Ok(Some(INSIDE))));
        let strategy = strategy(provider.clone());
        for cep in ["123", "123456789", "ABCDEFGH"] {
            let resolution = strategy
                .resolve_record(&record(None, Some(cep)), Some("cep_empresa"))
                .await
                .unwrap();
            assert_eq!(resolution.result.method, ResolutionMethod::InvalidPostalCode);
            assert_eq!(resolution.result.status, OutcomeStatus::Failed);
            assert!(resolution.result.coordinate().is_none());
        }
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn missing_address_and_field_is_no_address() {
        let provider = Arc::new(ScriptedProvider::always("P", Ok(Some(INSIDE))));
        let strategy = strategy(provider.clone());
        let resolution = strategy.resolve_record(&record(None, None), None).await.unwrap();
        assert_eq!(resolution.result.method, ResolutionMethod::NoAddress);
        assert_eq!(resolution.result.status, OutcomeStatus::Failed);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn blank_postal_value_without_address_is_no_address() {
        let provider = Arc::new(ScriptedProvider::always("P", Ok(Some(INSIDE))));
        let strategy = strategy(provider.clone());
        let resolution = strategy
            .resolve_record(&record(None, Some("  ")), Some("cep_empresa"))
            .await
            .unwrap();
        assert_eq!(resolution.result.method, ResolutionMethod::NoAddress);
        assert_eq!(resolution.result.method.label(), "Sem CEP");
        assert_eq!(resolution.result.status, OutcomeStatus::Failed);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn blank_postal_value_after_failed_address_is_no_postal_code() {
        let provider = Arc::new(ScriptedProvider::always(
            "P",
            Err(ProviderError::Unexpected("bad payload".into())),
        ));
        let strategy = strategy(provider.clone());
        let resolution = strategy
            .resolve_record(&record(Some("Rua Z, 1"), Some("")), Some("cep_empresa"))
            .await
            .unwrap();
        assert_eq!(resolution.result.method, ResolutionMethod::NoPostalCode);
        assert_eq!(resolution.provider_calls, 1);
    }

    #[tokio::test]
    async fn resolving_twice_is_idempotent() {
        let provider = Arc::new(ScriptedProvider::always("P", Ok(Some(INSIDE))));
        let strategy = strategy(provider.clone());
        let input = record(Some("Av. Fernando Ferrari, 514, Vitória"), None);
        let first = strategy.resolve_record(&input, None).await.unwrap();
        let second = strategy.resolve_record(&input, None).await.unwrap();
        assert_eq!(first.result.coordinate(), second.result.coordinate());
        assert_eq!(second.result.status, OutcomeStatus::Cache);
        assert_eq!(second.result.method, ResolutionMethod::CacheHit("P".into()));
        let third = strategy.resolve_record(&input, None).await.unwrap();
        assert_eq!(second, third);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn failed_address_without_postal_field_reports_exhaustion() {
        let provider = Arc::new(ScriptedProvider::always(
            "P",
            Err(ProviderError::Unexpected("bad".into())),
        ));
        let strategy = strategy(provider);
        let resolution = strategy
            .resolve_record(&record(Some("Rua A"), None), None)
            .await
            .unwrap();
        assert_eq!(resolution.result.method, ResolutionMethod::AllProvidersFailed);
        assert_eq!(resolution.result.status, OutcomeStatus::Failed);
    }
}
