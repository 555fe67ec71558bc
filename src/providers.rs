use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::GeocoderConfig;
use crate::errors::AppResult;
use crate::model::Coordinate;

const NOMINATIM_BASE: &str = "https://nominatim.openstreetmap.org";
const PHOTON_BASE: &str = "https://photon.komoot.io";
const ARCGIS_BASE: &str =
    "https://geocode.arcgis.com/arcgis/rest/services/World/GeocodeServer";
const GOOGLE_BASE: &str = "https://maps.googleapis.com/maps/api/geocode";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider service error: {0}")]
    Service(String),
    #[error("unexpected provider failure: {0}")]
    Unexpected(String),
}

impl ProviderError {
    /// Timeouts, outages and service errors are worth another attempt on the
    /// same provider; anything else abandons it.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Unexpected(_))
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[async_trait]
pub trait GeocodingProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn geocode(&self, query: &str, timeout: Duration) -> ProviderResult<Option<Coordinate>>;
}

/// Ordered provider list fixed for the duration of a run.
#[derive(Clone, Default)]
pub struct ProviderChain {
    providers: Vec<Arc<dyn GeocodingProvider>>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn GeocodingProvider>>) -> Self {
        Self { providers }
    }

    pub fn from_config(config: &GeocoderConfig) -> Self {
        let mut providers: Vec<Arc<dyn GeocodingProvider>> = Vec::new();
        for name in &config.providers {
            match build_provider(name, config) {
                Ok(Some(provider)) => {
                    debug!(provider = provider.name(), "geocoding provider configured");
                    providers.push(provider);
                }
                Ok(None) => warn!(provider = %name, "geocoding provider not available; skipping"),
                Err(err) => warn!(provider = %name, ?err, "failed to build geocoding provider; skipping"),
            }
        }
        Self { providers }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn GeocodingProvider>> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }
}

impl fmt::Debug for ProviderChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

fn build_provider(
    name: &str,
    config: &GeocoderConfig,
) -> AppResult<Option<Arc<dyn GeocodingProvider>>> {
    let provider: Arc<dyn GeocodingProvider> = match name {
        "nominatim" => Arc::new(NominatimProvider::new(NOMINATIM_BASE, &config.user_agent)?),
        "photon" => Arc::new(PhotonProvider::new(PHOTON_BASE, &config.user_agent)?),
        "arcgis" => Arc::new(ArcGisProvider::new(ARCGIS_BASE, &config.user_agent)?),
        "google" => match config.google_api_key.clone() {
            Some(key) => Arc::new(GoogleProvider::new(GOOGLE_BASE, &config.user_agent, key)?),
            None => return Ok(None),
        },
        _ => return Ok(None),
    };
    Ok(Some(provider))
}

#[derive(Clone)]
struct HttpGeocodingClient {
    http: Client,
    base_url: String,
}

impl HttpGeocodingClient {
    fn new(base_url: &str, user_agent: &str) -> AppResult<Self> {
        let http = Client::builder().user_agent(user_agent).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http.get(format!("{}{}", self.base_url, path))
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        limit: Duration,
    ) -> ProviderResult<T> {
        let call = async {
            let response = request.timeout(limit).send().await.map_err(classify_transport)?;
            let status = response.status();
            if !status.is_success() {
                return Err(classify_status(status));
            }
            response
                .json::<T>()
                .await
                .map_err(|err| ProviderError::Unexpected(err.to_string()))
        };
        match timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(limit)),
        }
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(Duration::ZERO)
    } else if err.is_connect() || err.is_request() {
        ProviderError::Unavailable(err.to_string())
    } else {
        ProviderError::Unexpected(err.to_string())
    }
}

fn classify_status(status: StatusCode) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::BAD_GATEWAY
        | StatusCode::GATEWAY_TIMEOUT => ProviderError::Unavailable(status.to_string()),
        StatusCode::REQUEST_TIMEOUT => ProviderError::Timeout(Duration::ZERO),
        _ => ProviderError::Service(status.to_string()),
    }
}

pub struct NominatimProvider {
    client: HttpGeocodingClient,
}

impl NominatimProvider {
    pub fn new(base_url: &str, user_agent: &str) -> AppResult<Self> {
        Ok(Self {
            client: HttpGeocodingClient::new(base_url, user_agent)?,
        })
    }
}

#[async_trait]
impl GeocodingProvider for NominatimProvider {
    fn name(&self) -> &str {
        "Nominatim"
    }

    async fn geocode(&self, query: &str, limit: Duration) -> ProviderResult<Option<Coordinate>> {
        #[derive(Deserialize)]
        struct Place {
            lat: String,
            lon: String,
        }

        let request = self
            .client
            .get("/search")
            .query(&[("q", query), ("format", "json"), ("limit", "1")]);
        let places: Vec<Place> = self.client.fetch_json(request, limit).await?;
        places
            .into_iter()
            .next()
            .map(|place| {
                let lat = place.lat.parse::<f64>();
                let lon = place.lon.parse::<f64>();
                match (lat, lon) {
                    (Ok(lat), Ok(lon)) => Ok(Coordinate::new(lat, lon)),
                    _ => Err(ProviderError::Unexpected(format!(
                        "non-numeric coordinates {},{}",
                        place.lat, place.lon
                    ))),
                }
            })
            .transpose()
    }
}

pub struct PhotonProvider {
    client: HttpGeocodingClient,
}

impl PhotonProvider {
    pub fn new(base_url: &str, user_agent: &str) -> AppResult<Self> {
        Ok(Self {
            client: HttpGeocodingClient::new(base_url, user_agent)?,
        })
    }
}

#[async_trait]
impl GeocodingProvider for PhotonProvider {
    fn name(&self) -> &str {
        "Photon"
    }

    async fn geocode(&self, query: &str, limit: Duration) -> ProviderResult<Option<Coordinate>> {
        #[derive(Deserialize)]
        struct FeatureCollection {
            #[serde(default)]
            features: Vec<Feature>,
        }

        #[derive(Deserialize)]
        struct Feature {
            geometry: Geometry,
        }

        #[derive(Deserialize)]
        struct Geometry {
            coordinates: Vec<f64>,
        }

        let request = self.client.get("/api/").query(&[("q", query), ("limit", "1")]);
        let collection: FeatureCollection = self.client.fetch_json(request, limit).await?;
        Ok(collection.features.into_iter().next().and_then(|feature| {
            match feature.geometry.coordinates.as_slice() {
                [lon, lat, ..] => Some(Coordinate::new(*lat, *lon)),
                _ => None,
            }
        }))
    }
}

pub struct ArcGisProvider {
    client: HttpGeocodingClient,
}

impl ArcGisProvider {
    pub fn new(base_url: &str, user_agent: &str) -> AppResult<Self> {
        Ok(Self {
            client: HttpGeocodingClient::new(base_url, user_agent)?,
        })
    }
}

#[async_trait]
impl GeocodingProvider for ArcGisProvider {
    fn name(&self) -> &str {
        "ArcGIS"
    }

    async fn geocode(&self, query: &str, limit: Duration) -> ProviderResult<Option<Coordinate>> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            candidates: Vec<Candidate>,
            error: Option<ResponseError>,
        }

        #[derive(Deserialize)]
        struct Candidate {
            location: Location,
        }

        #[derive(Deserialize)]
        struct Location {
            x: f64,
            y: f64,
        }

        #[derive(Deserialize)]
        struct ResponseError {
            message: Option<String>,
        }

        let request = self.client.get("/findAddressCandidates").query(&[
            ("SingleLine", query),
            ("f", "json"),
            ("maxLocations", "1"),
        ]);
        let response: Response = self.client.fetch_json(request, limit).await?;
        if let Some(error) = response.error {
            return Err(ProviderError::Service(
                error.message.unwrap_or_else(|| "unknown ArcGIS error".into()),
            ));
        }
        Ok(response
            .candidates
            .into_iter()
            .next()
            .map(|candidate| Coordinate::new(candidate.location.y, candidate.location.x)))
    }
}

pub struct GoogleProvider {
    client: HttpGeocodingClient,
    api_key: SecretString,
}

impl GoogleProvider {
    pub fn new(base_url: &str, user_agent: &str, api_key: SecretString) -> AppResult<Self> {
        Ok(Self {
            client: HttpGeocodingClient::new(base_url, user_agent)?,
            api_key,
        })
    }
}

#[async_trait]
impl GeocodingProvider for GoogleProvider {
    fn name(&self) -> &str {
        "GoogleV3"
    }

    async fn geocode(&self, query: &str, limit: Duration) -> ProviderResult<Option<Coordinate>> {
        #[derive(Deserialize)]
        struct Response {
            status: String,
            #[serde(default)]
            results: Vec<ResultEntry>,
            error_message: Option<String>,
        }

        #[derive(Deserialize)]
        struct ResultEntry {
            geometry: Geometry,
        }

        #[derive(Deserialize)]
        struct Geometry {
            location: Location,
        }

        #[derive(Deserialize)]
        struct Location {
            lat: f64,
            lng: f64,
        }

        let request = self
            .client
            .get("/json")
            .query(&[("address", query), ("key", self.api_key.expose_secret())]);
        let response: Response = self.client.fetch_json(request, limit).await?;
        match response.status.as_str() {
            "OK" => Ok(response
                .results
                .into_iter()
                .next()
                .map(|entry| Coordinate::new(entry.geometry.location.lat, entry.geometry.location.lng))),
            "ZERO_RESULTS" => Ok(None),
            "OVER_QUERY_LIMIT" | "UNKNOWN_ERROR" => {
                Err(ProviderError::Unavailable(response.status))
            }
            other => Err(ProviderError::Service(
                response
                    .error_message
                    .unwrap_or_else(|| other.to_string()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unexpected_errors_skip_retries() {
        assert!(ProviderError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ProviderError::Unavailable("down".into()).is_retryable());
        assert!(ProviderError::Service("500".into()).is_retryable());
        assert!(!ProviderError::Unexpected("boom".into()).is_retryable());
    }

    #[test]
    fn maps_http_statuses() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            ProviderError::Service(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::REQUEST_TIMEOUT),
            ProviderError::Timeout(_)
        ));
    }

    #[test]
    fn chain_skips_unknown_and_keyless_providers() {
        let config = GeocoderConfig {
            providers: vec!["nominatim".into(), "bogus".into(), "google".into(), "arcgis".into()],
            ..GeocoderConfig::default()
        };
        let chain = ProviderChain::from_config(&config);
        assert_eq!(chain.names(), vec!["Nominatim", "ArcGIS"]);
    }
}
