use std::sync::Arc;
use std::time::Duration;

use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;

use registry_geocoder::ingestion::load_csv;
use registry_geocoder::providers::{
    ArcGisProvider, GoogleProvider, NominatimProvider, PhotonProvider,
};
use registry_geocoder::{
    Coordinate, GeocoderConfig, GeocoderEngine, GeocodingProvider, OutcomeStatus, ProviderChain,
    ProviderError, ResolutionMethod,
};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn nominatim_parses_string_coordinates() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method("GET"),
            request::path("/nominatim/search"),
            request::query(url_decoded(contains(("q", "Rua Sete, Vitória")))),
            request::query(url_decoded(contains(("format", "json")))),
        ])
        .respond_with(json_encoded(json!([
            { "lat": "-20.3194", "lon": "-40.3378", "display_name": "Rua Sete" }
        ]))),
    );

    let provider =
        NominatimProvider::new(&server.url_str("/nominatim"), "registry-geocoder-tests").unwrap();
    let coordinate = provider.geocode("Rua Sete, Vitória", TIMEOUT).await.unwrap();
    assert_eq!(coordinate, Some(Coordinate::new(-20.3194, -40.3378)));
}

#[tokio::test]
async fn photon_reads_lon_lat_geometry() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method("GET"),
            request::path("/photon/api/"),
        ])
        .respond_with(json_encoded(json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": { "type": "Point", "coordinates": [-40.29, -20.33] },
                "properties": {}
            }]
        }))),
    );

    let provider = PhotonProvider::new(&server.url_str("/photon"), "tests").unwrap();
    let coordinate = provider.geocode("29015-000", TIMEOUT).await.unwrap();
    assert_eq!(coordinate, Some(Coordinate::new(-20.33, -40.29)));
}

#[tokio::test]
async fn arcgis_empty_candidates_is_no_match() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::path("/arcgis/findAddressCandidates"))
            .respond_with(json_encoded(json!({ "candidates": [] }))),
    );

    let provider = ArcGisProvider::new(&server.url_str("/arcgis"), "tests").unwrap();
    assert_eq!(provider.geocode("nowhere", TIMEOUT).await.unwrap(), None);
}

#[tokio::test]
async fn google_quota_errors_are_retryable() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::path("/google/json"),
            request::query(url_decoded(contains(("key", "test-key")))),
        ])
        .respond_with(json_encoded(json!({
            "status": "OVER_QUERY_LIMIT",
            "results": []
        }))),
    );

    let provider = GoogleProvider::new(
        &server.url_str("/google"),
        "tests",
        SecretString::from("test-key".to_string()),
    )
    .unwrap();
    let err = provider.geocode("Vitória", TIMEOUT).await.unwrap_err();
    assert!(matches!(err, ProviderError::Unavailable(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn service_unavailable_maps_to_retryable_error() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::path("/nominatim/search")).respond_with(status_code(503)),
    );

    let provider = NominatimProvider::new(&server.url_str("/nominatim"), "tests").unwrap();
    let err = provider.geocode("Vitória", TIMEOUT).await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn batch_run_against_http_provider_falls_back_to_postal_code() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::path("/nominatim/search"),
            request::query(url_decoded(contains((
                "q",
                "RUA, SETE DE SETEMBRO, 100, CENTRO, Espírito Santo, Brasil"
            )))),
        ])
        .respond_with(json_encoded(json!([{ "lat": "-20.3194", "lon": "-40.3378" }]))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::path("/nominatim/search"),
            request::query(url_decoded(contains((
                "q",
                "AVENIDA, INEXISTENTE, Espírito Santo, Brasil"
            )))),
        ])
        .times(2)
        .respond_with(json_encoded(json!([]))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::path("/nominatim/search"),
            request::query(url_decoded(contains(("q", "29050-120, Espírito Santo, Brasil")))),
        ])
        .respond_with(json_encoded(json!([{ "lat": "-20.30", "lon": "-40.29" }]))),
    );

    let config = GeocoderConfig {
        max_retries: 2,
        backoff_unit_ms: 1,
        rate_limit_ms: 0,
        cache_file: None,
        ..GeocoderConfig::default()
    };
    let provider: Arc<dyn GeocodingProvider> =
        Arc::new(NominatimProvider::new(&server.url_str("/nominatim"), "tests").unwrap());
    let engine =
        GeocoderEngine::with_providers(config, ProviderChain::new(vec![provider]), None).unwrap();

    let input = "V14,V15,V16,V18,V19\n\
        RUA,SETE DE SETEMBRO,100,CENTRO,29015-000\n\
        AVENIDA,INEXISTENTE,S/N,,29050.120\n";
    let mut dataset = load_csv(input.as_bytes()).unwrap();
    let summary = engine.controller().run(&mut dataset).await.unwrap();

    assert_eq!(summary.stats.success, 1);
    assert_eq!(summary.stats.postal_fallback, 1);
    let fallback = dataset.result(1).unwrap();
    assert_eq!(
        fallback.method,
        ResolutionMethod::PostalProvider("Nominatim".into())
    );
    assert_eq!(fallback.status, OutcomeStatus::Success);
    assert_eq!(engine.cache().len(), 2);
}
