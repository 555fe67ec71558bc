use std::fmt;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Rectangular lat/lon region used to reject results from the wrong geography.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn contains(&self, coordinate: Coordinate) -> bool {
        (self.min_lat..=self.max_lat).contains(&coordinate.lat)
            && (self.min_lon..=self.max_lon).contains(&coordinate.lon)
    }
}

/// One input row. Fields keep their original column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub full_address: Option<String>,
    fields: Vec<(String, String)>,
}

impl AddressRecord {
    pub fn new(full_address: Option<String>, fields: Vec<(String, String)>) -> Self {
        Self {
            full_address: full_address
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "provider")]
pub enum ResolutionMethod {
    AddressProvider(String),
    PostalProvider(String),
    CacheHit(String),
    NoAddress,
    NoPostalCode,
    InvalidPostalCode,
    AllProvidersFailed,
    TransientError,
}

impl ResolutionMethod {
    /// Operator-facing label written into the `geocoding_method` column.
    pub fn label(&self) -> String {
        match self {
            ResolutionMethod::AddressProvider(name) => name.clone(),
            ResolutionMethod::PostalProvider(name) => format!("CEP-{name}"),
            ResolutionMethod::CacheHit(name) => name.clone(),
            ResolutionMethod::NoAddress => "Sem CEP".into(),
            ResolutionMethod::NoPostalCode => "CEP".into(),
            ResolutionMethod::InvalidPostalCode => "CEP inválido".into(),
            ResolutionMethod::AllProvidersFailed => "Múltiplos provedores".into(),
            ResolutionMethod::TransientError => "Erro".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    Success,
    Cache,
    Failed,
    Error,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "Sucesso",
            OutcomeStatus::Cache => "Cache",
            OutcomeStatus::Failed => "Falhou",
            OutcomeStatus::Error => "Erro",
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, OutcomeStatus::Success | OutcomeStatus::Cache)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    coordinate: Option<Coordinate>,
    pub method: ResolutionMethod,
    pub status: OutcomeStatus,
}

impl GeocodeResult {
    pub fn resolved(coordinate: Coordinate, method: ResolutionMethod, status: OutcomeStatus) -> Self {
        Self {
            coordinate: Some(coordinate),
            method,
            status,
        }
    }

    pub fn failed(method: ResolutionMethod) -> Self {
        Self {
            coordinate: None,
            method,
            status: OutcomeStatus::Failed,
        }
    }

    pub fn error() -> Self {
        Self {
            coordinate: None,
            method: ResolutionMethod::TransientError,
            status: OutcomeStatus::Error,
        }
    }

    pub fn coordinate(&self) -> Option<Coordinate> {
        self.coordinate
    }

    pub fn latitude(&self) -> Option<f64> {
        self.coordinate.map(|c| c.lat)
    }

    pub fn longitude(&self) -> Option<f64> {
        self.coordinate.map(|c| c.lon)
    }

    pub fn is_postal_fallback(&self) -> bool {
        matches!(self.method, ResolutionMethod::PostalProvider(_))
    }
}

/// Tabular input plus one result slot per record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    columns: Vec<String>,
    records: Vec<AddressRecord>,
    results: Vec<Option<GeocodeResult>>,
    fingerprint: String,
}

impl Dataset {
    pub fn new(columns: Vec<String>, records: Vec<AddressRecord>) -> Self {
        let fingerprint = fingerprint(&columns, &records);
        let results = vec![None; records.len()];
        Self {
            columns,
            records,
            results,
            fingerprint,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, index: usize) -> Option<&AddressRecord> {
        self.records.get(index)
    }

    pub fn result(&self, index: usize) -> Option<&GeocodeResult> {
        self.results.get(index).and_then(Option::as_ref)
    }

    pub fn rows(&self) -> impl Iterator<Item = (&AddressRecord, Option<&GeocodeResult>)> {
        self.records
            .iter()
            .zip(self.results.iter().map(Option::as_ref))
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub(crate) fn set_result(&mut self, index: usize, result: GeocodeResult) {
        if let Some(slot) = self.results.get_mut(index) {
            *slot = Some(result);
        }
    }

    pub(crate) fn clear_results(&mut self) {
        self.results.iter_mut().for_each(|slot| *slot = None);
    }

    /// Copies the first `upto` result slots from a snapshot of the same data.
    pub(crate) fn adopt_results(&mut self, snapshot: &Dataset, upto: usize) {
        self.clear_results();
        for (slot, saved) in self
            .results
            .iter_mut()
            .zip(snapshot.results.iter())
            .take(upto)
        {
            *slot = saved.clone();
        }
    }
}

fn fingerprint(columns: &[String], records: &[AddressRecord]) -> String {
    let mut hasher = Sha256::new();
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update([0x1f]);
    }
    for record in records {
        hasher.update([0x1e]);
        if let Some(address) = &record.full_address {
            hasher.update(address.as_bytes());
        }
        for (key, value) in &record.fields {
            hasher.update(key.as_bytes());
            hasher.update([0x1f]);
            hasher.update(value.as_bytes());
        }
    }
    STANDARD_NO_PAD.encode(hasher.finalize())
}
