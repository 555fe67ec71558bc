use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde_json::{json, Map, Value};
use tracing::info;

use crate::errors::AppResult;
use crate::model::{Dataset, GeocodeResult};

pub const RESULT_COLUMNS: [&str; 4] = [
    "latitude",
    "longitude",
    "geocoding_method",
    "geocoding_status",
];

/// Input columns with duplicate names dropped (first occurrence wins) and
/// result columns removed, so a re-exported file does not grow new copies.
fn output_columns(dataset: &Dataset) -> Vec<&str> {
    let mut seen: Vec<&str> = Vec::new();
    for column in dataset.columns() {
        let column = column.as_str();
        if !seen.contains(&column) && !RESULT_COLUMNS.contains(&column) {
            seen.push(column);
        }
    }
    seen
}

fn result_cells(result: Option<&GeocodeResult>) -> [String; 4] {
    match result {
        Some(result) => [
            result.latitude().map(|v| v.to_string()).unwrap_or_default(),
            result.longitude().map(|v| v.to_string()).unwrap_or_default(),
            result.method.label(),
            result.status.as_str().to_string(),
        ],
        None => Default::default(),
    }
}

pub fn write_csv<W: Write>(dataset: &Dataset, writer: W) -> AppResult<usize> {
    let columns = output_columns(dataset);
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(columns.iter().copied().chain(RESULT_COLUMNS))?;

    let mut rows = 0;
    for (record, result) in dataset.rows() {
        let values = columns
            .iter()
            .map(|column| record.field(column).unwrap_or_default().to_string());
        csv_writer.write_record(values.chain(result_cells(result)))?;
        rows += 1;
    }
    csv_writer.flush()?;
    Ok(rows)
}

pub fn write_csv_path(dataset: &Dataset, path: &Path) -> AppResult<usize> {
    let rows = write_csv(dataset, File::create(path)?)?;
    info!(path = %path.display(), rows, "results exported");
    Ok(rows)
}

/// FeatureCollection of every row that has coordinates.
pub fn to_geojson(dataset: &Dataset) -> Value {
    let columns = output_columns(dataset);
    let features: Vec<Value> = dataset
        .rows()
        .filter_map(|(record, result)| {
            let result = result?;
            let coordinate = result.coordinate()?;
            let mut properties = Map::new();
            for column in &columns {
                properties.insert(
                    column.to_string(),
                    Value::String(record.field(column).unwrap_or_default().to_string()),
                );
            }
            properties.insert("geocoding_method".into(), json!(result.method.label()));
            properties.insert("geocoding_status".into(), json!(result.status.as_str()));
            Some(json!({
                "type": "Feature",
                "geometry": {
                    "type": "Point",
                    "coordinates": [coordinate.lon, coordinate.lat],
                },
                "properties": properties,
            }))
        })
        .collect();

    json!({
        "type": "FeatureCollection",
        "features": features,
    })
}

pub fn write_geojson_path(dataset: &Dataset, path: &Path) -> AppResult<usize> {
    let collection = to_geojson(dataset);
    let features = collection["features"].as_array().map_or(0, Vec::len);
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, &collection)?;
    info!(path = %path.display(), features, "geojson exported");
    Ok(features)
}
