use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::{debug, info};

use crate::errors::{AppError, AppResult};
use crate::model::{AddressRecord, Dataset};

pub const FULL_ADDRESS_COLUMN: &str = "endereco_completo";
const STREET_TYPE: &str = "V14";
const STREET_NAME: &str = "V15";
const STREET_NUMBER: &str = "V16";
const DISTRICT: &str = "V18";
const MISSING_NUMBERS: [&str; 3] = ["S/N", "SN", "NAN"];

/// Trailer appended to composed addresses.
pub const REGION_SUFFIX: &str = ", Espírito Santo, Brasil";

pub fn clean_header(raw: &str) -> String {
    raw.trim()
        .trim_matches('"')
        .trim_matches('\'')
        .trim()
        .to_string()
}

pub fn clean_value(raw: &str) -> String {
    let value = raw.trim().trim_matches('"').trim_matches('\'').trim();
    if value.eq_ignore_ascii_case("nan") {
        String::new()
    } else {
        value.to_string()
    }
}

/// Builds `V14, V15, V16, V18, Espírito Santo, Brasil` from the registry
/// columns, skipping blanks and placeholder house numbers.
pub fn compose_address(fields: &[(String, String)]) -> Option<String> {
    let lookup = |name: &str| {
        fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
    };

    let mut parts: Vec<String> = Vec::with_capacity(4);
    if let Some(kind) = lookup(STREET_TYPE) {
        parts.push(kind.to_string());
    }
    if let Some(street) = lookup(STREET_NAME) {
        parts.push(street.to_string());
    }
    if let Some(number) = lookup(STREET_NUMBER) {
        let number = number.to_uppercase();
        if !MISSING_NUMBERS.contains(&number.as_str()) {
            parts.push(number);
        }
    }
    if let Some(district) = lookup(DISTRICT) {
        parts.push(district.to_string());
    }

    if parts.is_empty() {
        None
    } else {
        Some(format!("{}{}", parts.join(", "), REGION_SUFFIX))
    }
}

struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<(String, String)>>,
}

fn read_table<R: Read>(reader: R) -> AppResult<Table> {
    let mut csv_reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let columns: Vec<String> = csv_reader.headers()?.iter().map(clean_header).collect();
    if columns.iter().all(String::is_empty) {
        return Err(AppError::Parse("input has no header row".into()));
    }

    let mut rows = Vec::new();
    for row in csv_reader.records() {
        let row = row?;
        let fields = columns
            .iter()
            .enumerate()
            .map(|(index, column)| {
                (
                    column.clone(),
                    row.get(index).map(clean_value).unwrap_or_default(),
                )
            })
            .collect();
        rows.push(fields);
    }
    Ok(Table { columns, rows })
}

fn build_dataset(mut columns: Vec<String>, rows: Vec<Vec<(String, String)>>) -> Dataset {
    let has_full_address = columns.iter().any(|c| c == FULL_ADDRESS_COLUMN);
    if !has_full_address {
        columns.push(FULL_ADDRESS_COLUMN.to_string());
    }

    let mut composed = 0usize;
    let records = rows
        .into_iter()
        .map(|mut fields| {
            let provided = fields
                .iter()
                .find(|(key, _)| key == FULL_ADDRESS_COLUMN)
                .map(|(_, value)| value.clone())
                .filter(|value| !value.is_empty());
            let address = match provided {
                Some(value) => Some(value),
                None => {
                    let built = compose_address(&fields);
                    if built.is_some() {
                        composed += 1;
                    }
                    built
                }
            };
            match fields.iter_mut().find(|(key, _)| key == FULL_ADDRESS_COLUMN) {
                Some((_, value)) => *value = address.clone().unwrap_or_default(),
                None => fields.push((
                    FULL_ADDRESS_COLUMN.to_string(),
                    address.clone().unwrap_or_default(),
                )),
            }
            AddressRecord::new(address, fields)
        })
        .collect::<Vec<_>>();

    debug!(records = records.len(), composed, "addresses prepared");
    Dataset::new(columns, records)
}

pub fn load_csv<R: Read>(reader: R) -> AppResult<Dataset> {
    let table = read_table(reader)?;
    Ok(build_dataset(table.columns, table.rows))
}

pub fn load_csv_path(path: &Path) -> AppResult<Dataset> {
    let dataset = load_csv(File::open(path)?)?;
    info!(path = %path.display(), records = dataset.len(), "dataset loaded");
    Ok(dataset)
}

/// Concatenates several exports into one dataset. Columns are the union in
/// first-seen order; rows missing a column get an empty value.
pub fn load_csv_paths<P: AsRef<Path>>(paths: &[P]) -> AppResult<Dataset> {
    let mut columns: Vec<String> = Vec::new();
    let mut rows = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let table = read_table(File::open(path)?)?;
        debug!(path = %path.display(), rows = table.rows.len(), "input file read");
        for column in table.columns {
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        rows.extend(table.rows);
    }

    let rows = rows
        .into_iter()
        .map(|fields| {
            columns
                .iter()
                .map(|column| {
                    let value = fields
                        .iter()
                        .find(|(key, _)| key == column)
                        .map(|(_, value)| value.clone())
                        .unwrap_or_default();
                    (column.clone(), value)
                })
                .collect()
        })
        .collect();

    let dataset = build_dataset(columns, rows);
    info!(files = paths.len(), records = dataset.len(), "datasets combined");
    Ok(dataset)
}
