//! CSV record supply: header row names the field keys.

use crate::error::Result;
use crate::record::FieldValueRecord;
use crate::template::TemplateLayout;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Parsing options for record files.
#[derive(Debug, Clone)]
pub struct CsvOptions {
    pub delimiter: u8,
    /// Values injected into every row, replacing the column if present.
    pub overrides: Vec<(String, String)>,
    /// Values for cells that are blank or whose column is missing.
    pub defaults: Vec<(String, String)>,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            overrides: Vec::new(),
            defaults: Vec::new(),
        }
    }
}

impl CsvOptions {
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    pub fn with_default(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.defaults.push((key.into(), value.into()));
        self
    }
}

/// Reads one record per data row.
///
/// Cells are trimmed, blank rows skipped, unknown columns kept (and later
/// ignored by rendering), and declared keys the file lacks become "".
pub fn read_records<R: Read>(
    reader: R,
    template: &TemplateLayout,
    options: &CsvOptions,
) -> Result<Vec<FieldValueRecord>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(options.delimiter)
        .has_headers(true)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers = csv_reader.headers()?.clone();
    let mut records = Vec::new();
    for row in csv_reader.records() {
        let row = row?;
        if row.iter().all(str::is_empty) {
            continue;
        }
        let mut record = FieldValueRecord::from_pairs(
            headers
                .iter()
                .zip(row.iter())
                .filter(|(key, _)| !key.is_empty()),
        );
        for (key, value) in &options.overrides {
            record.set(key.as_str(), value.as_str());
        }
        for (key, value) in &options.defaults {
            record = record.with_default(key, value.as_str());
        }
        records.push(record.conform(template));
    }
    log::debug!("read {} record(s) with columns {:?}", records.len(), headers);
    Ok(records)
}

pub fn read_records_from_path(
    path: impl AsRef<Path>,
    template: &TemplateLayout,
    options: &CsvOptions,
) -> Result<Vec<FieldValueRecord>> {
    let file = File::open(path.as_ref())?;
    read_records(BufReader::new(file), template, options)
}
