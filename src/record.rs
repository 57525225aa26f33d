use crate::template::TemplateLayout;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Field key -> value for one certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldValueRecord {
    values: BTreeMap<String, String>,
}

impl FieldValueRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Adds every key `template` declares but this record lacks, as "".
    pub fn conform(mut self, template: &TemplateLayout) -> Self {
        for key in template.record_keys() {
            self.values.entry(key.to_string()).or_default();
        }
        self
    }

    /// Sets `key` to `value` when it is absent or blank.
    pub fn with_default(mut self, key: &str, value: impl Into<String>) -> Self {
        let blank = self.get(key).is_none_or(|v| v.trim().is_empty());
        if blank {
            self.values.insert(key.to_string(), value.into());
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    TooLong { max: usize, actual: usize },
    Missing,
}

/// One field of one record that breaks the template's field policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    /// 1-based row for batch input, `None` for a single form submission.
    pub row: Option<usize>,
    pub field: String,
    pub kind: ViolationKind,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.row, self.kind) {
            (Some(row), ViolationKind::TooLong { max, .. }) => {
                write!(f, "Row {row}: \"{}\" exceeds {max} chars", self.field)
            }
            (None, ViolationKind::TooLong { max, .. }) => write!(
                f,
                "\"{}\" exceeds the maximum of {max} characters.",
                self.field
            ),
            (Some(row), ViolationKind::Missing) => {
                write!(f, "Row {row}: \"{}\" is missing", self.field)
            }
            (None, ViolationKind::Missing) => write!(f, "\"{}\" is missing", self.field),
        }
    }
}

/// Checks one record against the template's declared keys and max lengths.
///
/// Lengths count characters of the trimmed value.
pub fn validate_record(
    template: &TemplateLayout,
    record: &FieldValueRecord,
    row: Option<usize>,
) -> Vec<FieldViolation> {
    let mut out = Vec::new();
    for field in template.fields.iter().filter(|f| f.is_record()) {
        let Some(value) = record.get(&field.key) else {
            out.push(FieldViolation {
                row,
                field: field.key.clone(),
                kind: ViolationKind::Missing,
            });
            continue;
        };
        if let Some(max) = field.max_len {
            let actual = value.trim().chars().count();
            if actual > max {
                out.push(FieldViolation {
                    row,
                    field: field.key.clone(),
                    kind: ViolationKind::TooLong { max, actual },
                });
            }
        }
    }
    out
}

pub fn validate_batch(template: &TemplateLayout, records: &[FieldValueRecord]) -> Vec<FieldViolation> {
    records
        .iter()
        .enumerate()
        .flat_map(|(index, record)| validate_record(template, record, Some(index + 1)))
        .collect()
}

const MONTHS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// `"Awarded {Month} {year}"` for a 1-based month.
pub fn awarded_date_label(year: i32, month: u32) -> Option<String> {
    let name = MONTHS.get(month.checked_sub(1)? as usize)?;
    Some(format!("Awarded {name} {year}"))
}

/// Label for the current UTC month.
pub fn current_awarded_date_label() -> String {
    let days = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_secs() / 86_400) as i64)
        .unwrap_or(0);
    let (year, month) = year_month_from_days(days);
    awarded_date_label(year, month).unwrap_or_else(|| format!("Awarded {year}"))
}

// Days since 1970-01-01 to a proleptic Gregorian (year, month).
fn year_month_from_days(days: i64) -> (i32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    (year as i32, month as u32)
}
