use thiserror::Error;

use crate::record::FieldViolation;

pub type Result<T> = std::result::Result<T, CertError>;

#[derive(Debug, Error)]
pub enum CertError {
    /// One or more records break the template's field-length policy.
    #[error("{}", join_violations(.0))]
    Validation(Vec<FieldViolation>),
    #[error("record is missing declared field \"{0}\"")]
    MissingField(String),
    #[error("stage element not found: {0}")]
    MissingStageElement(String),
    /// The calling thread already holds this host's stage.
    #[error("offscreen stage is already leased by this thread")]
    StageLeased,
    #[error("capture produced an empty bitmap")]
    EmptyCapture,
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("asset error: {0}")]
    Asset(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("template json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CertError {
    /// Violations carried by a validation failure, empty for every other kind.
    pub fn violations(&self) -> &[FieldViolation] {
        match self {
            CertError::Validation(list) => list,
            _ => &[],
        }
    }
}

fn join_violations(list: &[FieldViolation]) -> String {
    list.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}
