//! Custom error types for the frontend.
//!
//! `DaqError` is the single error type shared by the driver, the equipment
//! adapter and the supporting layers. Transport implementations report
//! failures with `anyhow`; the driver session folds those into
//! [`DaqError::TransportFailure`] so nothing above the driver sees raw I/O
//! errors.
//!
//! ## Error Hierarchy
//!
//! - **`TransportFailure`**: a query or write could not complete. Non-fatal;
//!   whether it reaches the caller depends on the session's fault policy.
//! - **`UnsupportedModel`**: no driver exists for the requested model. Fatal at
//!   construction.
//! - **`IdentificationMismatch`**: the connected instrument reports another
//!   model. Fatal at startup.
//! - **`DuplicateInstance`**: another process already runs the same equipment.
//!   Fatal at startup.
//! - **`InstrumentDiagnostic`**: the instrument returned a nonzero error code
//!   after a write. Reported to the operator, never fatal.
//! - **`InvalidValue`**: a setter received input outside its accepted domain.
//!   No write is issued.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport failure on '{command}': {reason}")]
    TransportFailure { command: String, reason: String },

    #[error("Unsupported instrument model '{0}'")]
    UnsupportedModel(String),

    #[error("Expected model '{expected}' on {port}, instrument reported '{found}'")]
    IdentificationMismatch {
        expected: String,
        found: String,
        port: String,
    },

    #[error("{0} already running, please change frontend index")]
    DuplicateInstance(String),

    #[error("Instrument error {code}: {line}")]
    InstrumentDiagnostic { code: i32, line: String },

    #[error("Invalid value '{value}' for parameter '{parameter}'")]
    InvalidValue { parameter: String, value: String },

    #[error("Shape '{0}' is not in the instrument shape list")]
    UnknownShape(String),

    #[error("Failed to parse '{response}' returned by '{command}'")]
    Parse { command: String, response: String },

    #[error("Parameter store error: {0}")]
    Store(String),

    #[error("File watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// True for errors that must stop the frontend during startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DaqError::UnsupportedModel(_)
                | DaqError::IdentificationMismatch { .. }
                | DaqError::DuplicateInstance(_)
                | DaqError::SerialFeatureDisabled
                | DaqError::Config(_)
                | DaqError::Configuration(_)
        )
    }
}
