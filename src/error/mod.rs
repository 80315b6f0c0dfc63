/////////////////////////////////////////////////////////////////////////////////////
//
// SEIR propagation model
//
// error module
//
// configuration errors abort the call that detected them
// numeric degeneracies are not errors: IEEE inf/NaN flow through to the caller
//
////////////////////////////////////////////////////////////////////////////////////

use thiserror::Error;

use crate::parameters::ParameterName;

/// Errors raised by parameter resolution, simulation, fitting and data loading
#[derive(Error, Debug)]
pub enum Error {
    #[error("Missing parameter: {0}")]
    MissingParameter(ParameterName),

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Parameter {0} supplied more than once")]
    DuplicateParameter(ParameterName),

    #[error("Parameter {name} is {found} but the run requires {expected} values")]
    KindMismatch {
        name: ParameterName,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Shape mismatch on {axis}: expected {expected} entries, found {actual}")]
    ShapeMismatch {
        axis: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid dates: {0}")]
    InvalidDates(String),

    #[error("Covariance matrix is not positive definite: {0}")]
    NotPositiveDefinite(String),

    #[error("Zero variance for {0}")]
    ZeroVariance(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] yaml_rust::ScanError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn shape(axis: impl Into<String>, expected: usize, actual: usize) -> Self {
        Error::ShapeMismatch {
            axis: axis.into(),
            expected,
            actual,
        }
    }
}
