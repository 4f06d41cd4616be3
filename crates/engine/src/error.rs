//! Error taxonomy for the decision engine.
//!
//! Configuration errors are fatal at construction time. Forecast errors are
//! recovered inside a control cycle (fail-safe to no irrigation). Solver
//! errors are surfaced per step and counted in the run report.

use std::time::Duration;

use thiserror::Error;
use time::PrimitiveDateTime;

use crate::params::Location;

pub type EngineResult<T> = Result<T, EngineError>;

/// Invalid static configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// One or more parameter violations, all collected before failing.
    #[error(
        "invalid configuration ({}):\n  - {}",
        error_count(.violations),
        .violations.join("\n  - ")
    )]
    Invalid { violations: Vec<String> },

    #[error("unknown trajectory preset {0} (only 1, 2 or 3 are defined)")]
    UnknownTrajectory(u8),

    #[error("unknown location {0} (only 1 or 2 are defined)")]
    UnknownLocation(u8),
}

fn error_count(violations: &[String]) -> String {
    match violations.len() {
        1 => "1 error".to_string(),
        n => format!("{n} errors"),
    }
}

impl ConfigError {
    /// `Ok(())` when `violations` is empty, otherwise an `Invalid` error.
    pub(crate) fn check(violations: Vec<String>) -> Result<(), ConfigError> {
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { violations })
        }
    }
}

/// Failures of the forecast collaborator or of a lookup into its payload.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ForecastError {
    #[error("forecast unavailable for {location}: {reason}")]
    Unavailable { location: Location, reason: String },

    #[error("no forecast sample for {timestamp}")]
    Lookup { timestamp: PrimitiveDateTime },

    #[error("forecast contains no samples")]
    Empty,

    #[error("malformed forecast payload: {what}")]
    Malformed { what: String },
}

/// Failures of one horizon solve.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SolverError {
    #[error("problem setup error: {what}")]
    ProblemSetup { what: String },

    #[error("convergence failed: {what}")]
    ConvergenceFailed { what: String },

    #[error("solver exceeded its time budget after {iterations} iterations ({elapsed:?})")]
    Timeout { iterations: usize, elapsed: Duration },

    #[error("numeric error: {what}")]
    Numeric { what: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Forecast(#[from] ForecastError),

    #[error(transparent)]
    Solver(#[from] SolverError),
}
