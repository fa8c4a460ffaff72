//! Error types for the audit log engine.

use crate::output::OutputError;
use thiserror::Error;

/// Errors surfaced by the engine and its configuration surface.
///
/// A record that does not fit the caller's buffer is not an error; see
/// [`RequiredSize`](crate::record::RequiredSize).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// An account list was set while the opposite list is still active.
    #[error("cannot set {requested} while {active} is not empty")]
    ConflictingAccountFilter {
        requested: &'static str,
        active: &'static str,
    },

    /// An account pattern could not be compiled.
    #[error("invalid account pattern '{0}'")]
    InvalidAccount(String),

    /// The configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unknown character set name.
    #[error("unknown character set '{0}'")]
    UnknownCharset(String),

    /// The sink rejected a record.
    #[error("output error: {0}")]
    Output(#[from] OutputError),

    /// A record still did not fit after the scratch buffer was grown.
    #[error("record requires {required} bytes and could not be rendered")]
    Render { required: usize },
}

pub type Result<T> = std::result::Result<T, AuditError>;
