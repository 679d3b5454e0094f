use serde::Serialize;
use std::{borrow::Cow, error::Error as StdError};
use thiserror::Error;

/// Error trait implemented by errors that can be reported to an external
/// monitoring facility under a stable code.
pub trait DetailedError: StdError + Serialize {
    /// Identifying name of the error.
    fn error_code(&self) -> Cow<'static, str>;
}

/// Invalid grouping stage configuration.
///
/// Configuration errors are detected when a stage is constructed, before any
/// record flows through it.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
pub enum ConfigError {
    #[error("at least one key field must be specified")]
    NoKeyFields,

    #[error("key field names must not be empty")]
    EmptyFieldName,

    #[error("key field '{0}' is specified more than once")]
    DuplicateKeyField(String),

    #[error("key field '{field}' does not exist in the upstream schema (available fields: {available:?})")]
    UnknownKeyField {
        field: String,
        available: Vec<String>,
    },

    #[error("invalid value for '{parameter}': {reason}")]
    InvalidParameter {
        parameter: &'static str,
        reason: String,
    },

    #[error("failed to parse grouping configuration: {0}")]
    Parse(String),

    #[error("replica configuration differs from the configuration shared by its sibling replicas")]
    MismatchedReplica,
}

impl DetailedError for ConfigError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::NoKeyFields => Cow::from("NoKeyFields"),
            Self::EmptyFieldName => Cow::from("EmptyFieldName"),
            Self::DuplicateKeyField(_) => Cow::from("DuplicateKeyField"),
            Self::UnknownKeyField { .. } => Cow::from("UnknownKeyField"),
            Self::InvalidParameter { .. } => Cow::from("InvalidParameter"),
            Self::Parse(_) => Cow::from("ConfigParseError"),
            Self::MismatchedReplica => Cow::from("MismatchedReplica"),
        }
    }
}

/// Error returned by [`GroupingOperator::next`](crate::GroupingOperator::next).
#[derive(Debug, Error)]
pub enum StageError<E> {
    /// The upstream source failed; its error is passed through unchanged.
    #[error(transparent)]
    Upstream(E),

    /// The runtime hosting this replica received a kill signal.
    #[error("grouping stage was killed")]
    Killed,
}

impl<E> StageError<E> {
    /// Returns the upstream error, if this is one.
    pub fn into_upstream(self) -> Option<E> {
        match self {
            Self::Upstream(error) => Some(error),
            Self::Killed => None,
        }
    }
}
