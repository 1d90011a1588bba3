//! Error types shared by the engine, the store and the thin surfaces.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::cidr::CidrError;

/// Broad classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Input,
    Constraint,
    ResourceExhausted,
    Authorization,
    Conflict,
    NonExistent,
    Timeout,
    Storage,
}

#[derive(Debug, Error)]
pub enum IpamError {
    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Extraneous input: {0}")]
    ExtraneousInput(String),

    #[error("Invalid input for '{attribute}': {reason}")]
    InvalidInput { attribute: String, reason: String },

    #[error("Unknown attribute '{attribute}' for {entity}")]
    UnknownAttribute { entity: &'static str, attribute: String },

    #[error("No such operator '{0}'")]
    NoSuchOperator(String),

    #[error("Invalid value for '{attribute}': {reason}")]
    InvalidValue { attribute: String, reason: String },

    #[error("{entity} {key} already exists")]
    Duplicate { entity: &'static str, key: String },

    #[error("{entity} {key}: {constraint}")]
    Constraint {
        entity: &'static str,
        key: String,
        constraint: String,
    },

    #[error("No free /{length} found in {source_desc}")]
    NoFreePrefix { length: u8, source_desc: String },

    #[error("{entity} not found: {key}")]
    NonExistent { entity: &'static str, key: String },

    #[error("Principal '{0}' is read-only")]
    ReadOnly(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Concurrent modification of {0}, giving up after retries")]
    Conflict(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Storage error")]
    Storage(#[from] sqlx::Error),

    #[error("Stored row is unreadable: {0}")]
    Corrupt(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IpamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IpamError::MissingInput(_)
            | IpamError::ExtraneousInput(_)
            | IpamError::InvalidInput { .. }
            | IpamError::UnknownAttribute { .. }
            | IpamError::NoSuchOperator(_) => ErrorKind::Input,
            IpamError::InvalidValue { .. }
            | IpamError::Duplicate { .. }
            | IpamError::Constraint { .. } => ErrorKind::Constraint,
            IpamError::NoFreePrefix { .. } => ErrorKind::ResourceExhausted,
            IpamError::ReadOnly(_) | IpamError::Unauthorized(_) => ErrorKind::Authorization,
            IpamError::Conflict(_) => ErrorKind::Conflict,
            IpamError::NonExistent { .. } => ErrorKind::NonExistent,
            IpamError::Timeout(_) => ErrorKind::Timeout,
            IpamError::Storage(_) | IpamError::Corrupt(_) | IpamError::Internal(_) => {
                ErrorKind::Storage
            }
        }
    }

    /// Numeric code for transport layers.
    pub fn code(&self) -> u16 {
        match self {
            IpamError::InvalidInput { .. } | IpamError::UnknownAttribute { .. } => 1100,
            IpamError::MissingInput(_) => 1110,
            IpamError::ExtraneousInput(_) => 1120,
            IpamError::NoSuchOperator(_) => 1130,
            IpamError::InvalidValue { .. } => 1200,
            IpamError::NonExistent { .. } => 1300,
            IpamError::Duplicate { .. } => 1400,
            IpamError::Constraint { .. } | IpamError::NoFreePrefix { .. } => 1500,
            IpamError::ReadOnly(_) | IpamError::Unauthorized(_) => 1600,
            IpamError::Conflict(_) => 1700,
            IpamError::Timeout(_) => 1800,
            IpamError::Storage(_) | IpamError::Corrupt(_) | IpamError::Internal(_) => 1900,
        }
    }

    pub(crate) fn input(attribute: impl Into<String>, reason: impl ToString) -> Self {
        IpamError::InvalidInput {
            attribute: attribute.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn value(attribute: impl Into<String>, reason: impl ToString) -> Self {
        IpamError::InvalidValue {
            attribute: attribute.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn not_found(entity: &'static str, key: impl ToString) -> Self {
        IpamError::NonExistent {
            entity,
            key: key.to_string(),
        }
    }

    pub(crate) fn constraint(entity: &'static str, key: impl ToString, constraint: impl Into<String>) -> Self {
        IpamError::Constraint {
            entity,
            key: key.to_string(),
            constraint: constraint.into(),
        }
    }

    /// Lock or busy errors from SQLite that are worth retrying.
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            IpamError::Storage(sqlx::Error::PoolTimedOut) => true,
            IpamError::Storage(sqlx::Error::Database(db)) => {
                matches!(db.code().as_deref(), Some("5") | Some("6") | Some("517"))
                    || db.message().contains("database is locked")
            }
            _ => false,
        }
    }
}

impl From<CidrError> for IpamError {
    fn from(e: CidrError) -> Self {
        IpamError::input("prefix", e)
    }
}

pub type Result<T, E = IpamError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_and_codes() {
        let e = IpamError::MissingInput("description or node".into());
        assert_eq!(e.kind(), ErrorKind::Input);
        assert_eq!(e.code(), 1110);

        let e = IpamError::Duplicate { entity: "prefix", key: "10.0.0.0/8".into() };
        assert_eq!(e.kind(), ErrorKind::Constraint);
        assert_eq!(e.code(), 1400);
        assert_eq!(e.to_string(), "prefix 10.0.0.0/8 already exists");

        let e = IpamError::NoFreePrefix { length: 24, source_desc: "10.0.0.0/16".into() };
        assert_eq!(e.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn test_storage_message_is_opaque() {
        let e = IpamError::from(sqlx::Error::Configuration("sqlite:/secret/path".into()));
        assert_eq!(e.to_string(), "Storage error");
        assert_eq!(e.kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_cidr_error_is_input() {
        let e: IpamError = "10.0.0.1/8".parse::<crate::cidr::Cidr>().unwrap_err().into();
        assert_eq!(e.kind(), ErrorKind::Input);
        assert!(e.to_string().contains("10.0.0.0/8"));
    }
}
