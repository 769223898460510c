//! Error taxonomy for the retrieval engine.
//!
//! Application code propagates `anyhow::Error`; the variants of [`KbError`]
//! are attached at the points where a condition becomes classifiable, and
//! callers recover the machine-readable [`ErrorKind`] with
//! [`ErrorKind::of`], which walks the error chain.
//!
//! | Kind | Handling |
//! |------|----------|
//! | `schema_mismatch` | Handled inline: triggers a full rebuild |
//! | `unreachable` | Rebuild drops/keeps the record; reindex surfaces it |
//! | `provider_unavailable` | Surfaced with a configuration hint |
//! | `lock_timeout` | Surfaced as retryable |
//! | `partial_failure` | Reported per source inside a successful result |

use serde::Serialize;
use std::time::Duration;

/// Typed failure conditions recognised across the engine.
#[derive(Debug, thiserror::Error)]
pub enum KbError {
    /// Stored vectors do not match the active embedding model's dimensionality.
    #[error("vector table schema mismatch: table has {table_dims} dims, model produces {model_dims}")]
    SchemaMismatch { table_dims: usize, model_dims: usize },

    /// The backing file or URL is gone or could not be fetched/parsed.
    #[error("source unreachable: {identifier}: {message}")]
    Unreachable { identifier: String, message: String },

    /// The embedding or translation backend could not be reached.
    #[error("provider unavailable: {0} (check the [embedding] / [translation] configuration)")]
    ProviderUnavailable(String),

    /// A structural mutation could not acquire the operation lock in time.
    #[error("operation '{op}' timed out after {waited:?} waiting for lock '{lock_id}'")]
    LockTimeout {
        op: String,
        lock_id: String,
        waited: Duration,
    },

    /// The lock was force-released while this caller was queued.
    #[error("lock '{lock_id}' was force-released while '{op}' was waiting")]
    LockReleased { op: String, lock_id: String },

    /// Every source in a multi-source request failed.
    #[error("all {failed} sources failed")]
    PartialFailure { failed: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SchemaMismatch,
    Unreachable,
    ProviderUnavailable,
    LockTimeout,
    LockReleased,
    PartialFailure,
    InvalidInput,
    NotFound,
    Internal,
}

impl ErrorKind {
    /// Classify an error by the first [`KbError`] found in its chain.
    pub fn of(err: &anyhow::Error) -> Self {
        err.chain()
            .find_map(|e| e.downcast_ref::<KbError>())
            .map(KbError::kind)
            .unwrap_or(ErrorKind::Internal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SchemaMismatch => "schema_mismatch",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::LockTimeout => "lock_timeout",
            ErrorKind::LockReleased => "lock_released",
            ErrorKind::PartialFailure => "partial_failure",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::LockTimeout | ErrorKind::LockReleased | ErrorKind::ProviderUnavailable
        )
    }
}

impl KbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KbError::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            KbError::Unreachable { .. } => ErrorKind::Unreachable,
            KbError::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            KbError::LockTimeout { .. } => ErrorKind::LockTimeout,
            KbError::LockReleased { .. } => ErrorKind::LockReleased,
            KbError::PartialFailure { .. } => ErrorKind::PartialFailure,
            KbError::InvalidInput(_) => ErrorKind::InvalidInput,
            KbError::NotFound(_) => ErrorKind::NotFound,
        }
    }
}

/// Shorthand for `ErrorKind::of(err) == ErrorKind::SchemaMismatch`.
pub fn is_schema_mismatch(err: &anyhow::Error) -> bool {
    ErrorKind::of(err) == ErrorKind::SchemaMismatch
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_survives_context_wrapping() {
        let err: anyhow::Error = KbError::SchemaMismatch {
            table_dims: 384,
            model_dims: 768,
        }
        .into();
        let wrapped = Err::<(), _>(err)
            .context("writing batch 3")
            .unwrap_err();
        assert_eq!(ErrorKind::of(&wrapped), ErrorKind::SchemaMismatch);
        assert!(is_schema_mismatch(&wrapped));
    }

    #[test]
    fn plain_errors_are_internal() {
        let err = anyhow::anyhow!("disk on fire");
        assert_eq!(ErrorKind::of(&err), ErrorKind::Internal);
        assert!(!ErrorKind::Internal.is_retryable());
    }

    #[test]
    fn lock_timeout_is_retryable() {
        let err: anyhow::Error = KbError::LockTimeout {
            op: "rebuild".into(),
            lock_id: "global".into(),
            waited: Duration::from_millis(10),
        }
        .into();
        let kind = ErrorKind::of(&err);
        assert_eq!(kind.as_str(), "lock_timeout");
        assert!(kind.is_retryable());
    }
}
