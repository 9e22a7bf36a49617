//! Unified error types for the marketplace core.
//!
//! Every fallible operation returns [`Result`]. The UI layer never sees a raw
//! [`Error`]: [`Outcome`] turns a result into the `{success, message}` object
//! the screens render.

use sea_orm::DbErr;
use serde::Serialize;
use thiserror::Error;

/// All failure modes of the marketplace core.
#[derive(Debug, Error)]
pub enum Error {
    /// Database query or write failed for a non-transient reason
    #[error("Database error: {0}")]
    Database(DbErr),

    /// Backing store could not be reached; read subscriptions retry on this
    #[error("Backend unavailable: {message}")]
    BackendUnavailable {
        /// Description of the connectivity failure
        message: String,
    },

    /// Settings file missing, unreadable or malformed
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem
        message: String,
    },

    /// Operation requires a signed-in principal
    #[error("No active session")]
    NoActiveSession,

    /// An entity id did not resolve
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity that was looked up
        entity: &'static str,
        /// The id that did not resolve
        id: String,
    },

    /// Role or ownership check failed
    #[error("Permission denied: {message}")]
    PermissionDenied {
        /// Which check failed
        message: String,
    },

    /// Spend exceeds the current points balance
    #[error("You need {} more points", required - available)]
    InsufficientBalance {
        /// Current balance
        available: i64,
        /// Points the operation needs
        required: i64,
    },

    /// Bounded voucher stock is exhausted
    #[error("Voucher out of stock: {voucher_id}")]
    OutOfStock {
        /// Catalog id of the voucher
        voucher_id: String,
    },

    /// Catalog entry exists but is switched off
    #[error("Voucher not available: {voucher_id}")]
    VoucherInactive {
        /// Catalog id of the voucher
        voucher_id: String,
    },

    /// Operation was already performed or is still cooling down
    #[error("{message}")]
    AlreadyProcessed {
        /// What was already done
        message: String,
    },

    /// Malformed input
    #[error("{message}")]
    Validation {
        /// Which rule the input broke
        message: String,
    },

    /// A guarded write was rejected after validation passed
    #[error("Processing error: {message}")]
    Processing {
        /// What could not be completed
        message: String,
    },

    /// The live snapshot stream was torn down
    #[error("Subscription closed: {key}")]
    SubscriptionClosed {
        /// Resource key of the subscription
        key: String,
    },

    /// A live snapshot failed to load for a non-transient reason
    #[error("Could not load {key}: {message}")]
    SubscriptionFailed {
        /// Resource key of the subscription
        key: String,
        /// Description of the load failure
        message: String,
    },

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DbErr> for Error {
    fn from(err: DbErr) -> Self {
        match err {
            DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => Self::BackendUnavailable {
                message: err.to_string(),
            },
            other => Self::Database(other),
        }
    }
}

impl Error {
    /// Convenience constructor for validation failures.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Convenience constructor for lookups that did not resolve.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Whether the failure is transient and a read may be retried.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}

/// Convenience `Result` type
pub type Result<T> = std::result::Result<T, Error>;

/// Result object handed to the UI layer.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome<T> {
    /// Whether the operation succeeded
    pub success: bool,
    /// Human-readable message for the user
    pub message: String,
    /// Payload on success
    pub data: Option<T>,
}

impl<T> Outcome<T> {
    /// Successful outcome with a payload.
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Failed outcome carrying the error's message.
    pub fn failed(error: &Error) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            data: None,
        }
    }

    /// Converts a result, logging failures that are not plain user mistakes.
    pub fn from_result(result: Result<T>, success_message: impl Into<String>) -> Self {
        match result {
            Ok(data) => Self::ok(success_message, data),
            Err(e) => {
                if matches!(
                    e,
                    Error::Database(_) | Error::BackendUnavailable { .. } | Error::Processing { .. }
                ) {
                    tracing::error!("Operation failed: {}", e);
                }
                Self::failed(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_balance_reports_shortfall() {
        let err = Error::InsufficientBalance {
            available: 120,
            required: 500,
        };
        assert_eq!(err.to_string(), "You need 380 more points");
    }

    #[test]
    fn test_connection_errors_are_transient() {
        let err: Error = DbErr::Conn(sea_orm::RuntimeErr::Internal("down".to_string())).into();
        assert!(err.is_transient());

        let err: Error = DbErr::RecordNotFound("x".to_string()).into();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_outcome_from_validation_error() {
        let outcome: Outcome<()> =
            Outcome::from_result(Err(Error::validation("Rating must be between 1 and 5")), "ok");
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Rating must be between 1 and 5");
        assert!(outcome.data.is_none());
    }
}
