use thiserror::Error;
use uuid::Uuid;

/// Error taxonomy for billing and fiscal operations.
///
/// Each variant tells the caller whether retrying makes sense:
/// only `Transient` errors are retried by the job runner.
#[derive(Debug, Error)]
pub enum BillingError {
    /// Bad input shape, rejected immediately.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// Duplicate conversion or number collision. The whole operation may be retried.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation not permitted in the current status.
    #[error("{0}")]
    State(String),

    /// Store or network hiccup.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Missing or invalid certificate/configuration. Needs an operator.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The fiscal authority rejected the document.
    #[error("rejected by fiscal authority for invoice {invoice_id}: {}", messages.join("; "))]
    ExternalRejection {
        invoice_id: Uuid,
        messages: Vec<String>,
    },
}

pub type BillingResult<T> = Result<T, BillingError>;

impl BillingError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        BillingError::NotFound { entity, id }
    }

    pub fn state(msg: impl Into<String>) -> Self {
        BillingError::State(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        BillingError::Validation(msg.into())
    }

    /// Whether a job runner should retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Transient(_))
    }

    /// Short machine-friendly kind, used in logs and job records.
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::Validation(_) => "validation",
            BillingError::NotFound { .. } => "not_found",
            BillingError::Conflict(_) => "conflict",
            BillingError::State(_) => "state",
            BillingError::Transient(_) => "transient",
            BillingError::Configuration(_) => "configuration",
            BillingError::ExternalRejection { .. } => "external_rejection",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(ref db_err) => match db_err.code().as_deref() {
                Some("23505") => BillingError::Conflict(db_err.message().to_string()),
                // lock_not_available, serialization_failure, deadlock_detected
                Some("55P03") | Some("40001") | Some("40P01") => {
                    BillingError::Transient(db_err.message().to_string())
                }
                Some("23503") => BillingError::State(format!(
                    "operation blocked by a referencing record: {}",
                    db_err.message()
                )),
                _ => BillingError::Transient(err.to_string()),
            },
            sqlx::Error::RowNotFound => {
                BillingError::Validation("referenced row does not exist".to_string())
            }
            other => BillingError::Transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Validation(format!("malformed payload: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(BillingError::Transient("timeout".into()).is_retryable());
        assert!(!BillingError::Configuration("no cert".into()).is_retryable());
        assert!(!BillingError::Conflict("dup".into()).is_retryable());
        assert!(!BillingError::state("cannot edit a paid invoice").is_retryable());
    }

    #[test]
    fn test_state_error_keeps_operator_message() {
        let err = BillingError::state("cannot edit a paid invoice");
        assert_eq!(err.to_string(), "cannot edit a paid invoice");
    }

    #[test]
    fn test_rejection_lists_messages() {
        let err = BillingError::ExternalRejection {
            invoice_id: Uuid::nil(),
            messages: vec!["RUC invalido".into(), "firma invalida".into()],
        };
        assert!(err.to_string().contains("RUC invalido; firma invalida"));
        assert_eq!(err.kind(), "external_rejection");
    }
}
