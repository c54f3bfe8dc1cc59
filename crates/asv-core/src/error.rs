//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A request was rejected before touching any data.
    ///
    /// Surfaced to callers verbatim and never retried.
    #[error("{message}")]
    Validation { message: String },

    /// A date field could not be parsed as `YYYY-MM-DD`.
    #[error("Invalid {field}: {value} (expected YYYY-MM-DD)")]
    InvalidDate { field: String, value: String },

    /// Invalid field value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },

    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

impl DomainError {
    /// Creates a validation error with the given message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Returns true for errors caused by caller input rather than data.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::InvalidDate { .. } | Self::InvalidFieldValue { .. }
        )
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_displays_message_verbatim() {
        let err = DomainError::validation("at least one filter is required");
        assert_eq!(err.to_string(), "at least one filter is required");
        assert!(err.is_validation());
    }

    #[test]
    fn test_invalid_date_display() {
        let err = DomainError::InvalidDate {
            field: "date_from".to_string(),
            value: "06/01/2024".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid date_from: 06/01/2024 (expected YYYY-MM-DD)"
        );
    }

    #[test]
    fn test_parse_error_is_not_validation() {
        let err = DomainError::ParseError {
            field: "record".to_string(),
            reason: "eof".to_string(),
        };
        assert!(!err.is_validation());
    }
}
