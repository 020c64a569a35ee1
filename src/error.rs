use thiserror::Error;

use crate::models::PeriodStatus;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("{0}")]
    Validation(String),

    #[error("Line {line}: {message}")]
    InvalidLine { line: usize, message: String },

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Fiscal period {period} is {status} for book {book}; postings are only accepted into OPEN periods")]
    PeriodNotOpen {
        book: String,
        period: String,
        status: PeriodStatus,
    },

    #[error("Idempotency key '{0}' was already used with a different payload")]
    IdempotencyMismatch(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn line(line: usize, message: impl Into<String>) -> Self {
        Self::InvalidLine {
            line,
            message: message.into(),
        }
    }

    /// HTTP status the API reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::InvalidLine { .. } | Self::Csv(_) => 400,
            Self::Unauthenticated(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) | Self::PeriodNotOpen { .. } | Self::IdempotencyMismatch(_) => 409,
            Self::Db(_) | Self::Io(_) | Self::Settings(_) | Self::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::InvalidLine { .. } | Self::Csv(_) => "VALIDATION_ERROR",
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::PeriodNotOpen { .. } => "PERIOD_NOT_OPEN",
            Self::IdempotencyMismatch(_) => "IDEMPOTENCY_KEY_REUSED",
            Self::Db(_) | Self::Io(_) | Self::Settings(_) | Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn is_internal(&self) -> bool {
        self.status_code() >= 500
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::InvalidLine { line, .. } => serde_json::json!({ "line": line }),
            Self::PeriodNotOpen { book, period, status } => serde_json::json!({
                "book": book,
                "period": period,
                "status": status,
            }),
            _ => serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_not_open_names_status() {
        let err = AppError::PeriodNotOpen {
            book: "LOCAL".to_string(),
            period: "2025-03".to_string(),
            status: PeriodStatus::SoftClosed,
        };
        let msg = err.to_string();
        assert!(msg.contains("SOFT_CLOSED"), "{msg}");
        assert!(msg.contains("2025-03"));
        assert_eq!(err.status_code(), 409);
        assert_eq!(err.code(), "PERIOD_NOT_OPEN");
    }

    #[test]
    fn test_line_error_carries_index() {
        let err = AppError::line(2, "debit and credit are both zero");
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.details()["line"], 2);
        assert!(err.to_string().starts_with("Line 2:"));
    }

    #[test]
    fn test_db_errors_are_internal() {
        let err = AppError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(err.is_internal());
        assert_eq!(err.code(), "INTERNAL");
    }
}
