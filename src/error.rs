//! Error types for thermalcast.
//!
//! Every variant carries a machine-parseable code and a sanitized external
//! message so API consumers never see internal details (file paths, SQL,
//! upstream response bodies).

use std::time::Duration;

use thiserror::Error;

/// Result type alias for thermalcast operations.
pub type Result<T> = std::result::Result<T, Error>;

/// thermalcast error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Reservation denied: the account cannot afford the requested work.
    /// No side effects have occurred; user-correctable by buying credits.
    #[error("Insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: i64, available: i64 },

    /// Denied by the sliding-window rate limiter; user-correctable by waiting.
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// A fetch/generate/deliver step failed after reservation. The pipeline
    /// refunds before surfacing this.
    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Report not found: {0}")]
    ReportNotFound(String),

    /// A required external credential is missing. Fatal at startup, not retried.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::Upstream(_) => "UPSTREAM_FAILURE",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            Error::ReportNotFound(_) => "REPORT_NOT_FOUND",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// HTTP status code for the API layer.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InsufficientCredits { .. } => 403,
            Error::RateLimited { .. } => 429,
            Error::Validation(_) => 400,
            Error::AccountNotFound(_) | Error::ReportNotFound(_) => 404,
            Error::Upstream(_) | Error::Http(_) => 502,
            Error::Config(_)
            | Error::Storage(_)
            | Error::Database(_)
            | Error::Json(_)
            | Error::Io(_) => 500,
        }
    }

    /// Get a sanitized error message safe for external consumers.
    ///
    /// User-correctable errors keep their message; internal failures are
    /// collapsed to a generic one.
    pub fn external_message(&self) -> String {
        match self {
            Error::InsufficientCredits {
                required,
                available,
            } => format!(
                "Insufficient credits: {} required, {} available",
                required, available
            ),
            Error::RateLimited { retry_after } => format!(
                "Email limit reached. Please wait {} seconds.",
                retry_after.as_secs().max(1)
            ),
            Error::Validation(msg) => format!("Validation error: {}", msg),
            Error::AccountNotFound(id) => format!("Account not found: {}", id),
            Error::ReportNotFound(id) => format!("Report not found: {}", id),

            // Internal errors - hide details
            Error::Upstream(_) => "An upstream service failed. You have not been charged.".to_string(),
            Error::Config(_) => "Server configuration error".to_string(),
            Error::Storage(_) | Error::Database(_) => "A storage error occurred".to_string(),
            Error::Json(_) => "Invalid JSON format".to_string(),
            Error::Io(_) => "An I/O error occurred".to_string(),

            Error::Http(e) => {
                if let Some(status) = e.status() {
                    format!("Upstream request failed with status {}", status.as_u16())
                } else if e.is_timeout() {
                    "Upstream request timed out".to_string()
                } else {
                    "Upstream request failed".to_string()
                }
            }
        }
    }

    /// Convert to a JSON error body for API responses.
    pub fn to_external_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.external_message(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_status() {
        let e = Error::InsufficientCredits {
            required: 5,
            available: 2,
        };
        assert_eq!(e.code(), "INSUFFICIENT_CREDITS");
        assert_eq!(e.http_status(), 403);

        let e = Error::RateLimited {
            retry_after: Duration::from_secs(120),
        };
        assert_eq!(e.code(), "RATE_LIMITED");
        assert_eq!(e.http_status(), 429);

        let e = Error::Upstream("gemini returned empty response".to_string());
        assert_eq!(e.http_status(), 502);
    }

    #[test]
    fn test_internal_errors_are_sanitized() {
        let e = Error::Storage("no such table: accounts at /var/lib/db".to_string());
        assert!(!e.external_message().contains("/var/lib"));

        let e = Error::Upstream("secret key abc123 rejected".to_string());
        assert!(!e.external_message().contains("abc123"));
    }

    #[test]
    fn test_rate_limited_message_names_wait() {
        let e = Error::RateLimited {
            retry_after: Duration::from_secs(300),
        };
        assert!(e.external_message().contains("300"));
    }
}
