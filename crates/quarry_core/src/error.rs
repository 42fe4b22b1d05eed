//! Error types for Quarry.
//!
//! Every failure surfaced to callers is a [`QuarryError`]. Tunnel failures are
//! normally recovered inside connection resolution and only reach callers of
//! [`crate::services::TunnelManager::establish_tunnel`] directly.

use serde::Serialize;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type QuarryResult<T> = Result<T, QuarryError>;

/// Main error type for Quarry.
#[derive(Debug, Error)]
pub enum QuarryError {
    /// Unknown target, missing SSH descriptor, unreadable private key.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// Statement rejected by the read-only guard.
    #[error("Validation error: {message}")]
    Validation {
        /// Human-readable error message.
        message: String,
        /// The forbidden keyword the statement started with.
        keyword: String,
    },

    /// SSH connection, authentication or forwarding failure.
    #[error("Tunnel error: {message}")]
    Tunnel {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Failure reported by the underlying SQL driver.
    #[error("{message}")]
    Driver {
        /// Driver or server error message.
        message: String,
        /// Server error code (SQLSTATE or MySQL error number).
        code: Option<String>,
        /// Additional detail from the server.
        detail: Option<String>,
        /// Server hint.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Work abandoned because pools and tunnels were closed mid-flight.
    #[error("Shut down: {message}")]
    Shutdown {
        /// Human-readable error message.
        message: String,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
    },
}

impl QuarryError {
    // ========== Constructors ==========

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into(), hint: None }
    }

    /// Create a new config error with a hint.
    pub fn config_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Config { message: message.into(), hint: Some(hint.into()) }
    }

    /// Create an error for a target name that is not configured.
    pub fn unknown_target<'a>(name: &str, known: impl IntoIterator<Item = &'a str>) -> Self {
        let known: Vec<&str> = known.into_iter().collect();
        Self::Config {
            message: format!("Unknown database '{}'. Available: {}", name, known.join(", ")),
            hint: Some("Use one of the configured target names".to_string()),
        }
    }

    /// Create a new validation error for a forbidden statement keyword.
    pub fn validation(keyword: impl Into<String>) -> Self {
        let keyword = keyword.into();
        Self::Validation {
            message: format!("Write operations are not allowed ({keyword} statement rejected)"),
            keyword,
        }
    }

    /// Create a new tunnel error.
    pub fn tunnel(message: impl Into<String>) -> Self {
        Self::Tunnel { message: message.into(), source: None }
    }

    /// Create a new tunnel error with source.
    pub fn tunnel_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Tunnel { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new driver error without server details.
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver { message: message.into(), code: None, detail: None, hint: None, source: None }
    }

    /// Create an error for work cut short by `close_all_pools`.
    pub fn shutdown(message: impl Into<String>) -> Self {
        Self::Shutdown { message: message.into() }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    // ========== Methods ==========

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "Config",
            Self::Validation { .. } => "Validation",
            Self::Tunnel { .. } => "Tunnel",
            Self::Driver { .. } => "Driver",
            Self::Shutdown { .. } => "Shutdown",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Config { hint, .. } => hint.as_deref(),
            Self::Validation { .. } => Some("Only read-only statements are accepted"),
            Self::Tunnel { .. } => Some("Check the bastion host and SSH key settings"),
            Self::Driver { hint, .. } => hint.as_deref(),
            Self::Shutdown { .. } => None,
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Get the server error code (if applicable).
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Driver { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Check if this error came from the read-only guard.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Check if this is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Check if this error came from closing pools and tunnels.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown { .. })
    }

    /// Convert to a structured payload for textual error responses.
    pub fn to_error_info(&self) -> ErrorInfo {
        let error_type = format!("{} Error", self.category());
        let message = self.to_string();
        let hint = self.hint().map(String::from);

        let technical_detail = match self {
            Self::Driver { detail, code, .. } => {
                let mut parts = Vec::new();
                if let Some(code) = code {
                    parts.push(format!("Code: {code}"));
                }
                if let Some(detail) = detail {
                    parts.push(format!("Detail: {detail}"));
                }
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join("\n"))
                }
            }
            Self::Tunnel { source: Some(source), .. } => Some(source.to_string()),
            _ => None,
        };

        ErrorInfo { error_type, message, hint, technical_detail }
    }
}

/// User-displayable error information.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Category name (e.g., "Driver Error").
    pub error_type: String,
    /// User-friendly message.
    pub message: String,
    /// Actionable suggestion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Technical detail such as server error codes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub technical_detail: Option<String>,
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to QuarryError.
impl From<tokio_postgres::Error> for QuarryError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            return QuarryError::Driver {
                message: db_err.message().to_string(),
                code: Some(db_err.code().code().to_string()),
                detail: db_err.detail().map(String::from),
                hint: db_err.hint().map(String::from),
                source: None,
            };
        }

        let message = if err.is_closed() {
            "Connection closed".to_string()
        } else {
            err.to_string()
        };

        QuarryError::Driver {
            message,
            code: None,
            detail: None,
            hint: Some("Check that the database server is reachable".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from deadpool_postgres::PoolError to QuarryError.
impl From<deadpool_postgres::PoolError> for QuarryError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Backend(pg) => QuarryError::from(pg),
            deadpool_postgres::PoolError::Timeout(kind) => QuarryError::Driver {
                message: format!("Timed out acquiring a connection ({kind:?})"),
                code: None,
                detail: None,
                hint: Some("The pool is saturated or the server is unreachable".to_string()),
                source: None,
            },
            other => QuarryError::Driver {
                message: format!("Failed to acquire connection: {other}"),
                code: None,
                detail: None,
                hint: None,
                source: None,
            },
        }
    }
}

/// Convert from mysql_async::Error to QuarryError.
impl From<mysql_async::Error> for QuarryError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Server(server) => QuarryError::Driver {
                message: server.message.clone(),
                code: Some(server.code.to_string()),
                detail: Some(format!("SQLSTATE {}", server.state)),
                hint: None,
                source: None,
            },
            other => QuarryError::Driver {
                message: other.to_string(),
                code: None,
                detail: None,
                hint: Some("Check that the database server is reachable".to_string()),
                source: Some(Box::new(other)),
            },
        }
    }
}
