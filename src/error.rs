//! Error types for the scraping framework.
//!
//! This module provides structured error handling with:
//! - `AppError`: Domain-specific errors for framework operations
//! - `Result<T>`: Type alias for Results using AppError
//!
//! Fetch, parse, and config-parse failures carry their own error types in
//! the modules that produce them; `AppError` is the top-level taxonomy the
//! CLI and orchestrator report on.

use thiserror::Error;

/// Domain-specific errors for framework operations.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration file could not be read or decoded
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] crate::config::loader::ConfigParseError),

    /// Configuration failed schema or cross-field validation
    #[error("Invalid config: {0}")]
    ConfigValidation(String),

    /// No configuration matched the requested site
    #[error("No configuration found for site: {site}{}", available_hint(.available))]
    SiteNotFound { site: String, available: Vec<String> },

    /// Invalid or malformed URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::DatabaseError(msg.into())
    }

    pub fn site_not_found(site: impl Into<String>, available: Vec<String>) -> Self {
        Self::SiteNotFound {
            site: site.into(),
            available,
        }
    }
}

fn available_hint(available: &[String]) -> String {
    if available.is_empty() {
        String::new()
    } else {
        format!(". Available sites: {}", available.join(", "))
    }
}

/// Result type alias using AppError.
pub type Result<T> = std::result::Result<T, AppError>;
