use thiserror::Error;

use crate::schema::Violation;

/// Engine-wide error type.
///
/// Every failure that can occur during a synchronization run is expressed as a
/// `SyncError`. Variants are grouped into the five classes returned by
/// [`SyncError::class`]; the class decides whether the error aborts the whole run
/// or only the record (or deletion) being processed.
///
/// # Error Conversion
///
/// - `sqlx::Error` → `SyncError::DatabaseError` (persistence)
/// - `serde_json::Error` → `SyncError::SerializationError` (unexpected)
///
/// # Examples
///
/// ```
/// use pubsync_core::error::{ErrorClass, SyncError};
///
/// let err = SyncError::MissingSetting("oin".to_string());
/// assert_eq!(err.class(), ErrorClass::Configuration);
/// assert!(err.aborts_run());
/// ```
#[derive(Error, Debug)]
pub enum SyncError {
    /// A required configuration key is absent or empty.
    #[error("Missing required setting: {0}")]
    MissingSetting(String),

    /// A configuration value names something that does not exist.
    #[error("Unresolved {kind} reference: {name}")]
    UnresolvedReference { kind: &'static str, name: String },

    /// Configuration could not be read or parsed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Another run currently holds the partition lock.
    #[error("Partition {0} is locked by another run")]
    PartitionLocked(String),

    /// The external source answered with something other than a usable page.
    ///
    /// Covers non-2xx responses, bodies that cannot be decoded and responses
    /// without a record collection.
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// The external source answered with a 5xx status.
    #[error("Source server error: HTTP {status} from {url}")]
    ServerError { status: u16, url: String },

    /// Network or connection error while talking to the external source.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded on the external source.
    #[error("Rate limit exceeded. Please wait and try again.")]
    RateLimitExceeded,

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The transformed record does not satisfy its schema.
    #[error("Record failed validation with {} violation(s)", .0.len())]
    Validation(Vec<Violation>),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Store-level failure that did not originate from the database driver.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Anything else raised while processing a single record.
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Error classes that decide how far an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Fatal to the run, raised before any I/O.
    Configuration,
    /// Fatal to the run, previously fetched pages are discarded.
    Fetch,
    /// Local to one record; the record is skipped.
    Validation,
    /// Local to one record or one deletion.
    Persistence,
    /// Local to one record.
    Unexpected,
}

impl SyncError {
    /// Returns the class this error belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::MissingSetting(_)
            | SyncError::UnresolvedReference { .. }
            | SyncError::Configuration(_)
            | SyncError::PartitionLocked(_)
            | SyncError::InvalidUrl(_) => ErrorClass::Configuration,
            SyncError::Fetch(_)
            | SyncError::ServerError { .. }
            | SyncError::NetworkError(_)
            | SyncError::Timeout(_)
            | SyncError::RateLimitExceeded => ErrorClass::Fetch,
            SyncError::Validation(_) => ErrorClass::Validation,
            SyncError::DatabaseError(_) | SyncError::Persistence(_) => ErrorClass::Persistence,
            SyncError::SerializationError(_) | SyncError::Unexpected(_) => ErrorClass::Unexpected,
        }
    }

    /// Returns true if this error must abort the entire run.
    ///
    /// Only configuration and fetch errors escalate; everything else is
    /// contained at record granularity.
    pub fn aborts_run(&self) -> bool {
        matches!(self.class(), ErrorClass::Configuration | ErrorClass::Fetch)
    }

    /// Returns true if a request that failed with this error may be retried.
    ///
    /// Client errors and undecodable bodies are not retried; the same request
    /// would fail the same way.
    ///
    /// # Examples
    ///
    /// ```
    /// use pubsync_core::error::SyncError;
    ///
    /// assert!(SyncError::NetworkError("connection reset".to_string()).is_retryable());
    /// assert!(SyncError::RateLimitExceeded.is_retryable());
    /// assert!(!SyncError::Fetch("HTTP 404".to_string()).is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ServerError { .. }
                | SyncError::NetworkError(_)
                | SyncError::Timeout(_)
                | SyncError::RateLimitExceeded
        )
    }

    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            SyncError::DatabaseError(e) => {
                if e.to_string().contains("connection") {
                    "Cannot connect to database. Is PostgreSQL running?\n   Check DATABASE_URL."
                        .to_string()
                } else {
                    format!("Database error: {}", e)
                }
            }
            SyncError::MissingSetting(key) => {
                format!(
                    "Missing required setting `{}`.\n   Add it under [sources.settings] in your sources file.",
                    key
                )
            }
            SyncError::UnresolvedReference { kind, name } => {
                format!(
                    "Unknown {} `{}`.\n   Check the names declared in your sources file.",
                    kind, name
                )
            }
            SyncError::PartitionLocked(partition) => {
                format!(
                    "Another run is already synchronizing {}.\n   Wait for it to finish and try again.",
                    partition
                )
            }
            SyncError::NetworkError(msg) => {
                format!("Network error: {}\n   Check your internet connection.", msg)
            }
            SyncError::Timeout(secs) => {
                format!(
                    "Request timed out after {} seconds.\n   The source may be overloaded. Try again later.",
                    secs
                )
            }
            SyncError::RateLimitExceeded => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            SyncError::Validation(violations) => {
                let details: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
                format!("Record failed validation:\n   {}", details.join("\n   "))
            }
            _ => self.to_string(),
        }
    }
}
