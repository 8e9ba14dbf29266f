//! Error types for graph database operations
//!
//! This module defines the single error type used across hive-kg. Driver
//! failures are mapped into dedicated variants so that the retry engine can
//! classify them without inspecting message text (see
//! [`Neo4jError::from_server_message`] for the one place where that happens).

use thiserror::Error;

/// Main error type for Neo4j operations
#[derive(Error, Debug)]
pub enum Neo4jError {
    /// Connection error - network failure, reset or broken session
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The database is reachable but not serving requests (leader switch, restart)
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Authentication error - invalid credentials or permissions
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// Query execution error (malformed query, wrong access mode, ...)
    #[error("Query error: {0}")]
    QueryError(String),

    /// A uniqueness or existence constraint rejected the write
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// The server aborted the transaction to break a deadlock
    #[error("Deadlock detected: {0}")]
    Deadlock(String),

    /// Any other `Neo.TransientError.*` status; the server says a retry may succeed
    #[error("Transient error: {0}")]
    TransientError(String),

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms: {context}")]
    TimeoutError { timeout_ms: u64, context: String },

    /// No pooled session became free within the acquire timeout
    #[error("Session acquisition timed out after {timeout_ms}ms: all {max_pool_size} sessions are in use")]
    AcquisitionTimeout { timeout_ms: u64, max_pool_size: usize },

    /// The session pool has been closed
    #[error("Session pool is closed")]
    PoolClosed,

    /// The circuit breaker rejected the call without contacting the database
    #[error("Circuit breaker open after {failure_count} failures, next attempt in {retry_after_ms}ms")]
    CircuitOpen { failure_count: u32, retry_after_ms: u64 },

    /// Terminal failure of a transaction after classification and retries
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    TransactionFailed {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<Neo4jError>,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Neo4rs driver error (wrapper)
    #[error("Neo4rs driver error: {0}")]
    DriverError(#[from] neo4rs::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for Neo4j operations
pub type Result<T> = std::result::Result<T, Neo4jError>;

impl Neo4jError {
    /// Map a server status code or driver message onto an error variant.
    ///
    /// Neo4j reports failures as `Neo.<Classification>.<Category>.<Title>`
    /// codes; drivers that lose the structured code still carry it (or a
    /// recognisable phrase) in the message.
    pub fn from_server_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("deadlockdetected") || lower.contains("deadlock") {
            Neo4jError::Deadlock(message)
        } else if lower.contains("constraintvalidationfailed")
            || lower.contains("already exists with label")
            || lower.contains("constraint violation")
        {
            Neo4jError::ConstraintViolation(message)
        } else if lower.contains("security.unauthorized")
            || lower.contains("authentication")
            || lower.contains("unauthorized")
        {
            Neo4jError::AuthenticationError(message)
        } else if lower.contains("serviceunavailable")
            || lower.contains("service unavailable")
            || lower.contains("databaseunavailable")
            || lower.contains("sessionexpired")
            || lower.contains("notaleader")
        {
            Neo4jError::ServiceUnavailable(message)
        } else if lower.contains("connection reset")
            || lower.contains("broken pipe")
            || lower.contains("connection refused")
            || lower.contains("connection closed")
            || lower.contains("connection error")
            || lower.contains("ioerror")
            || lower.contains("io error")
            || lower.contains("i/o error")
        {
            Neo4jError::ConnectionError(message)
        } else if lower.contains("transactiontimedout") || lower.contains("timed out") {
            Neo4jError::TimeoutError {
                timeout_ms: 0,
                context: message,
            }
        } else if lower.contains("neo.transienterror.") {
            Neo4jError::TransientError(message)
        } else if lower.contains("neo.clienterror.statement.")
            || lower.contains("syntax error")
            || lower.contains("invalid input")
        {
            Neo4jError::QueryError(message)
        } else {
            // Database errors, protocol errors and anything unrecognised
            Neo4jError::Other(message)
        }
    }

    /// Number of attempts made before this error was surfaced.
    pub fn attempts(&self) -> u32 {
        match self {
            Neo4jError::TransactionFailed { attempts, .. } => *attempts,
            Neo4jError::CircuitOpen { .. } => 0,
            _ => 1,
        }
    }

    /// The innermost error, unwrapping transaction failure envelopes.
    pub fn root_cause(&self) -> &Neo4jError {
        match self {
            Neo4jError::TransactionFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether the call was rejected by an open circuit breaker.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self.root_cause(), Neo4jError::CircuitOpen { .. })
    }

    /// Whether the error means the storage backend as a whole is unhealthy,
    /// rather than this particular call being wrong.
    pub fn is_storage_degraded(&self) -> bool {
        matches!(
            self.root_cause(),
            Neo4jError::CircuitOpen { .. }
                | Neo4jError::ConnectionError(_)
                | Neo4jError::ServiceUnavailable(_)
                | Neo4jError::PoolClosed
        )
    }
}

impl From<String> for Neo4jError {
    fn from(s: String) -> Self {
        Neo4jError::Other(s)
    }
}

impl From<&str> for Neo4jError {
    fn from(s: &str) -> Self {
        Neo4jError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for Neo4jError {
    fn from(e: serde_json::Error) -> Self {
        Neo4jError::SerializationError(e.to_string())
    }
}
