use thiserror::Error;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Document not found: {document_id}")]
    DocumentNotFound { document_id: String },

    #[error("Duplicate document content (already stored as {document_id})")]
    DuplicateDocument { document_id: String },

    #[error("Document too large: {size} bytes (max {max} bytes)")]
    DocumentTooLarge { size: u64, max: u64 },

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("Message broker error")]
    Broker(#[from] BrokerError),

    #[error("Content store error")]
    Storage(#[from] StorageError),

    #[error("Text extraction failed")]
    Extraction(#[from] ExtractionError),

    #[error("{0}")]
    Summarizer(#[from] SummarizerError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Optimistic version check failed for document {document_id} (expected version {expected})")]
    VersionConflict { document_id: String, expected: i64 },
}

/// Message broker errors
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Unknown queue: {queue}")]
    UnknownQueue { queue: String },

    #[error("Queue {queue} is closed")]
    QueueClosed { queue: String },
}

/// Content store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("IO error accessing {bucket}/{key}")]
    Io {
        bucket: String,
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Text extraction errors
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Unsupported content format: {detail}")]
    UnsupportedFormat { detail: String },

    #[error("Corrupt document: {detail}")]
    CorruptDocument { detail: String },

    #[error("Failed to render page {page}: {detail}")]
    Render { page: usize, detail: String },

    #[error("Text recognition failed on page {page}: {detail}")]
    Recognition { page: usize, detail: String },

    #[error("OCR engine unavailable: {detail}")]
    EngineUnavailable { detail: String },
}

/// Summarizer client errors
#[derive(Error, Debug)]
pub enum SummarizerError {
    #[error("Summarizer is not configured")]
    NotConfigured,

    #[error("Connection failed to summarizer at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Generation failed (status {status}): {message}")]
    Generation { status: u16, message: String },

    #[error("Invalid response from summarizer: {detail}")]
    InvalidResponse { detail: String },

    #[error("Summarizer returned an empty summary")]
    EmptySummary,
}

/// Classification used by the resilience envelope: transient failures are
/// worth another attempt, permanent ones are surfaced immediately.
pub trait FailureClass {
    fn is_transient(&self) -> bool;
}

impl FailureClass for SummarizerError {
    fn is_transient(&self) -> bool {
        match self {
            SummarizerError::Connection { .. } => true,
            // 5xx and 429 come back when the service recovers; 4xx never do.
            SummarizerError::Generation { status, .. } => *status >= 500 || *status == 429,
            SummarizerError::NotConfigured
            | SummarizerError::InvalidResponse { .. }
            | SummarizerError::EmptySummary => false,
        }
    }
}

impl FailureClass for StorageError {
    fn is_transient(&self) -> bool {
        match self {
            StorageError::NotFound { .. } => false,
            StorageError::Io { source, .. } => !matches!(
                source.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
        }
    }
}

impl FailureClass for ServiceError {
    fn is_transient(&self) -> bool {
        match self {
            ServiceError::Database(e) => e.is_transient(),
            ServiceError::Broker(_) => true,
            ServiceError::Storage(e) => e.is_transient(),
            ServiceError::Summarizer(e) => e.is_transient(),
            ServiceError::Extraction(_)
            | ServiceError::DocumentNotFound { .. }
            | ServiceError::DuplicateDocument { .. }
            | ServiceError::DocumentTooLarge { .. }
            | ServiceError::Internal { .. } => false,
        }
    }
}

impl FailureClass for DatabaseError {
    fn is_transient(&self) -> bool {
        match self {
            // A version conflict means a concurrent writer won; re-reading
            // the record and retrying is expected to succeed.
            DatabaseError::VersionConflict { .. } => true,
            DatabaseError::Connection(_) | DatabaseError::Query(_) | DatabaseError::Migration { .. } => false,
        }
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
