//! Stage events exchanged between pipeline components.
//!
//! Events are immutable envelopes. Message ids are deterministic (stage name
//! plus document id) so a redelivered message always carries the same
//! idempotency key as the original delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic names for the three pipeline channels.
pub const TOPIC_DOCUMENT_CREATED: &str = "document.created";
pub const TOPIC_EXTRACTION_COMPLETED: &str = "extraction.completed";
pub const TOPIC_SUMMARY_RESULT: &str = "summary.result";

/// Immutable event envelope passed between stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    /// Deterministic id derived from the publishing stage and document id.
    pub message_id: String,
    pub document_id: String,
    pub title: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl StageEvent {
    pub fn document_created(
        document_id: impl Into<String>,
        title: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        declared_type: Option<String>,
    ) -> Self {
        let document_id = document_id.into();
        Self {
            message_id: created_message_id(&document_id),
            document_id,
            title: title.into(),
            occurred_at: Utc::now(),
            payload: EventPayload::DocumentCreated {
                bucket: bucket.into(),
                key: key.into(),
                declared_type,
            },
        }
    }

    pub fn extraction_completed(
        document_id: impl Into<String>,
        title: impl Into<String>,
        outcome: ExtractionOutcome,
    ) -> Self {
        let document_id = document_id.into();
        Self {
            message_id: extraction_message_id(&document_id),
            document_id,
            title: title.into(),
            occurred_at: Utc::now(),
            payload: EventPayload::ExtractionCompleted { outcome },
        }
    }

    pub fn summary_result(
        document_id: impl Into<String>,
        title: impl Into<String>,
        outcome: SummaryOutcome,
    ) -> Self {
        let document_id = document_id.into();
        Self {
            message_id: summary_message_id(&document_id),
            document_id,
            title: title.into(),
            occurred_at: Utc::now(),
            payload: EventPayload::SummaryResult { outcome },
        }
    }
}

/// Stage-specific payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    DocumentCreated {
        bucket: String,
        key: String,
        /// Content type as declared by the uploader, if any. The extraction
        /// stage trusts a magic-number sniff over this value.
        declared_type: Option<String>,
    },
    ExtractionCompleted {
        outcome: ExtractionOutcome,
    },
    SummaryResult {
        outcome: SummaryOutcome,
    },
}

/// Terminal outcome of the extraction stage for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractionOutcome {
    Success {
        text: String,
        /// Arithmetic mean of per-page confidences over pages attempted.
        mean_confidence: f64,
        total_pages: usize,
        pages: Vec<PageResult>,
        language: String,
    },
    Failure {
        reason: String,
    },
}

/// Per-page extraction result. A failed page keeps its slot with empty text
/// and zero confidence so the page count stays honest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    /// 1-indexed page number.
    pub page_number: usize,
    pub text: String,
    /// Recognition confidence, 0-100.
    pub confidence: f64,
    pub success: bool,
    pub elapsed_ms: u64,
}

impl PageResult {
    /// Placeholder result for a page whose extraction failed.
    pub fn failed(page_number: usize, elapsed_ms: u64) -> Self {
        Self {
            page_number,
            text: String::new(),
            confidence: 0.0,
            success: false,
            elapsed_ms,
        }
    }
}

/// Terminal outcome of the summarization stage for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SummaryOutcome {
    Success {
        summary: String,
        /// True when the summary is a fallback placeholder produced while
        /// the summarizer dependency was unavailable.
        degraded: bool,
        elapsed_ms: u64,
    },
    Failure {
        reason: String,
    },
}

/// Idempotency key claimed by the extraction stage (and carried as the id of
/// the extraction-completed event it publishes).
pub fn extraction_message_id(document_id: &str) -> String {
    format!("extract-{document_id}")
}

/// Idempotency key claimed by the summarization stage (and carried as the id
/// of the summary-result event it publishes).
pub fn summary_message_id(document_id: &str) -> String {
    format!("summarize-{document_id}")
}

/// Idempotency key claimed by the result sink when applying a summary result.
pub fn result_message_id(document_id: &str) -> String {
    format!("result-{document_id}")
}

/// Idempotency key claimed by the result sink when recording extraction
/// completion on the document record.
pub fn extracted_record_message_id(document_id: &str) -> String {
    format!("extracted-{document_id}")
}

pub fn created_message_id(document_id: &str) -> String {
    format!("created-{document_id}")
}
