//! Record store model structs.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Document lifecycle status.
///
/// A record only moves forward through this chain, or to `Failed` from any
/// point. Nothing ever moves a record out of `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    New,
    Extracting,
    Extracted,
    Summarizing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::New => "new",
            DocumentStatus::Extracting => "extracting",
            DocumentStatus::Extracted => "extracted",
            DocumentStatus::Summarizing => "summarizing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "new" => DocumentStatus::New,
            "extracting" => DocumentStatus::Extracting,
            "extracted" => DocumentStatus::Extracted,
            "summarizing" => DocumentStatus::Summarizing,
            "failed" => DocumentStatus::Failed,
            _ => DocumentStatus::Completed,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            DocumentStatus::New => 0,
            DocumentStatus::Extracting => 1,
            DocumentStatus::Extracted => 2,
            DocumentStatus::Summarizing => 3,
            DocumentStatus::Completed => 4,
            DocumentStatus::Failed => 5,
        }
    }

    /// Whether this status may transition to `next`. Forward-only, `Failed`
    /// reachable from any live state, terminal states immutable.
    pub fn can_advance_to(&self, next: DocumentStatus) -> bool {
        match self {
            DocumentStatus::Completed | DocumentStatus::Failed => false,
            _ => next == DocumentStatus::Failed || next.rank() > self.rank(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Failed)
    }
}

/// Document record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub title: String,
    /// Content store locator.
    pub bucket: String,
    pub object_key: String,
    pub content_hash: Option<String>,
    /// Content type as declared at upload, if any.
    pub declared_type: Option<String>,
    pub status: DocumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Length of the extracted text, once extraction has completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_chars: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Monotonically increasing; every mutation checks and bumps it.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let status_str: String = row.get(6)?;
        let created_at_str: String = row.get(11)?;
        let updated_at_str: String = row.get(12)?;

        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            bucket: row.get(2)?,
            object_key: row.get(3)?,
            content_hash: row.get(4)?,
            declared_type: row.get(5)?,
            status: DocumentStatus::from_str(&status_str),
            error: row.get(7)?,
            extracted_chars: row.get(8)?,
            summary: row.get(9)?,
            version: row.get(10)?,
            created_at: DateTime::parse_from_rfc3339(&created_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            updated_at: DateTime::parse_from_rfc3339(&updated_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}
