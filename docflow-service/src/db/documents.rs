//! Document record operations.
//!
//! Every mutation after insert carries an optimistic version check: the
//! UPDATE matches on `(id, version)` and bumps the version, so a concurrent
//! writer makes the statement touch zero rows instead of clobbering state.

use rusqlite::{OptionalExtension, params};

use super::Database;
use super::models::{DocumentRecord, DocumentStatus};
use crate::error::{DatabaseError, ServiceResult};

const SELECT_COLUMNS: &str = "id, title, bucket, object_key, content_hash, declared_type, \
     status, error, extracted_chars, summary, version, created_at, updated_at";

impl Database {
    /// Insert a new document record
    pub fn insert_document(&self, doc: &DocumentRecord) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            r#"
            INSERT INTO documents (id, title, bucket, object_key, content_hash, declared_type, status, error, extracted_chars, summary, version, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                doc.id,
                doc.title,
                doc.bucket,
                doc.object_key,
                doc.content_hash,
                doc.declared_type,
                doc.status.as_str(),
                doc.error,
                doc.extracted_chars,
                doc.summary,
                doc.version,
                doc.created_at.to_rfc3339(),
                doc.updated_at.to_rfc3339(),
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Get a document record by ID
    pub fn get_document(&self, id: &str) -> ServiceResult<Option<DocumentRecord>> {
        let conn = self.conn.lock().unwrap();

        conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM documents WHERE id = ?1"),
            params![id],
            DocumentRecord::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Check if a document with the given content hash already exists.
    /// Failed documents don't count; re-uploading after a failure is allowed.
    pub fn get_document_id_by_hash(&self, content_hash: &str) -> ServiceResult<Option<String>> {
        let conn = self.conn.lock().unwrap();

        conn.query_row(
            "SELECT id FROM documents WHERE content_hash = ?1 AND status != 'failed'",
            params![content_hash],
            |row| row.get(0),
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Advance a document's status under an optimistic version check.
    ///
    /// Returns `false` when the check failed (another writer got there
    /// first); the caller re-reads the record and decides again.
    pub fn advance_status(
        &self,
        document_id: &str,
        expected_version: i64,
        status: DocumentStatus,
        error: Option<&str>,
    ) -> ServiceResult<bool> {
        let conn = self.conn.lock().unwrap();

        let rows = conn
            .execute(
                "UPDATE documents SET status = ?1, error = ?2, version = version + 1, updated_at = datetime('now') \
                 WHERE id = ?3 AND version = ?4",
                params![status.as_str(), error, document_id, expected_version],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Record extraction completion: extracted length plus the status move.
    pub fn record_extraction(
        &self,
        document_id: &str,
        expected_version: i64,
        status: DocumentStatus,
        extracted_chars: i64,
    ) -> ServiceResult<bool> {
        let conn = self.conn.lock().unwrap();

        let rows = conn
            .execute(
                "UPDATE documents SET status = ?1, extracted_chars = ?2, error = NULL, version = version + 1, updated_at = datetime('now') \
                 WHERE id = ?3 AND version = ?4",
                params![status.as_str(), extracted_chars, document_id, expected_version],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Set the summary and mark the document completed.
    pub fn complete_document(
        &self,
        document_id: &str,
        expected_version: i64,
        summary: &str,
    ) -> ServiceResult<bool> {
        let conn = self.conn.lock().unwrap();

        let rows = conn
            .execute(
                "UPDATE documents SET status = 'completed', summary = ?1, error = NULL, version = version + 1, updated_at = datetime('now') \
                 WHERE id = ?2 AND version = ?3",
                params![summary, document_id, expected_version],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }
}
