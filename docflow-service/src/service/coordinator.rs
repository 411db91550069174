//! Ingestion coordinator: accept content, persist the record, emit the
//! first event.

use chrono::Utc;
use metrics::counter;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{DocumentRecord, DocumentStatus};
use crate::error::{ServiceError, ServiceResult};
use crate::events::{StageEvent, TOPIC_DOCUMENT_CREATED};
use crate::service::{BUCKET_DOCUMENTS, PipelineService};

/// SHA-256 of the uploaded content, used for duplicate detection.
pub(crate) fn compute_content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

impl PipelineService {
    /// Ingest a document: store the content, persist a record in status NEW,
    /// then publish the `document.created` event.
    ///
    /// The event is published only after the insert is acknowledged. If the
    /// publish fails the record is marked failed and the whole create fails;
    /// the caller retries the entire operation. No idempotency check is
    /// needed here because the id is freshly minted per request.
    pub async fn create_document(
        &self,
        title: &str,
        filename: &str,
        declared_type: Option<String>,
        content: &[u8],
    ) -> ServiceResult<DocumentRecord> {
        let max_size = self.config.limits.max_document_size_bytes;
        if content.len() as u64 > max_size {
            return Err(ServiceError::DocumentTooLarge {
                size: content.len() as u64,
                max: max_size,
            });
        }

        let content_hash = compute_content_hash(content);
        if let Some(existing) = self.db.get_document_id_by_hash(&content_hash)? {
            return Err(ServiceError::DuplicateDocument {
                document_id: existing,
            });
        }

        let doc_id = Uuid::new_v4().to_string();
        let object_key = format!("{doc_id}_{filename}");
        self.store.put(BUCKET_DOCUMENTS, &object_key, content)?;

        let now = Utc::now();
        let record = DocumentRecord {
            id: doc_id.clone(),
            title: title.to_string(),
            bucket: BUCKET_DOCUMENTS.to_string(),
            object_key: object_key.clone(),
            content_hash: Some(content_hash),
            declared_type: declared_type.clone(),
            status: DocumentStatus::New,
            error: None,
            extracted_chars: None,
            summary: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_document(&record)?;

        let event = StageEvent::document_created(
            doc_id.clone(),
            title,
            BUCKET_DOCUMENTS,
            object_key,
            declared_type,
        );
        if let Err(publish_err) = self.broker.publish(TOPIC_DOCUMENT_CREATED, &event).await {
            // The record exists but no event will drive it. Mark it failed so
            // the hash check doesn't block the caller's retry.
            if let Err(db_err) = self.db.advance_status(
                &doc_id,
                0,
                DocumentStatus::Failed,
                Some("created event publish failed"),
            ) {
                warn!(doc_id = %doc_id, error = %db_err, "Failed to mark document as failed after publish error");
            }
            return Err(publish_err.into());
        }

        // Mark extraction as dispatched. Best effort; the pipeline is driven
        // by the event, not this status.
        if let Err(e) = self
            .db
            .advance_status(&doc_id, 0, DocumentStatus::Extracting, None)
        {
            warn!(doc_id = %doc_id, error = %e, "Failed to mark document as extracting");
        }

        counter!("docflow_documents_created_total").increment(1);
        info!(
            doc_id = %doc_id,
            title = %title,
            bytes = content.len(),
            "Document ingested and queued for extraction"
        );

        self.db
            .get_document(&doc_id)?
            .ok_or_else(|| ServiceError::DocumentNotFound {
                document_id: doc_id,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::QUEUE_EXTRACTION;
    use crate::service::test_support::*;
    use std::sync::Arc;

    fn test_service(dir: &std::path::Path) -> Arc<PipelineService> {
        service_with(
            dir,
            Arc::new(FixedRecognizer::new("text", 90.0)),
            Arc::new(ScriptedSummarizer::ok("summary")),
        )
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(compute_content_hash(b"abc"), compute_content_hash(b"abc"));
        assert_ne!(compute_content_hash(b"abc"), compute_content_hash(b"abd"));
    }

    #[tokio::test]
    async fn create_persists_before_publishing() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path());

        let record = service
            .create_document("Doc", "doc.png", None, &png_bytes(4, 4))
            .await
            .unwrap();

        // Record is durably stored and content is fetchable.
        assert!(service.db.get_document(&record.id).unwrap().is_some());
        assert!(
            service
                .store
                .get(&record.bucket, &record.object_key)
                .is_ok()
        );

        // Exactly one created event is waiting for the extraction stage.
        let queue = service.broker.queue(QUEUE_EXTRACTION).unwrap();
        let delivery = queue.next().await.unwrap();
        assert_eq!(delivery.event.document_id, record.id);
    }

    #[tokio::test]
    async fn duplicate_content_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path());
        let content = png_bytes(4, 4);

        let first = service
            .create_document("Doc", "doc.png", None, &content)
            .await
            .unwrap();
        let second = service
            .create_document("Doc again", "doc2.png", None, &content)
            .await;

        match second {
            Err(crate::error::ServiceError::DuplicateDocument { document_id }) => {
                assert_eq!(document_id, first.id);
            }
            other => panic!("expected duplicate refusal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_content_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path());
        let big = vec![0u8; (service.config.limits.max_document_size_bytes + 1) as usize];

        let result = service.create_document("Big", "big.bin", None, &big).await;
        assert!(matches!(
            result,
            Err(crate::error::ServiceError::DocumentTooLarge { .. })
        ));
    }
}
