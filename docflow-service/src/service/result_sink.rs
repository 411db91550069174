//! Result sink: the only component besides the coordinator that mutates
//! document records.
//!
//! Consumes both downstream topics. Extraction results advance the record
//! through EXTRACTED into SUMMARIZING and store the extracted length;
//! summary results land it in COMPLETED or FAILED. Every write carries an
//! optimistic version check, and a completed record is never overwritten.
//! Semantic problems (unknown document, stale status) are logged and
//! acknowledged; only transport-level failures bubble up to cause broker
//! redelivery.

use metrics::counter;
use tracing::{debug, info, warn};

use crate::db::DocumentStatus;
use crate::error::{DatabaseError, ServiceResult};
use crate::events::{
    EventPayload, ExtractionOutcome, StageEvent, SummaryOutcome, extracted_record_message_id,
    result_message_id,
};
use crate::service::PipelineService;

/// In-process retries for optimistic version conflicts before giving the
/// message back to the broker.
const VERSION_RETRIES: u32 = 3;

impl PipelineService {
    /// Handle one delivery from the results queue (called by sink workers).
    pub(crate) async fn apply_result_event(&self, event: &StageEvent) -> ServiceResult<()> {
        match &event.payload {
            EventPayload::ExtractionCompleted { outcome } => {
                let message_id = extracted_record_message_id(&event.document_id);
                if !self.idempotency.try_claim(&message_id) {
                    return Ok(());
                }
                let result = self.apply_extraction_result(event, outcome).await;
                if result.is_err() {
                    self.idempotency.release(&message_id);
                }
                result
            }
            EventPayload::SummaryResult { outcome } => {
                let message_id = result_message_id(&event.document_id);
                if !self.idempotency.try_claim(&message_id) {
                    return Ok(());
                }
                let result = self.apply_summary_result(event, outcome).await;
                if result.is_err() {
                    self.idempotency.release(&message_id);
                }
                result
            }
            EventPayload::DocumentCreated { .. } => {
                warn!(message_id = %event.message_id, "Unexpected payload on results queue, dropping");
                Ok(())
            }
        }
    }

    async fn apply_extraction_result(
        &self,
        event: &StageEvent,
        outcome: &ExtractionOutcome,
    ) -> ServiceResult<()> {
        let doc_id = &event.document_id;

        for _ in 0..VERSION_RETRIES {
            let Some(record) = self.db.get_document(doc_id)? else {
                // The record can never appear later; requeueing would loop
                // the message into the dead-letter queue for nothing.
                warn!(doc_id = %doc_id, "Extraction result for unknown document, dropping");
                return Ok(());
            };

            match outcome {
                ExtractionOutcome::Success { text, .. } => {
                    if !record.status.can_advance_to(DocumentStatus::Extracted) {
                        debug!(
                            doc_id = %doc_id,
                            status = record.status.as_str(),
                            "Record already past extraction, skipping"
                        );
                        return Ok(());
                    }
                    let chars = text.chars().count() as i64;
                    if self.db.record_extraction(
                        doc_id,
                        record.version,
                        DocumentStatus::Extracted,
                        chars,
                    )? {
                        // Summarization is consuming the same event
                        // concurrently; reflect that on the record.
                        if !self.db.advance_status(
                            doc_id,
                            record.version + 1,
                            DocumentStatus::Summarizing,
                            None,
                        )? {
                            debug!(doc_id = %doc_id, "Record moved on before summarizing mark");
                        }
                        info!(doc_id = %doc_id, extracted_chars = chars, "Extraction recorded");
                        return Ok(());
                    }
                }
                ExtractionOutcome::Failure { reason } => {
                    if !record.status.can_advance_to(DocumentStatus::Failed) {
                        debug!(doc_id = %doc_id, status = record.status.as_str(), "Terminal record, skipping failure");
                        return Ok(());
                    }
                    if self.db.advance_status(
                        doc_id,
                        record.version,
                        DocumentStatus::Failed,
                        Some(reason),
                    )? {
                        counter!("docflow_documents_failed_total", "stage" => "extraction")
                            .increment(1);
                        info!(doc_id = %doc_id, reason = %reason, "Document failed at extraction");
                        return Ok(());
                    }
                }
            }
            // Version conflict: another writer advanced the record; re-read.
        }

        Err(DatabaseError::VersionConflict {
            document_id: doc_id.clone(),
            expected: -1,
        }
        .into())
    }

    async fn apply_summary_result(
        &self,
        event: &StageEvent,
        outcome: &SummaryOutcome,
    ) -> ServiceResult<()> {
        let doc_id = &event.document_id;

        for _ in 0..VERSION_RETRIES {
            let Some(record) = self.db.get_document(doc_id)? else {
                warn!(doc_id = %doc_id, "Summary result for unknown document, dropping");
                return Ok(());
            };

            match outcome {
                SummaryOutcome::Success {
                    summary, degraded, ..
                } => {
                    if !record.status.can_advance_to(DocumentStatus::Completed) {
                        debug!(doc_id = %doc_id, status = record.status.as_str(), "Terminal record, skipping summary");
                        return Ok(());
                    }
                    if self.db.complete_document(doc_id, record.version, summary)? {
                        counter!("docflow_documents_completed_total").increment(1);
                        info!(doc_id = %doc_id, degraded, "Document completed");
                        return Ok(());
                    }
                }
                SummaryOutcome::Failure { reason } => {
                    // Never overwrite a completed record; a failed one stays
                    // failed with its original reason.
                    if !record.status.can_advance_to(DocumentStatus::Failed) {
                        debug!(doc_id = %doc_id, status = record.status.as_str(), "Terminal record, skipping failure");
                        return Ok(());
                    }
                    if self.db.advance_status(
                        doc_id,
                        record.version,
                        DocumentStatus::Failed,
                        Some(reason),
                    )? {
                        counter!("docflow_documents_failed_total", "stage" => "summarization")
                            .increment(1);
                        info!(doc_id = %doc_id, reason = %reason, "Document failed at summarization");
                        return Ok(());
                    }
                }
            }
        }

        Err(DatabaseError::VersionConflict {
            document_id: doc_id.clone(),
            expected: -1,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{PageResult, StageEvent};
    use crate::service::test_support::*;
    use std::sync::Arc;

    fn sink_service(dir: &std::path::Path) -> Arc<PipelineService> {
        service_with(
            dir,
            Arc::new(FixedRecognizer::new("unused", 0.0)),
            Arc::new(ScriptedSummarizer::ok("unused")),
        )
    }

    async fn seeded_record(service: &Arc<PipelineService>) -> crate::db::DocumentRecord {
        service
            .create_document("Doc", "doc.png", None, &png_bytes(4, 4))
            .await
            .unwrap()
    }

    fn extraction_success(doc_id: &str) -> StageEvent {
        StageEvent::extraction_completed(
            doc_id,
            "Doc",
            ExtractionOutcome::Success {
                text: "extracted text".to_string(),
                mean_confidence: 80.0,
                total_pages: 1,
                pages: vec![PageResult {
                    page_number: 1,
                    text: "extracted text".to_string(),
                    confidence: 80.0,
                    success: true,
                    elapsed_ms: 3,
                }],
                language: "eng".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn unknown_document_is_acknowledged_not_requeued() {
        let dir = tempfile::tempdir().unwrap();
        let service = sink_service(dir.path());

        let event = StageEvent::summary_result(
            "ghost",
            "Ghost",
            SummaryOutcome::Success {
                summary: "s".to_string(),
                degraded: false,
                elapsed_ms: 1,
            },
        );
        // Ok means ack: the worker will not requeue.
        service.apply_result_event(&event).await.unwrap();
    }

    #[tokio::test]
    async fn extraction_success_records_length_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let service = sink_service(dir.path());
        let record = seeded_record(&service).await;

        service
            .apply_result_event(&extraction_success(&record.id))
            .await
            .unwrap();

        let loaded = service.db.get_document(&record.id).unwrap().unwrap();
        assert_eq!(loaded.status, crate::db::DocumentStatus::Summarizing);
        assert_eq!(loaded.extracted_chars, Some("extracted text".len() as i64));
    }

    #[tokio::test]
    async fn summary_success_completes_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let service = sink_service(dir.path());
        let record = seeded_record(&service).await;
        service
            .apply_result_event(&extraction_success(&record.id))
            .await
            .unwrap();

        let event = StageEvent::summary_result(
            &record.id,
            "Doc",
            SummaryOutcome::Success {
                summary: "The summary.".to_string(),
                degraded: false,
                elapsed_ms: 5,
            },
        );
        service.apply_result_event(&event).await.unwrap();

        let loaded = service.db.get_document(&record.id).unwrap().unwrap();
        assert_eq!(loaded.status, crate::db::DocumentStatus::Completed);
        assert_eq!(loaded.summary.as_deref(), Some("The summary."));
    }

    #[tokio::test]
    async fn completed_record_is_never_overwritten_by_failure() {
        let dir = tempfile::tempdir().unwrap();
        let service = sink_service(dir.path());
        let record = seeded_record(&service).await;
        service
            .apply_result_event(&extraction_success(&record.id))
            .await
            .unwrap();
        service
            .apply_result_event(&StageEvent::summary_result(
                &record.id,
                "Doc",
                SummaryOutcome::Success {
                    summary: "Done.".to_string(),
                    degraded: false,
                    elapsed_ms: 5,
                },
            ))
            .await
            .unwrap();

        // A late failure result must not undo completion. Its own claim key
        // was already consumed, so release it to simulate a fresh message.
        service.idempotency.release(&result_message_id(&record.id));
        service
            .apply_result_event(&StageEvent::summary_result(
                &record.id,
                "Doc",
                SummaryOutcome::Failure {
                    reason: "late failure".to_string(),
                },
            ))
            .await
            .unwrap();

        let loaded = service.db.get_document(&record.id).unwrap().unwrap();
        assert_eq!(loaded.status, crate::db::DocumentStatus::Completed);
        assert_eq!(loaded.summary.as_deref(), Some("Done."));
    }

    #[tokio::test]
    async fn extraction_failure_marks_the_document_failed() {
        let dir = tempfile::tempdir().unwrap();
        let service = sink_service(dir.path());
        let record = seeded_record(&service).await;

        let event = StageEvent::extraction_completed(
            &record.id,
            "Doc",
            ExtractionOutcome::Failure {
                reason: "corrupt file".to_string(),
            },
        );
        service.apply_result_event(&event).await.unwrap();

        let loaded = service.db.get_document(&record.id).unwrap().unwrap();
        assert_eq!(loaded.status, crate::db::DocumentStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("corrupt file"));
    }
}
