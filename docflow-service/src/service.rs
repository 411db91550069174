//! Pipeline service wiring.
//!
//! `PipelineService` owns the collaborators every stage needs. Stage
//! handlers live in submodules as `impl PipelineService` blocks; consumer
//! pools draining the queues are started from `workers`.

mod coordinator;
mod extraction;
mod result_sink;
mod summarization;
mod workers;

pub use workers::Stage;

use std::sync::Arc;

use tracing::info;

use crate::broker::Broker;
use crate::config::StaticConfig;
use crate::db::Database;
use crate::error::ServiceResult;
use crate::events::{TOPIC_DOCUMENT_CREATED, TOPIC_EXTRACTION_COMPLETED, TOPIC_SUMMARY_RESULT};
use crate::idempotency::IdempotencyGuard;
use crate::ocr::TextRecognizer;
use crate::resilience::ResiliencePolicies;
use crate::storage::ContentStore;
use crate::summarizer::Summarizer;

/// Queue consumed by the extraction stage.
pub const QUEUE_EXTRACTION: &str = "extraction";
/// Queue consumed by the summarization stage.
pub const QUEUE_SUMMARIZATION: &str = "summarization";
/// Queue consumed by the result sink (bound to both downstream topics).
pub const QUEUE_RESULTS: &str = "results";

/// Bucket holding uploaded document content.
pub const BUCKET_DOCUMENTS: &str = "documents";

/// Dependency names under which external calls are wrapped.
pub const DEP_CONTENT_STORE: &str = "content-store";
pub const DEP_SUMMARIZER: &str = "summarizer";

/// Main service coordinator
pub struct PipelineService {
    pub config: Arc<StaticConfig>,
    pub db: Arc<Database>,
    pub broker: Arc<Broker>,
    pub store: Arc<ContentStore>,
    pub idempotency: Arc<IdempotencyGuard>,
    pub resilience: Arc<ResiliencePolicies>,
    pub recognizer: Arc<dyn TextRecognizer>,
    pub summarizer: Arc<dyn Summarizer>,
}

impl PipelineService {
    /// Create a new service instance and wire up the channel topology.
    pub fn new(
        config: Arc<StaticConfig>,
        db: Arc<Database>,
        recognizer: Arc<dyn TextRecognizer>,
        summarizer: Arc<dyn Summarizer>,
    ) -> ServiceResult<Arc<Self>> {
        info!("Initializing document pipeline service");

        let broker = Arc::new(Broker::new(config.broker.clone()));
        broker.declare_queue(QUEUE_EXTRACTION);
        broker.declare_queue(QUEUE_SUMMARIZATION);
        broker.declare_queue(QUEUE_RESULTS);
        broker.bind(QUEUE_EXTRACTION, TOPIC_DOCUMENT_CREATED)?;
        broker.bind(QUEUE_SUMMARIZATION, TOPIC_EXTRACTION_COMPLETED)?;
        // The sink owns every record mutation after ingest, so it watches
        // both downstream topics.
        broker.bind(QUEUE_RESULTS, TOPIC_EXTRACTION_COMPLETED)?;
        broker.bind(QUEUE_RESULTS, TOPIC_SUMMARY_RESULT)?;

        let store = Arc::new(ContentStore::new(&config.storage.data_dir));
        let idempotency = Arc::new(IdempotencyGuard::new(config.idempotency.ttl()));
        let resilience = Arc::new(ResiliencePolicies::new(&config.resilience));

        Ok(Arc::new(Self {
            config,
            db,
            broker,
            store,
            idempotency,
            resilience,
            recognizer,
            summarizer,
        }))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::StaticConfig;
    use crate::error::{ExtractionError, SummarizerError};
    use crate::ocr::RecognizedText;
    use crate::summarizer::GenerationParams;
    use async_trait::async_trait;
    use image::DynamicImage;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Recognizer returning fixed text for every page. Pages whose image
    /// width equals `fail_width` fail, to exercise partial-failure handling.
    pub struct FixedRecognizer {
        pub text: String,
        pub confidence: f64,
        pub fail_width: Option<u32>,
    }

    impl FixedRecognizer {
        pub fn new(text: impl Into<String>, confidence: f64) -> Self {
            Self {
                text: text.into(),
                confidence,
                fail_width: None,
            }
        }
    }

    impl crate::ocr::TextRecognizer for FixedRecognizer {
        fn recognize(&self, image: &DynamicImage) -> Result<RecognizedText, ExtractionError> {
            if Some(image.width()) == self.fail_width {
                return Err(ExtractionError::Recognition {
                    page: 0,
                    detail: "synthetic page failure".to_string(),
                });
            }
            Ok(RecognizedText {
                text: self.text.clone(),
                confidence: self.confidence,
            })
        }

        fn language(&self) -> &str {
            "eng"
        }
    }

    /// Scripted summarizer that counts calls.
    pub struct ScriptedSummarizer {
        pub configured: bool,
        pub response: Result<String, ()>,
        pub calls: AtomicU32,
    }

    impl ScriptedSummarizer {
        pub fn ok(summary: impl Into<String>) -> Self {
            Self {
                configured: true,
                response: Ok(summary.into()),
                calls: AtomicU32::new(0),
            }
        }

        pub fn failing() -> Self {
            Self {
                configured: true,
                response: Err(()),
                calls: AtomicU32::new(0),
            }
        }

        pub fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Summarizer for ScriptedSummarizer {
        fn is_configured(&self) -> bool {
            self.configured
        }

        async fn summarize(
            &self,
            _text: &str,
            _params: GenerationParams,
        ) -> Result<String, SummarizerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Ok(summary) => Ok(summary.clone()),
                Err(()) => Err(SummarizerError::Generation {
                    status: 400,
                    message: "scripted failure".to_string(),
                }),
            }
        }
    }

    /// Service wired against a temp data dir, an in-memory database, and the
    /// given test doubles.
    pub fn service_with(
        data_dir: &std::path::Path,
        recognizer: Arc<dyn TextRecognizer>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Arc<PipelineService> {
        let mut config = StaticConfig::default();
        config.storage.data_dir = data_dir.to_path_buf();
        config.resilience = crate::config::default_resilience_for_tests();

        let db = Arc::new(Database::open_in_memory().unwrap());
        PipelineService::new(Arc::new(config), db, recognizer, summarizer).unwrap()
    }

    /// A tiny in-memory PNG usable as single-image document content.
    pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::new_rgb8(width, height);
        let mut buf = Vec::new();
        image
            .write_to(
                &mut std::io::Cursor::new(&mut buf),
                image::ImageFormat::Png,
            )
            .unwrap();
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::db::DocumentStatus;
    use crate::events::EventPayload;

    /// Drain one delivery from a queue, panicking if none arrives promptly.
    async fn take_event(
        service: &Arc<PipelineService>,
        queue: &str,
    ) -> crate::events::StageEvent {
        let queue = service.broker.queue(queue).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), queue.next())
            .await
            .expect("timed out waiting for event")
            .expect("queue closed")
            .event
    }

    #[tokio::test]
    async fn happy_path_runs_created_to_completed() {
        let dir = tempfile::tempdir().unwrap();
        let text = "lorem ipsum ".repeat(42); // ~500 chars of extractable text
        let recognizer = Arc::new(FixedRecognizer::new(text, 88.0));
        let summarizer = Arc::new(ScriptedSummarizer::ok("A concise summary."));
        let service = service_with(dir.path(), recognizer, summarizer.clone());

        let record = service
            .create_document("Report", "report.png", Some("image/png".into()), &png_bytes(8, 8))
            .await
            .unwrap();
        assert_eq!(record.status, DocumentStatus::Extracting);

        // Stage 1: extraction consumes document.created.
        let created = take_event(&service, QUEUE_EXTRACTION).await;
        assert_eq!(created.message_id, format!("created-{}", record.id));
        service.process_created_event(&created).await.unwrap();

        // Stage 2: summarization consumes extraction.completed.
        let extracted = take_event(&service, QUEUE_SUMMARIZATION).await;
        match &extracted.payload {
            EventPayload::ExtractionCompleted {
                outcome: crate::events::ExtractionOutcome::Success {
                    mean_confidence,
                    total_pages,
                    ..
                },
            } => {
                assert!(*mean_confidence > 0.0);
                assert_eq!(*total_pages, 1);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        service.process_extraction_event(&extracted).await.unwrap();

        // Sink: first the extraction record update, then the summary result.
        let sink_extraction = take_event(&service, QUEUE_RESULTS).await;
        service.apply_result_event(&sink_extraction).await.unwrap();
        let sink_summary = take_event(&service, QUEUE_RESULTS).await;
        service.apply_result_event(&sink_summary).await.unwrap();

        let final_record = service.db.get_document(&record.id).unwrap().unwrap();
        assert_eq!(final_record.status, DocumentStatus::Completed);
        assert_eq!(final_record.summary.as_deref(), Some("A concise summary."));
        assert!(final_record.extracted_chars.unwrap() > 0);
        assert_eq!(summarizer.call_count(), 1);
    }

    #[tokio::test]
    async fn short_extracted_text_short_circuits_without_api_calls() {
        let dir = tempfile::tempdir().unwrap();
        let recognizer = Arc::new(FixedRecognizer::new("only 10ch", 95.0));
        let summarizer = Arc::new(ScriptedSummarizer::ok("never used"));
        let service = service_with(dir.path(), recognizer, summarizer.clone());

        let record = service
            .create_document("Tiny", "tiny.png", Some("image/png".into()), &png_bytes(8, 8))
            .await
            .unwrap();

        let created = take_event(&service, QUEUE_EXTRACTION).await;
        service.process_created_event(&created).await.unwrap();
        let extracted = take_event(&service, QUEUE_SUMMARIZATION).await;
        service.process_extraction_event(&extracted).await.unwrap();

        let sink_extraction = take_event(&service, QUEUE_RESULTS).await;
        service.apply_result_event(&sink_extraction).await.unwrap();
        let sink_summary = take_event(&service, QUEUE_RESULTS).await;
        match &sink_summary.payload {
            EventPayload::SummaryResult {
                outcome: crate::events::SummaryOutcome::Failure { reason },
            } => assert!(reason.contains("too short")),
            other => panic!("unexpected payload: {other:?}"),
        }
        service.apply_result_event(&sink_summary).await.unwrap();

        // The external API was never touched.
        assert_eq!(summarizer.call_count(), 0);
        let final_record = service.db.get_document(&record.id).unwrap().unwrap();
        assert_eq!(final_record.status, DocumentStatus::Failed);
        assert!(final_record.error.unwrap().contains("too short"));
    }

    #[tokio::test]
    async fn duplicate_delivery_is_absorbed_silently() {
        let dir = tempfile::tempdir().unwrap();
        let text = "some extractable text that is long enough to summarize just fine".repeat(2);
        let recognizer = Arc::new(FixedRecognizer::new(text, 80.0));
        let summarizer = Arc::new(ScriptedSummarizer::ok("Summary."));
        let service = service_with(dir.path(), recognizer, summarizer.clone());

        service
            .create_document("Dup", "dup.png", None, &png_bytes(8, 8))
            .await
            .unwrap();

        let created = take_event(&service, QUEUE_EXTRACTION).await;
        service.process_created_event(&created).await.unwrap();
        // Redelivery of the same message: no second extraction event appears.
        service.process_created_event(&created).await.unwrap();

        let queue = service.broker.queue(QUEUE_SUMMARIZATION).unwrap();
        let first = tokio::time::timeout(std::time::Duration::from_millis(200), queue.next())
            .await
            .unwrap();
        assert!(first.is_some());
        let second =
            tokio::time::timeout(std::time::Duration::from_millis(100), queue.next()).await;
        assert!(second.is_err(), "duplicate delivery produced a second event");
    }
}
