//! Consumer worker pools for the pipeline stages.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{Delivery, Queue};
use crate::error::FailureClass;
use crate::service::{PipelineService, QUEUE_EXTRACTION, QUEUE_RESULTS, QUEUE_SUMMARIZATION};

/// Pipeline stage a worker pool serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extraction,
    Summarization,
    ResultSink,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Summarization => "summarization",
            Stage::ResultSink => "result_sink",
        }
    }

    fn queue_name(&self) -> &'static str {
        match self {
            Stage::Extraction => QUEUE_EXTRACTION,
            Stage::Summarization => QUEUE_SUMMARIZATION,
            Stage::ResultSink => QUEUE_RESULTS,
        }
    }
}

impl PipelineService {
    /// Start every stage's consumer pool.
    /// This should be called once on service startup.
    pub fn start_workers(service: &Arc<PipelineService>, shutdown: &CancellationToken) {
        let workers = &service.config.workers;
        Self::spawn_consumers(service, Stage::Extraction, workers.extraction, shutdown);
        Self::spawn_consumers(
            service,
            Stage::Summarization,
            workers.summarization,
            shutdown,
        );
        Self::spawn_consumers(service, Stage::ResultSink, workers.result_sink, shutdown);
    }

    fn spawn_consumers(
        service: &Arc<PipelineService>,
        stage: Stage,
        count: usize,
        shutdown: &CancellationToken,
    ) {
        for worker in 0..count.max(1) {
            let service = service.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let Some(queue) = service.broker.queue(stage.queue_name()) else {
                    error!(stage = stage.as_str(), "Queue missing at worker startup");
                    return;
                };

                info!(stage = stage.as_str(), worker, "Consumer started");
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        delivery = queue.next() => {
                            let Some(delivery) = delivery else { break };
                            service.dispatch(stage, delivery, &queue).await;
                        }
                    }
                }
                info!(stage = stage.as_str(), worker, "Consumer stopped");
            });
        }
    }

    /// Run one delivery through its stage handler and settle it.
    ///
    /// Ok acknowledges. A transient error hands the message back to the
    /// broker for redelivery; anything else is a semantic failure that a
    /// redelivery cannot fix, so it is logged and acknowledged.
    async fn dispatch(&self, stage: Stage, delivery: Delivery, queue: &Arc<Queue>) {
        let message_id = delivery.event.message_id.clone();
        let result = match stage {
            Stage::Extraction => self.process_created_event(&delivery.event).await,
            Stage::Summarization => self.process_extraction_event(&delivery.event).await,
            Stage::ResultSink => self.apply_result_event(&delivery.event).await,
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                warn!(
                    stage = stage.as_str(),
                    message_id = %message_id,
                    error = %e,
                    "Transient failure, returning message to the broker"
                );
                if let Err(requeue_err) = queue.requeue(delivery).await {
                    error!(
                        stage = stage.as_str(),
                        message_id = %message_id,
                        error = %requeue_err,
                        "Requeue failed, message lost"
                    );
                }
            }
            Err(e) => {
                error!(
                    stage = stage.as_str(),
                    message_id = %message_id,
                    error = %e,
                    "Non-retryable failure, dropping message"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DocumentStatus;
    use crate::service::test_support::*;
    use std::time::Duration;

    /// Full pipeline with real worker pools: upload a document and wait for
    /// the record to complete.
    #[tokio::test]
    async fn worker_pools_drive_a_document_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let text = "meaningful extracted content ".repeat(10);
        let service = service_with(
            dir.path(),
            std::sync::Arc::new(FixedRecognizer::new(text, 92.0)),
            std::sync::Arc::new(ScriptedSummarizer::ok("Pipeline summary.")),
        );

        let shutdown = CancellationToken::new();
        PipelineService::start_workers(&service, &shutdown);

        let record = service
            .create_document("Piped", "piped.png", None, &png_bytes(8, 8))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let loaded = service.db.get_document(&record.id).unwrap().unwrap();
            if loaded.status == DocumentStatus::Completed {
                assert_eq!(loaded.summary.as_deref(), Some("Pipeline summary."));
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "document stuck in {:?}",
                loaded.status
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        shutdown.cancel();
    }
}
