//! Summarization stage: turn extracted text into a generated summary.
//!
//! Preconditions that are already known to fail (failed extraction, text too
//! short, missing credentials) short-circuit to a FAILURE result before any
//! API traffic happens, so no quota is wasted on calls with a predetermined
//! answer.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{info, warn};

use crate::config::FallbackPolicy;
use crate::error::ServiceResult;
use crate::events::{
    EventPayload, ExtractionOutcome, StageEvent, SummaryOutcome, TOPIC_SUMMARY_RESULT,
    summary_message_id,
};
use crate::service::{DEP_SUMMARIZER, PipelineService};
use crate::summarizer::GenerationParams;

impl PipelineService {
    /// Handle one `extraction.completed` delivery (called by summarization
    /// workers).
    pub(crate) async fn process_extraction_event(&self, event: &StageEvent) -> ServiceResult<()> {
        let EventPayload::ExtractionCompleted { outcome } = &event.payload else {
            warn!(message_id = %event.message_id, "Unexpected payload on summarization queue, dropping");
            return Ok(());
        };

        let message_id = summary_message_id(&event.document_id);
        if !self.idempotency.try_claim(&message_id) {
            return Ok(());
        }

        let result = self.summarize_document(event, outcome).await;
        if result.is_err() {
            self.idempotency.release(&message_id);
        }
        result
    }

    async fn summarize_document(
        &self,
        event: &StageEvent,
        outcome: &ExtractionOutcome,
    ) -> ServiceResult<()> {
        let doc_id = &event.document_id;
        let config = &self.config.summarizer;

        // Preconditions, checked without touching the external API.
        let text = match outcome {
            ExtractionOutcome::Failure { reason } => {
                return self
                    .publish_summary_failure(event, format!("extraction failed: {reason}"))
                    .await;
            }
            ExtractionOutcome::Success { text, .. } => text,
        };

        let chars = text.chars().count();
        if chars < config.min_input_chars {
            return self
                .publish_summary_failure(
                    event,
                    format!(
                        "extracted text too short ({chars} chars, minimum {})",
                        config.min_input_chars
                    ),
                )
                .await;
        }

        if !self.summarizer.is_configured() {
            return self
                .publish_summary_failure(
                    event,
                    crate::error::SummarizerError::NotConfigured.to_string(),
                )
                .await;
        }

        let input: Arc<String> = Arc::new(truncate_at_boundary(text, config.max_input_chars));
        if input.chars().count() < chars {
            info!(
                doc_id = %doc_id,
                original_chars = chars,
                truncated_chars = input.chars().count(),
                "Input truncated before summarization"
            );
        }

        let params = GenerationParams {
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        };
        let fallback_policy = config.fallback_policy;
        let started = Instant::now();

        let summarizer = self.summarizer.clone();
        let call_input = input.clone();
        let outcome = self
            .resilience
            .call_with_fallback(
                DEP_SUMMARIZER,
                move |_attempt| {
                    let summarizer = summarizer.clone();
                    let input = call_input.clone();
                    async move { summarizer.summarize(&input, params).await }
                },
                |error| match fallback_policy {
                    FallbackPolicy::Degraded => {
                        warn!(doc_id = %doc_id, error = %error, "Summarizer unavailable, using degraded placeholder");
                        Some(degraded_summary(&event.title))
                    }
                    FallbackPolicy::Fail => None,
                },
            )
            .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(recovered) => {
                let degraded = recovered.is_fallback();
                let summary = recovered.into_inner();
                histogram!("docflow_summarize_duration_ms").record(elapsed_ms as f64);
                if degraded {
                    counter!("docflow_summaries_degraded_total").increment(1);
                }
                info!(
                    doc_id = %doc_id,
                    chars = summary.chars().count(),
                    degraded,
                    elapsed_ms,
                    "Summary produced"
                );
                self.publish_summary_outcome(
                    event,
                    SummaryOutcome::Success {
                        summary,
                        degraded,
                        elapsed_ms,
                    },
                )
                .await
            }
            Err(e) => {
                self.publish_summary_failure(event, format!("summarization failed: {e}"))
                    .await
            }
        }
    }

    async fn publish_summary_failure(
        &self,
        event: &StageEvent,
        reason: String,
    ) -> ServiceResult<()> {
        counter!("docflow_summary_failures_total").increment(1);
        warn!(doc_id = %event.document_id, reason = %reason, "Summarization failed terminally");
        self.publish_summary_outcome(event, SummaryOutcome::Failure { reason })
            .await
    }

    async fn publish_summary_outcome(
        &self,
        event: &StageEvent,
        outcome: SummaryOutcome,
    ) -> ServiceResult<()> {
        let result =
            StageEvent::summary_result(event.document_id.clone(), event.title.clone(), outcome);
        self.broker.publish(TOPIC_SUMMARY_RESULT, &result).await?;
        Ok(())
    }
}

/// Placeholder text published when the summarizer dependency is down and the
/// fallback policy asks for a degraded result.
fn degraded_summary(title: &str) -> String {
    format!(
        "[degraded] Automatic summary for \"{title}\" is unavailable; \
        the summarization service could not be reached."
    )
}

/// Truncate `text` to at most `max_chars` characters.
///
/// When a sentence or line boundary exists in the allowed prefix past its
/// midpoint, the cut lands exactly after that boundary; otherwise the text
/// is hard-truncated with a trailing ellipsis.
pub(crate) fn truncate_at_boundary(text: &str, max_chars: usize) -> String {
    let total_chars = text.chars().count();
    if total_chars <= max_chars {
        return text.to_string();
    }

    // Byte offsets of the midpoint character and the first character past
    // the limit.
    let mid_byte = text
        .char_indices()
        .nth(max_chars / 2)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let cut_byte = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let prefix = &text[..cut_byte];

    let boundary_end = prefix
        .char_indices()
        .filter(|(i, c)| *i >= mid_byte && matches!(c, '.' | '!' | '?' | '\n'))
        .map(|(i, c)| i + c.len_utf8())
        .next_back();

    match boundary_end {
        Some(end) => prefix[..end].to_string(),
        None => {
            let mut out: String = prefix.chars().take(max_chars.saturating_sub(1)).collect();
            out.push('…');
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::QUEUE_RESULTS;
    use crate::service::test_support::*;
    use std::sync::Arc;

    #[test]
    fn short_input_is_untouched() {
        assert_eq!(truncate_at_boundary("hello. world", 50), "hello. world");
    }

    #[test]
    fn truncation_ends_at_the_last_sentence_boundary_past_the_midpoint() {
        // 60k chars with a sentence boundary past char 25k.
        let mut text = "a".repeat(30_000);
        text.push_str("End of part one.");
        text.push_str(&"b".repeat(30_000));

        let truncated = truncate_at_boundary(&text, 50_000);
        assert!(truncated.chars().count() <= 50_000);
        assert!(truncated.ends_with("End of part one."));
        assert_eq!(truncated.chars().count(), 30_016);
    }

    #[test]
    fn truncation_without_boundary_hard_cuts_with_ellipsis() {
        let text = "x".repeat(60_000);
        let truncated = truncate_at_boundary(&text, 50_000);
        assert_eq!(truncated.chars().count(), 50_000);
        assert!(truncated.ends_with('…'));
    }

    #[test]
    fn boundary_before_the_midpoint_does_not_count() {
        let mut text = "Intro. ".to_string();
        text.push_str(&"y".repeat(200));
        let truncated = truncate_at_boundary(&text, 100);
        // The only boundary sits at the start, well before char 50.
        assert!(truncated.ends_with('…'));
        assert_eq!(truncated.chars().count(), 100);
    }

    fn extraction_success_event(doc_id: &str, text: &str) -> StageEvent {
        StageEvent::extraction_completed(
            doc_id,
            "Title",
            ExtractionOutcome::Success {
                text: text.to_string(),
                mean_confidence: 90.0,
                total_pages: 1,
                pages: vec![],
                language: "eng".to_string(),
            },
        )
    }

    async fn next_summary_outcome(service: &Arc<PipelineService>) -> SummaryOutcome {
        let queue = service.broker.queue(QUEUE_RESULTS).unwrap();
        loop {
            let delivery = tokio::time::timeout(std::time::Duration::from_secs(5), queue.next())
                .await
                .unwrap()
                .unwrap();
            if let EventPayload::SummaryResult { outcome } = delivery.event.payload {
                return outcome;
            }
        }
    }

    #[tokio::test]
    async fn failed_extraction_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let summarizer = Arc::new(ScriptedSummarizer::ok("unused"));
        let service = service_with(
            dir.path(),
            Arc::new(FixedRecognizer::new("unused", 0.0)),
            summarizer.clone(),
        );

        let event = StageEvent::extraction_completed(
            "doc-1",
            "Title",
            ExtractionOutcome::Failure {
                reason: "corrupt file".to_string(),
            },
        );
        service.process_extraction_event(&event).await.unwrap();

        match next_summary_outcome(&service).await {
            SummaryOutcome::Failure { reason } => {
                assert!(reason.contains("extraction failed"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(summarizer.call_count(), 0);
    }

    #[tokio::test]
    async fn degraded_fallback_is_published_as_marked_success() {
        let dir = tempfile::tempdir().unwrap();
        let summarizer = Arc::new(ScriptedSummarizer::failing());
        let service = service_with(
            dir.path(),
            Arc::new(FixedRecognizer::new("unused", 0.0)),
            summarizer.clone(),
        );

        let text = "long enough extracted text to pass the minimum length check".repeat(2);
        let event = extraction_success_event("doc-1", &text);
        service.process_extraction_event(&event).await.unwrap();

        match next_summary_outcome(&service).await {
            SummaryOutcome::Success {
                summary, degraded, ..
            } => {
                assert!(degraded);
                assert!(summary.starts_with("[degraded]"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // Scripted failure is permanent (4xx), so exactly one call was made.
        assert_eq!(summarizer.call_count(), 1);
    }

    #[tokio::test]
    async fn fail_policy_publishes_failure_instead() {
        let dir = tempfile::tempdir().unwrap();
        let summarizer = Arc::new(ScriptedSummarizer::failing());
        let service = {
            let mut config = crate::config::StaticConfig::default();
            config.storage.data_dir = dir.path().to_path_buf();
            config.resilience = crate::config::default_resilience_for_tests();
            config.summarizer.fallback_policy = FallbackPolicy::Fail;
            let db = Arc::new(crate::db::Database::open_in_memory().unwrap());
            PipelineService::new(
                Arc::new(config),
                db,
                Arc::new(FixedRecognizer::new("unused", 0.0)),
                summarizer.clone(),
            )
            .unwrap()
        };

        let text = "long enough extracted text to pass the minimum length check".repeat(2);
        let event = extraction_success_event("doc-1", &text);
        service.process_extraction_event(&event).await.unwrap();

        match next_summary_outcome(&service).await {
            SummaryOutcome::Failure { reason } => {
                assert!(reason.contains("summarization failed"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
