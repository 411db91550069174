//! Extraction stage: turn raw content into text.
//!
//! Consumes `document.created`, fetches the content, renders it to one
//! raster image per page, recognizes each page independently, and publishes
//! a terminal `extraction.completed` event. A page failure is recorded as an
//! empty zero-confidence result rather than failing the document; a total
//! failure (corrupt file, unreachable store) still publishes a FAILURE event
//! so the document never silently stalls.

use std::time::Instant;

use bytes::Bytes;
use futures::StreamExt;
use image::DynamicImage;
use metrics::{counter, histogram};
use pdfium_render::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{ExtractionError, ServiceResult};
use crate::events::{
    EventPayload, ExtractionOutcome, PageResult, StageEvent, TOPIC_EXTRACTION_COMPLETED,
    extraction_message_id,
};
use crate::service::{DEP_CONTENT_STORE, PipelineService};

/// Page texts are joined with a form feed, the conventional page separator.
const PAGE_MARKER: char = '\u{000C}';

/// Content kind as determined by magic-number sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContentKind {
    Pdf,
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
    Tiff,
}

impl ContentKind {
    pub(crate) fn mime_type(&self) -> &'static str {
        match self {
            ContentKind::Pdf => "application/pdf",
            ContentKind::Png => "image/png",
            ContentKind::Jpeg => "image/jpeg",
            ContentKind::Gif => "image/gif",
            ContentKind::Webp => "image/webp",
            ContentKind::Bmp => "image/bmp",
            ContentKind::Tiff => "image/tiff",
        }
    }

    fn is_multi_page(&self) -> bool {
        matches!(self, ContentKind::Pdf)
    }
}

/// Sniff the content kind from magic bytes.
pub(crate) fn detect_content_kind(data: &[u8]) -> Option<ContentKind> {
    if data.len() < 8 {
        return None;
    }

    if data.starts_with(b"%PDF") {
        return Some(ContentKind::Pdf);
    }
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(ContentKind::Png);
    }
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(ContentKind::Jpeg);
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Some(ContentKind::Gif);
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return Some(ContentKind::Webp);
    }
    if data.starts_with(b"BM") {
        return Some(ContentKind::Bmp);
    }
    if data.starts_with(&[0x49, 0x49, 0x2A, 0x00]) || data.starts_with(&[0x4D, 0x4D, 0x00, 0x2A]) {
        return Some(ContentKind::Tiff);
    }

    None
}

impl PipelineService {
    /// Handle one `document.created` delivery (called by extraction workers).
    pub(crate) async fn process_created_event(&self, event: &StageEvent) -> ServiceResult<()> {
        let EventPayload::DocumentCreated {
            bucket,
            key,
            declared_type,
        } = &event.payload
        else {
            warn!(message_id = %event.message_id, "Unexpected payload on extraction queue, dropping");
            return Ok(());
        };

        let message_id = extraction_message_id(&event.document_id);
        if !self.idempotency.try_claim(&message_id) {
            return Ok(());
        }

        let result = self
            .extract_document(event, bucket, key, declared_type.as_deref())
            .await;
        if result.is_err() {
            // Let a redelivery retry the work.
            self.idempotency.release(&message_id);
        }
        result
    }

    async fn extract_document(
        &self,
        event: &StageEvent,
        bucket: &str,
        key: &str,
        declared_type: Option<&str>,
    ) -> ServiceResult<()> {
        let doc_id = &event.document_id;
        let started = Instant::now();
        info!(doc_id = %doc_id, title = %event.title, "Starting text extraction");

        // Step 1: fetch content bytes through the resilience envelope.
        let store = self.store.clone();
        let fetch_bucket = bucket.to_string();
        let fetch_key = key.to_string();
        let content = match self
            .resilience
            .call(DEP_CONTENT_STORE, move |_attempt| {
                let store = store.clone();
                let bucket = fetch_bucket.clone();
                let key = fetch_key.clone();
                async move { store.get(&bucket, &key) }
            })
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(doc_id = %doc_id, error = %e, "Content fetch failed");
                return self
                    .publish_extraction_failure(event, format!("content fetch failed: {e}"))
                    .await;
            }
        };

        // Step 2: trust a magic-number sniff over the declared content type.
        let kind = match detect_content_kind(&content) {
            Some(kind) => kind,
            None => {
                let err = ExtractionError::UnsupportedFormat {
                    detail: "unrecognized magic bytes".to_string(),
                };
                return self.publish_extraction_failure(event, err.to_string()).await;
            }
        };
        if let Some(declared) = declared_type {
            if declared != kind.mime_type() {
                warn!(
                    doc_id = %doc_id,
                    declared = %declared,
                    detected = %kind.mime_type(),
                    "Declared content type disagrees with sniffed type, proceeding with the sniff"
                );
            }
        }

        // Step 3: one raster image per page.
        let images = if kind.is_multi_page() {
            match render_pdf_pages(content, self.config.extraction.render_target_pixels).await {
                Ok(images) => images,
                Err(e) => {
                    return self
                        .publish_extraction_failure(event, format!("page rendering failed: {e}"))
                        .await;
                }
            }
        } else {
            match image::load_from_memory(&content) {
                Ok(image) => vec![image],
                Err(e) => {
                    return self
                        .publish_extraction_failure(event, format!("corrupt image content: {e}"))
                        .await;
                }
            }
        };

        if images.is_empty() {
            return self
                .publish_extraction_failure(event, "document has no pages".to_string())
                .await;
        }

        // Step 4: recognize every page; failures degrade to empty pages.
        let pages = self.recognize_pages(images).await;
        let total_pages = pages.len();
        let failed_pages = pages.iter().filter(|p| !p.success).count();

        // Step 5: aggregate.
        let text = pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join(&PAGE_MARKER.to_string());
        let mean_confidence =
            pages.iter().map(|p| p.confidence).sum::<f64>() / total_pages as f64;

        counter!("docflow_extraction_pages_total").increment(total_pages as u64);
        if failed_pages > 0 {
            counter!("docflow_extraction_page_failures_total").increment(failed_pages as u64);
        }
        histogram!("docflow_extraction_duration_ms")
            .record(started.elapsed().as_millis() as f64);
        info!(
            doc_id = %doc_id,
            pages = total_pages,
            failed_pages,
            chars = text.chars().count(),
            mean_confidence,
            "Text extraction complete"
        );

        let outcome = ExtractionOutcome::Success {
            text,
            mean_confidence,
            total_pages,
            pages,
            language: self.recognizer.language().to_string(),
        };
        self.publish_extraction_outcome(event, outcome).await
    }

    /// Recognize pages concurrently. Each recognition runs on the blocking
    /// pool; the engine handle is thread-local to the pool thread, so pages
    /// run truly in parallel without sharing a handle.
    async fn recognize_pages(&self, images: Vec<DynamicImage>) -> Vec<PageResult> {
        let parallelism = self.config.extraction.page_parallelism.max(1);

        let mut pages: Vec<PageResult> = futures::stream::iter(
            images.into_iter().enumerate().map(|(index, image)| {
                let recognizer = self.recognizer.clone();
                async move {
                    let page_number = index + 1;
                    let page_started = Instant::now();
                    let joined =
                        tokio::task::spawn_blocking(move || recognizer.recognize(&image)).await;
                    let elapsed_ms = page_started.elapsed().as_millis() as u64;

                    match joined {
                        Ok(Ok(recognized)) => {
                            debug!(
                                page = page_number,
                                chars = recognized.text.chars().count(),
                                confidence = recognized.confidence,
                                "Page recognized"
                            );
                            PageResult {
                                page_number,
                                text: recognized.text,
                                confidence: recognized.confidence,
                                success: true,
                                elapsed_ms,
                            }
                        }
                        Ok(Err(e)) => {
                            warn!(page = page_number, error = %e, "Page recognition failed");
                            PageResult::failed(page_number, elapsed_ms)
                        }
                        Err(e) => {
                            warn!(page = page_number, error = %e, "Page recognition task panicked");
                            PageResult::failed(page_number, elapsed_ms)
                        }
                    }
                }
            }),
        )
        .buffer_unordered(parallelism)
        .collect()
        .await;

        pages.sort_by_key(|p| p.page_number);
        pages
    }

    async fn publish_extraction_failure(
        &self,
        event: &StageEvent,
        reason: String,
    ) -> ServiceResult<()> {
        counter!("docflow_extraction_failures_total").increment(1);
        warn!(doc_id = %event.document_id, reason = %reason, "Extraction failed terminally");
        self.publish_extraction_outcome(event, ExtractionOutcome::Failure { reason })
            .await
    }

    async fn publish_extraction_outcome(
        &self,
        event: &StageEvent,
        outcome: ExtractionOutcome,
    ) -> ServiceResult<()> {
        let completed =
            StageEvent::extraction_completed(event.document_id.clone(), event.title.clone(), outcome);
        self.broker
            .publish(TOPIC_EXTRACTION_COMPLETED, &completed)
            .await?;
        Ok(())
    }
}

/// Rasterise every page of a PDF. Pdfium is CPU-bound and not async-safe, so
/// the work runs on the blocking pool.
async fn render_pdf_pages(
    content: Bytes,
    target_pixels: u32,
) -> Result<Vec<DynamicImage>, ExtractionError> {
    tokio::task::spawn_blocking(move || render_pdf_pages_blocking(&content, target_pixels))
        .await
        .map_err(|e| ExtractionError::CorruptDocument {
            detail: format!("render task panicked: {e}"),
        })?
}

fn render_pdf_pages_blocking(
    content: &[u8],
    target_pixels: u32,
) -> Result<Vec<DynamicImage>, ExtractionError> {
    let pdfium = create_pdfium()?;
    let document = pdfium.load_pdf_from_byte_slice(content, None).map_err(|e| {
        ExtractionError::CorruptDocument {
            detail: format!("{e:?}"),
        }
    })?;

    let render_config = PdfRenderConfig::new()
        .set_target_width(target_pixels as i32)
        .set_maximum_height(target_pixels as i32);

    let mut images = Vec::with_capacity(document.pages().len() as usize);
    for (index, page) in document.pages().iter().enumerate() {
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| ExtractionError::Render {
                page: index + 1,
                detail: format!("{e:?}"),
            })?;
        images.push(bitmap.as_image());
    }

    debug!(pages = images.len(), "PDF pages rasterised");
    Ok(images)
}

/// Create a Pdfium instance (dynamically linked).
///
/// Searches for libpdfium next to the binary, then under vendor/pdfium/lib/,
/// then in system library paths.
fn create_pdfium() -> Result<Pdfium, ExtractionError> {
    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(
                "./vendor/pdfium/lib/",
            ))
        })
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| ExtractionError::EngineUnavailable {
            detail: format!("failed to load the PDFium library: {e:?}"),
        })?;

    Ok(Pdfium::new(bindings))
}
