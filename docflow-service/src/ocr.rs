//! OCR engine boundary.
//!
//! Recognition is a pure, CPU-bound call: raster image in, text plus
//! confidence out. The Tesseract backend keeps one engine handle per worker
//! thread (the handle is not thread-safe, and re-initializing it per page
//! throws away its loaded language data), created lazily on first use.

use image::DynamicImage;

use crate::error::ExtractionError;

/// Output of recognizing one raster image.
#[derive(Debug, Clone)]
pub struct RecognizedText {
    pub text: String,
    /// Engine confidence, 0-100.
    pub confidence: f64,
}

/// Text recognition engine boundary.
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, image: &DynamicImage) -> Result<RecognizedText, ExtractionError>;

    /// Language code the engine is configured for.
    fn language(&self) -> &str;
}

/// Collapse runs of whitespace and strip control characters from raw engine
/// output.
pub fn clean_recognized_text(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut prev_was_space = false;
    let mut prev_was_newline = false;

    for c in text.chars() {
        if c == '\n' {
            if !prev_was_newline {
                result.push(c);
                prev_was_newline = true;
                prev_was_space = false;
            }
        } else if c.is_whitespace() {
            if !prev_was_space && !prev_was_newline {
                result.push(' ');
                prev_was_space = true;
            }
        } else if c.is_control() || c == '\u{FFFD}' {
            continue;
        } else {
            result.push(c);
            prev_was_space = false;
            prev_was_newline = false;
        }
    }

    result.trim().to_string()
}

#[cfg(feature = "ocr")]
pub use tesseract_backend::TesseractRecognizer;

#[cfg(feature = "ocr")]
mod tesseract_backend {
    use std::cell::RefCell;
    use std::io::Cursor;

    use image::DynamicImage;
    use tesseract::Tesseract;

    use super::{RecognizedText, TextRecognizer, clean_recognized_text};
    use crate::error::ExtractionError;

    thread_local! {
        // One engine per worker thread. Tesseract handles are not Sync and
        // initialization loads language data from disk, so the handle is
        // created lazily and parked here between pages.
        static ENGINE: RefCell<Option<Tesseract>> = const { RefCell::new(None) };
    }

    /// Tesseract-backed recognizer.
    pub struct TesseractRecognizer {
        language: String,
        /// Tesseract page segmentation mode; 3 = fully automatic.
        page_seg_mode: i32,
    }

    impl TesseractRecognizer {
        pub fn new(language: impl Into<String>) -> Self {
            Self {
                language: language.into(),
                page_seg_mode: 3,
            }
        }

        fn init_engine(&self) -> Result<Tesseract, ExtractionError> {
            let engine = Tesseract::new(None, Some(&self.language)).map_err(|e| {
                ExtractionError::EngineUnavailable {
                    detail: e.to_string(),
                }
            })?;
            engine
                .set_variable("tessedit_pageseg_mode", &self.page_seg_mode.to_string())
                .map_err(|e| ExtractionError::EngineUnavailable {
                    detail: e.to_string(),
                })
        }
    }

    impl TextRecognizer for TesseractRecognizer {
        fn recognize(&self, image: &DynamicImage) -> Result<RecognizedText, ExtractionError> {
            let mut png = Vec::new();
            image
                .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
                .map_err(|e| ExtractionError::Recognition {
                    page: 0,
                    detail: format!("failed to encode page image: {e}"),
                })?;

            ENGINE.with(|cell| {
                let engine = match cell.borrow_mut().take() {
                    Some(engine) => engine,
                    None => self.init_engine()?,
                };

                let mut engine = engine.set_image_from_mem(&png).map_err(|e| {
                    ExtractionError::Recognition {
                        page: 0,
                        detail: e.to_string(),
                    }
                })?;

                let text = engine
                    .get_text()
                    .map_err(|e| ExtractionError::Recognition {
                        page: 0,
                        detail: e.to_string(),
                    })?;
                let confidence = f64::from(engine.mean_text_conf()).clamp(0.0, 100.0);

                cell.borrow_mut().replace(engine);

                Ok(RecognizedText {
                    text: clean_recognized_text(&text),
                    confidence,
                })
            })
        }

        fn language(&self) -> &str {
            &self.language
        }
    }
}

/// Recognizer wired in when the `ocr` feature is off. Produces empty results
/// so builds without libtesseract stay runnable end to end; real deployments
/// enable the feature.
#[cfg(not(feature = "ocr"))]
pub struct StubRecognizer {
    language: String,
}

#[cfg(not(feature = "ocr"))]
impl StubRecognizer {
    pub fn new(language: impl Into<String>) -> Self {
        tracing::warn!(
            "Built without the `ocr` feature; text recognition returns empty results"
        );
        Self {
            language: language.into(),
        }
    }
}

#[cfg(not(feature = "ocr"))]
impl TextRecognizer for StubRecognizer {
    fn recognize(&self, _image: &DynamicImage) -> Result<RecognizedText, ExtractionError> {
        Ok(RecognizedText {
            text: String::new(),
            confidence: 0.0,
        })
    }

    fn language(&self) -> &str {
        &self.language
    }
}

/// Default recognizer for the configured language: Tesseract when the `ocr`
/// feature is enabled, the stub otherwise.
pub fn default_recognizer(language: &str) -> std::sync::Arc<dyn TextRecognizer> {
    #[cfg(feature = "ocr")]
    {
        std::sync::Arc::new(TesseractRecognizer::new(language))
    }
    #[cfg(not(feature = "ocr"))]
    {
        std::sync::Arc::new(StubRecognizer::new(language))
    }
}
