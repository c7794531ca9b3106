//! Secondary OCR: re-read a page image with a vision model via Ollama.
//!
//! Used only by the last escalation tier. The prompt asks for a plain
//! line-by-line transcription so numbered headers land on their own line.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;

use super::types::{VisionOcrEngine, VisionOcrResult};
use super::ExtractionError;
use crate::pipeline::completion::VisionClient;

// ──────────────────────────────────────────────
// Prompts
// ──────────────────────────────────────────────

pub const VISION_SYSTEM_PROMPT: &str = "\
You transcribe scanned book pages. Output only the text you see, one printed line per \
output line, in reading order. Do not add commentary, headings or formatting.";

pub const VISION_USER_PROMPT: &str = "\
Transcribe this gamebook page line by line. Section numbers printed on their own line \
must stay on their own line exactly as printed.";

// ──────────────────────────────────────────────
// OllamaVisionOcr
// ──────────────────────────────────────────────

/// Production vision OCR engine backed by any `VisionClient`.
pub struct OllamaVisionOcr {
    vision_client: Arc<dyn VisionClient>,
    model_name: String,
}

impl OllamaVisionOcr {
    pub fn new(vision_client: Arc<dyn VisionClient>, model_name: String) -> Self {
        Self {
            vision_client,
            model_name,
        }
    }
}

impl VisionOcrEngine for OllamaVisionOcr {
    fn extract_text_from_image(
        &self,
        image_bytes: &[u8],
    ) -> Result<VisionOcrResult, ExtractionError> {
        let _span = tracing::info_span!(
            "vision_ocr_extract",
            model = %self.model_name,
            image_size = image_bytes.len(),
        )
        .entered();
        let start = std::time::Instant::now();

        let images = vec![base64::engine::general_purpose::STANDARD.encode(image_bytes)];
        let raw = self
            .vision_client
            .chat_with_images(
                &self.model_name,
                VISION_USER_PROMPT,
                &images,
                Some(VISION_SYSTEM_PROMPT),
            )
            .map_err(|e| ExtractionError::OcrProcessing(e.to_string()))?;

        let text = strip_code_fences(&raw);
        let confidence = compute_heuristic_confidence(&text);

        tracing::info!(
            model = %self.model_name,
            elapsed_ms = %start.elapsed().as_millis(),
            lines = text.lines().count(),
            confidence,
            "Vision OCR transcription complete"
        );

        Ok(VisionOcrResult {
            text,
            model_used: self.model_name.clone(),
            confidence,
        })
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Some models wrap the transcription in a ``` block anyway.
fn strip_code_fences(response: &str) -> String {
    response
        .trim()
        .lines()
        .filter(|l| !l.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Vision models give no per-word confidence; estimate from output shape.
///
/// Empty output is 0.0. Otherwise the base grows with line count and is
/// reduced when most characters are neither alphanumeric nor punctuation.
fn compute_heuristic_confidence(text: &str) -> f32 {
    if text.trim().is_empty() {
        return 0.0;
    }

    let lines = text.lines().filter(|l| !l.trim().is_empty()).count();
    let base: f32 = match lines {
        0..=2 => 0.3,
        3..=9 => 0.5,
        10..=24 => 0.7,
        _ => 0.8,
    };

    let total = text.chars().filter(|c| !c.is_whitespace()).count().max(1);
    let readable = text
        .chars()
        .filter(|c| c.is_alphanumeric() || ".,;:!?'\"-()".contains(*c))
        .count();
    let ratio = readable as f32 / total as f32;

    if ratio < 0.6 {
        (base - 0.2).max(0.1)
    } else {
        base
    }
}

// ──────────────────────────────────────────────
// MockVisionOcr (testing)
// ──────────────────────────────────────────────

/// Mock vision OCR engine for testing.
///
/// Answers with a per-image transcription keyed by the exact image bytes,
/// falling back to a default text.
pub struct MockVisionOcr {
    default_text: String,
    by_image: HashMap<Vec<u8>, String>,
    model_name: String,
    fail: bool,
}

impl MockVisionOcr {
    pub fn new(default_text: &str, model_name: &str) -> Self {
        Self {
            default_text: default_text.to_string(),
            by_image: HashMap::new(),
            model_name: model_name.to_string(),
            fail: false,
        }
    }

    pub fn with_page(mut self, image_bytes: &[u8], text: &str) -> Self {
        self.by_image.insert(image_bytes.to_vec(), text.to_string());
        self
    }

    pub fn failing(model_name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new("", model_name)
        }
    }
}

impl VisionOcrEngine for MockVisionOcr {
    fn extract_text_from_image(
        &self,
        image_bytes: &[u8],
    ) -> Result<VisionOcrResult, ExtractionError> {
        if self.fail {
            return Err(ExtractionError::OcrProcessing("mock vision failure".into()));
        }
        let text = self
            .by_image
            .get(image_bytes)
            .cloned()
            .unwrap_or_else(|| self.default_text.clone());
        Ok(VisionOcrResult {
            confidence: compute_heuristic_confidence(&text),
            text,
            model_used: self.model_name.clone(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::completion::{CompletionError, MockVisionClient};

    #[test]
    fn transcription_strips_fences() {
        let mock = Arc::new(MockVisionClient::new("```\nThe wolf flees.\n80\nYou enter.\n```"));
        let ocr = OllamaVisionOcr::new(mock, "llama3.2-vision".into());
        let result = ocr.extract_text_from_image(b"img").unwrap();
        assert_eq!(result.lines(), vec!["The wolf flees.", "80", "You enter."]);
        assert_eq!(result.model_used, "llama3.2-vision");
    }

    #[test]
    fn client_error_maps_to_extraction_error() {
        struct Down;
        impl VisionClient for Down {
            fn chat_with_images(
                &self,
                _model: &str,
                _prompt: &str,
                _images: &[String],
                _system: Option<&str>,
            ) -> Result<String, CompletionError> {
                Err(CompletionError::OllamaConnection("http://localhost:11434".into()))
            }
        }
        let ocr = OllamaVisionOcr::new(Arc::new(Down), "m".into());
        let err = ocr.extract_text_from_image(b"img").unwrap_err();
        assert!(err.to_string().contains("Vision OCR failed"), "{err}");
    }

    #[test]
    fn confidence_heuristic() {
        assert_eq!(compute_heuristic_confidence(""), 0.0);
        assert!((compute_heuristic_confidence("80") - 0.3).abs() < f32::EPSILON);
        let page = (0..12).map(|i| format!("Line {i} of text.")).collect::<Vec<_>>().join("\n");
        assert!((compute_heuristic_confidence(&page) - 0.7).abs() < f32::EPSILON);
        assert!(compute_heuristic_confidence("#### ~~~~ @@@@") < 0.3);
    }

    #[test]
    fn mock_answers_per_image() {
        let mock = MockVisionOcr::new("", "m").with_page(b"page-12", "12\nText.");
        assert_eq!(mock.extract_text_from_image(b"page-12").unwrap().text, "12\nText.");
        assert_eq!(mock.extract_text_from_image(b"other").unwrap().text, "");
        assert!(MockVisionOcr::failing("m").extract_text_from_image(b"x").is_err());
    }
}
