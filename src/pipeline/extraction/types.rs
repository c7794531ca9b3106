use serde::{Deserialize, Serialize};

use super::ExtractionError;

/// Transcription of one page image by a vision model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisionOcrResult {
    pub text: String,
    pub model_used: String,
    pub confidence: f32,
}

impl VisionOcrResult {
    /// Non-empty trimmed lines in reading order.
    pub fn lines(&self) -> Vec<&str> {
        self.text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect()
    }
}

/// Vision OCR engine abstraction (allows mocking for tests)
pub trait VisionOcrEngine: Send + Sync {
    fn extract_text_from_image(
        &self,
        image_bytes: &[u8],
    ) -> Result<VisionOcrResult, ExtractionError>;

    fn model_name(&self) -> &str;
}

/// Source of rendered page images, addressed by 1-based page number.
pub trait PageImageSource: Send + Sync {
    fn page_image(&self, page: u32) -> Result<Vec<u8>, ExtractionError>;
}
