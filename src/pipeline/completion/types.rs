use serde::{Deserialize, Serialize};

use super::CompletionError;

/// Text completion backend (allows mocking).
pub trait CompletionClient: Send + Sync {
    fn generate(&self, model: &str, prompt: &str, system: &str) -> Result<String, CompletionError>;

    fn is_model_available(&self, model: &str) -> Result<bool, CompletionError>;
}

/// Multimodal chat backend used for page re-OCR.
pub trait VisionClient: Send + Sync {
    /// `images` are base64-encoded PNG or JPEG bytes.
    fn chat_with_images(
        &self,
        model: &str,
        prompt: &str,
        images: &[String],
        system: Option<&str>,
    ) -> Result<String, CompletionError>;
}

/// One header the model scan claims to have found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderClaim {
    pub element_id: String,
    pub section_id: u32,
}

/// Answer to "which unit starts section N?". `None` when the model found nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairAnswer {
    pub element_id: Option<String>,
    pub section_id: Option<u32>,
}
