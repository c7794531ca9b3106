//! Engine configuration.
//!
//! Every section is `#[serde(default)]`, so a config file only needs the keys
//! it overrides. CLI flags are applied on top of the loaded file by the binary.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::detection::DetectorKind;

/// Application-level constants
pub const APP_NAME: &str = "sectionmark";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "sectionmark=info,sectionmark_lib=info"
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ═══════════════════════════════════════════════════════════
// Sections
// ═══════════════════════════════════════════════════════════

/// Expected section-number range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRange {
    pub min: u32,
    pub max: u32,
}

impl Default for SectionRange {
    fn default() -> Self {
        Self { min: 1, max: 400 }
    }
}

impl SectionRange {
    pub fn contains(&self, id: u32) -> bool {
        id >= self.min && id <= self.max
    }

    pub fn len(&self) -> u32 {
        self.max.saturating_sub(self.min) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.max < self.min
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.min..=self.max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Confidence assigned to code-scan candidates before adjustments.
    pub base_confidence: f32,
    /// Hard cap on glyph-substitution combinations per token.
    pub expansion_cap: usize,
    /// Lowercase phrases that mark navigation text ("turn to 80").
    pub navigation_phrases: Vec<String>,
    /// OCR glyph → plausible intended strings. Empty string means noise.
    pub confusion: BTreeMap<char, Vec<String>>,
    /// Glyph expansion only runs on tokens holding at least one real digit.
    pub require_digit_anchor: bool,
    /// Longest token (non-space chars) considered for glyph expansion.
    pub max_glyph_token_len: usize,
    /// Structure-hint confidence at which the hint overrides the sentence check.
    pub trusted_tag_threshold: f32,
    /// Characters of following text kept on each candidate.
    pub preview_chars: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_confidence: 0.7,
            expansion_cap: 32,
            navigation_phrases: ["turn to", "go to", "return to", "continue to", "if you"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            confusion: default_confusion_table(),
            require_digit_anchor: true,
            max_glyph_token_len: 6,
            trusted_tag_threshold: 0.8,
            preview_chars: 240,
        }
    }
}

/// Glyph confusions observed in scanned gamebook headers.
pub fn default_confusion_table() -> BTreeMap<char, Vec<String>> {
    let entries: &[(char, &[&str])] = &[
        ('O', &["0"]),
        ('o', &["0"]),
        ('Q', &["0"]),
        ('D', &["0"]),
        ('l', &["1"]),
        ('I', &["1"]),
        ('i', &["1"]),
        ('|', &["1"]),
        ('!', &["1", ""]),
        ('Z', &["2"]),
        ('z', &["2"]),
        ('S', &["5"]),
        ('s', &["5"]),
        ('B', &["8"]),
        ('G', &["6"]),
        ('b', &["6"]),
        ('g', &["9"]),
        ('q', &["9"]),
        ('T', &["7"]),
        ('A', &["4"]),
        ('.', &[""]),
        (',', &[""]),
        ('\'', &["", "1"]),
        ('`', &[""]),
        ('-', &[""]),
        ('_', &[""]),
        ('*', &[""]),
    ];
    entries
        .iter()
        .map(|(c, subs)| (*c, subs.iter().map(|s| s.to_string()).collect()))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub centering_enabled: bool,
    /// Tolerance in standard deviations of the page's line centres.
    pub centering_sigma: f32,
    /// Tolerance floor as a fraction of the page's horizontal extent.
    pub centering_floor_ratio: f32,
    pub min_lines_for_centering: usize,
    /// Page distance beyond which an inverted pair of numbers is a conflict.
    pub ordering_page_threshold: u32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            centering_enabled: true,
            centering_sigma: 1.5,
            centering_floor_ratio: 0.02,
            min_lines_for_centering: 3,
            ordering_page_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    /// Alternatives further than this below the best follow-text score are noise.
    pub dedup_margin: u32,
    /// Follow-text scan stops this many pages after the header.
    pub follow_text_max_pages: u32,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            dedup_margin: 50,
            follow_text_max_pages: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Highest trust first. Spans from earlier detectors win the merge.
    pub trust_order: Vec<DetectorKind>,
    /// Run the completion-model scan as an extra detector.
    pub model_scan: bool,
    /// Pages per model-scan prompt.
    pub model_scan_batch_pages: u32,
    /// Units longer than this are not offered to the model scan.
    pub model_scan_max_unit_chars: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            trust_order: vec![
                DetectorKind::Seeded,
                DetectorKind::LayoutScan,
                DetectorKind::CodeScan,
                DetectorKind::ModelScan,
            ],
            model_scan: false,
            model_scan_batch_pages: 6,
            model_scan_max_unit_chars: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub max_retries: u32,
    pub text_repair: bool,
    pub model_repair: bool,
    pub vision_repair: bool,
    /// Most units offered to one model-repair prompt.
    pub max_window_units: usize,
    /// Most pages re-OCR'd for one missing section.
    pub max_vision_pages: usize,
    /// Characters of nearby text kept in missing-section diagnostics.
    pub snippet_chars: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            text_repair: true,
            model_repair: true,
            vision_repair: true,
            max_window_units: 80,
            max_vision_pages: 3,
            snippet_chars: 160,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub scan_model: String,
    pub repair_model: String,
    pub vision_model: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
            timeout_secs: 120,
            scan_model: "qwen2.5:7b".into(),
            repair_model: "qwen2.5:14b".into(),
            vision_model: "llama3.2-vision".into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// EngineConfig
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub range: SectionRange,
    /// Minimum number of in-range sections required to pass.
    /// `None` means the full range minus the known-missing allow-list.
    pub min_coverage: Option<u32>,
    /// Sections confirmed absent from the source book.
    pub known_missing: Vec<u32>,
    pub generator: GeneratorConfig,
    pub validator: ValidatorConfig,
    pub assembler: AssemblerConfig,
    pub detectors: DetectorConfig,
    pub escalation: EscalationConfig,
    pub models: ModelConfig,
    /// File name pattern for page images; `{page}` or `{page:04}` placeholders.
    pub page_image_pattern: Option<String>,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.range.is_empty() || self.range.min == 0 {
            return Err(ConfigError::Invalid(format!(
                "section range {}..={} must be non-empty and start at 1 or above",
                self.range.min, self.range.max
            )));
        }
        if let Some(min) = self.min_coverage {
            if min > self.range.len() {
                return Err(ConfigError::Invalid(format!(
                    "min_coverage {min} exceeds range size {}",
                    self.range.len()
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.generator.base_confidence) {
            return Err(ConfigError::Invalid("base_confidence must be in [0, 1]".into()));
        }
        if self.generator.expansion_cap == 0 {
            return Err(ConfigError::Invalid("expansion_cap must be at least 1".into()));
        }
        if self.validator.centering_sigma <= 0.0 {
            return Err(ConfigError::Invalid("centering_sigma must be positive".into()));
        }
        if self.detectors.trust_order.is_empty() {
            return Err(ConfigError::Invalid("trust_order must name at least one detector".into()));
        }
        Ok(())
    }

    /// Coverage threshold with the allow-list already subtracted.
    pub fn required_coverage(&self) -> u32 {
        self.min_coverage.unwrap_or_else(|| {
            let known = self
                .known_missing
                .iter()
                .filter(|id| self.range.contains(**id))
                .count() as u32;
            self.range.len().saturating_sub(known)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{"range": {"min": 1, "max": 350}, "escalation": {"max_retries": 4}}"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.range.max, 350);
        assert_eq!(config.escalation.max_retries, 4);
        assert!(config.escalation.text_repair);
        assert_eq!(config.generator.expansion_cap, 32);
    }

    #[test]
    fn confusion_table_round_trips_char_keys() {
        let json = serde_json::to_string(&GeneratorConfig::default()).unwrap();
        let back: GeneratorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.confusion.get(&'O'), Some(&vec!["0".to_string()]));
    }

    #[test]
    fn inverted_range_rejected() {
        let mut config = EngineConfig::default();
        config.range = SectionRange { min: 10, max: 2 };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn required_coverage_subtracts_known_missing() {
        let mut config = EngineConfig::default();
        config.range = SectionRange { min: 1, max: 100 };
        config.known_missing = vec![7, 8, 500];
        assert_eq!(config.required_coverage(), 98);

        config.min_coverage = Some(90);
        assert_eq!(config.required_coverage(), 90);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(ConfigError::Parse(_))));
    }
}
