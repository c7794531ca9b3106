//! Page images rendered upstream, read from a directory by file-name pattern.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::types::PageImageSource;
use super::ExtractionError;

pub const DEFAULT_PAGE_IMAGE_PATTERN: &str = "page-{page:04}.png";

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G'];
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];

pub struct DirectoryPageImages {
    dir: PathBuf,
    pattern: String,
}

impl DirectoryPageImages {
    pub fn new(dir: impl Into<PathBuf>, pattern: Option<&str>) -> Self {
        Self {
            dir: dir.into(),
            pattern: pattern.unwrap_or(DEFAULT_PAGE_IMAGE_PATTERN).to_string(),
        }
    }

    pub fn path_for(&self, page: u32) -> PathBuf {
        self.dir.join(render_pattern(&self.pattern, page))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Substitute `{page}` and zero-padded `{page:0N}` placeholders.
pub fn render_pattern(pattern: &str, page: u32) -> String {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut rest = pattern;
    while let Some(start) = rest.find("{page") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 5..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let spec = &after[..end];
        match spec.strip_prefix(":0").and_then(|w| w.parse::<usize>().ok()) {
            Some(width) => out.push_str(&format!("{page:0width$}")),
            None if spec.is_empty() => out.push_str(&page.to_string()),
            None => out.push_str(&rest[start..start + 5 + end + 1]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

impl PageImageSource for DirectoryPageImages {
    fn page_image(&self, page: u32) -> Result<Vec<u8>, ExtractionError> {
        let path = self.path_for(page);
        if !path.is_file() {
            return Err(ExtractionError::PageImageMissing { page, path });
        }
        let bytes = std::fs::read(&path).map_err(|source| ExtractionError::Io {
            path: path.clone(),
            source,
        })?;
        if !(bytes.starts_with(PNG_MAGIC) || bytes.starts_with(JPEG_MAGIC)) {
            return Err(ExtractionError::UnsupportedImage(path));
        }
        tracing::debug!(page, path = %path.display(), size = bytes.len(), "Loaded page image");
        Ok(bytes)
    }
}

// ──────────────────────────────────────────────
// MockPageImages (testing)
// ──────────────────────────────────────────────

/// Page images held in memory, keyed by page number.
#[derive(Default)]
pub struct MockPageImages {
    pages: HashMap<u32, Vec<u8>>,
}

impl MockPageImages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, page: u32, bytes: &[u8]) -> Self {
        self.pages.insert(page, bytes.to_vec());
        self
    }
}

impl PageImageSource for MockPageImages {
    fn page_image(&self, page: u32) -> Result<Vec<u8>, ExtractionError> {
        self.pages
            .get(&page)
            .cloned()
            .ok_or_else(|| ExtractionError::PageImageMissing {
                page,
                path: PathBuf::from(format!("memory://page/{page}")),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_placeholders() {
        assert_eq!(render_pattern("page-{page:04}.png", 7), "page-0007.png");
        assert_eq!(render_pattern("scan_{page}.jpg", 112), "scan_112.jpg");
        assert_eq!(render_pattern("p{page:03}-{page}.png", 5), "p005-5.png");
        assert_eq!(render_pattern("fixed.png", 5), "fixed.png");
    }

    #[test]
    fn reads_png_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut png = PNG_MAGIC.to_vec();
        png.extend_from_slice(b"rest");
        std::fs::write(dir.path().join("page-0003.png"), &png).unwrap();

        let source = DirectoryPageImages::new(dir.path(), None);
        assert_eq!(source.page_image(3).unwrap(), png);
    }

    #[test]
    fn missing_page_reported() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectoryPageImages::new(dir.path(), None);
        assert!(matches!(
            source.page_image(9),
            Err(ExtractionError::PageImageMissing { page: 9, .. })
        ));
    }

    #[test]
    fn non_image_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page-0001.png"), b"not an image").unwrap();
        let source = DirectoryPageImages::new(dir.path(), None);
        assert!(matches!(source.page_image(1), Err(ExtractionError::UnsupportedImage(_))));
    }
}
