pub mod types;
pub mod page_images;
pub mod vision_ocr;

pub use types::*;
pub use page_images::*;
pub use vision_ocr::*;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No page image for page {page} (looked for {path})")]
    PageImageMissing { page: u32, path: PathBuf },

    #[error("Unsupported page image format: {0}")]
    UnsupportedImage(PathBuf),

    #[error("Vision OCR failed: {0}")]
    OcrProcessing(String),
}
