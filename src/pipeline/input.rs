//! Line-delimited JSON readers for text units, macro regions and seed spans.
//!
//! Any malformed record fails the whole load: the engine never runs on a
//! partially read document.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;

use super::types::{BoundarySpan, MacroRegion, TextUnit};

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: malformed record: {source}")]
    MalformedRecord {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Duplicate element id '{0}'")]
    DuplicateElementId(String),

    #[error("Input contains no text units")]
    EmptyInput,

    #[error("Invalid macro region {kind}: pages {start_page}..={end_page}")]
    InvalidRegion {
        kind: String,
        start_page: u32,
        end_page: u32,
    },
}

/// Read one `TextUnit` per non-blank line.
pub fn load_units(path: &Path) -> Result<Vec<TextUnit>, InputError> {
    let units: Vec<TextUnit> = read_jsonl(path)?;
    if units.is_empty() {
        return Err(InputError::EmptyInput);
    }
    tracing::info!(path = %path.display(), units = units.len(), "Loaded text units");
    Ok(units)
}

/// Read macro regions from a JSON array, or one region per line.
pub fn load_regions(path: &Path) -> Result<Vec<MacroRegion>, InputError> {
    let raw = std::fs::read_to_string(path).map_err(|source| InputError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let regions: Vec<MacroRegion> = if raw.trim_start().starts_with('[') {
        serde_json::from_str(&raw).map_err(|source| InputError::MalformedRecord {
            path: path.to_path_buf(),
            line: source.line(),
            source,
        })?
    } else {
        parse_jsonl(path, raw.lines())?
    };

    for region in &regions {
        if region.end_page < region.start_page {
            return Err(InputError::InvalidRegion {
                kind: region.kind.to_string(),
                start_page: region.start_page,
                end_page: region.end_page,
            });
        }
    }
    Ok(regions)
}

/// Read previously certified spans (one per line) to re-certify them.
pub fn load_spans(path: &Path) -> Result<Vec<BoundarySpan>, InputError> {
    read_jsonl(path)
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, InputError> {
    let file = std::fs::File::open(path).map_err(|source| InputError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        lines.push(line.map_err(|source| InputError::Io {
            path: path.to_path_buf(),
            source,
        })?);
    }
    parse_jsonl(path, lines.iter().map(String::as_str))
}

fn parse_jsonl<'a, T: DeserializeOwned>(
    path: &Path,
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<T>, InputError> {
    let mut records = Vec::new();
    for (idx, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|source| InputError::MalformedRecord {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}
