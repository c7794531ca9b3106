//! Content-addressed cache for completion-model and vision calls.
//!
//! Key: SHA-256 over (mode, model, prompt, expected ids). Entries live in
//! memory and, when a directory is configured, on disk under
//! `page-NNNN/<hex>.json` so repeated runs never repeat a paid call.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    Scan,
    Repair,
    Vision,
}

impl CacheMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Repair => "repair",
            Self::Vision => "vision",
        }
    }
}

/// One stored call result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub mode: CacheMode,
    pub model: String,
    pub response: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Default)]
pub struct RepairCache {
    dir: Option<PathBuf>,
    memory: Mutex<HashMap<String, CacheEntry>>,
}

impl RepairCache {
    /// Memory-only cache.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            memory: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn key(mode: CacheMode, model: &str, prompt: &str, ids: &[String]) -> String {
        let mut hasher = Sha256::new();
        for part in [mode.as_str(), model, prompt] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        for id in ids {
            hasher.update(id.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    fn entry_path(&self, page: u32, key: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|d| d.join(format!("page-{page:04}")).join(format!("{key}.json")))
    }

    pub fn get(&self, page: u32, key: &str) -> Option<CacheEntry> {
        {
            let memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = memory.get(key) {
                return Some(entry.clone());
            }
        }

        let path = self.entry_path(page, key)?;
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => {
                tracing::debug!(page, key, "Cache hit on disk");
                self.memory
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(key.to_string(), entry.clone());
                Some(entry)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Ignoring unreadable cache entry"
                );
                None
            }
        }
    }

    /// Store a response. Disk failures are logged and otherwise ignored.
    pub fn put(&self, page: u32, key: &str, mode: CacheMode, model: &str, response: &str) {
        let entry = CacheEntry {
            mode,
            model: model.to_string(),
            response: response.to_string(),
            created_at: chrono::Utc::now(),
        };

        if let Some(path) = self.entry_path(page, key) {
            if let Err(e) = write_entry(&path, &entry) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to persist cache entry");
            }
        }

        self.memory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), entry);
    }

    /// Cached response for `key`, or the result of `call` (stored on success).
    pub fn get_or_call<E>(
        &self,
        page: u32,
        mode: CacheMode,
        model: &str,
        key: &str,
        call: impl FnOnce() -> Result<String, E>,
    ) -> Result<String, E> {
        if let Some(entry) = self.get(page, key) {
            return Ok(entry.response);
        }
        let response = call()?;
        self.put(page, key, mode, model, &response);
        Ok(response)
    }

    pub fn len(&self) -> usize {
        self.memory.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn write_entry(path: &Path, entry: &CacheEntry) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(entry).map_err(std::io::Error::other)?;
    std::fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_depends_on_every_part() {
        let ids = vec!["a".to_string()];
        let base = RepairCache::key(CacheMode::Repair, "m", "p", &ids);
        assert_eq!(base.len(), 64);
        assert_eq!(base, RepairCache::key(CacheMode::Repair, "m", "p", &ids));
        assert_ne!(base, RepairCache::key(CacheMode::Scan, "m", "p", &ids));
        assert_ne!(base, RepairCache::key(CacheMode::Repair, "m2", "p", &ids));
        assert_ne!(base, RepairCache::key(CacheMode::Repair, "m", "p2", &ids));
        assert_ne!(base, RepairCache::key(CacheMode::Repair, "m", "p", &[]));
    }

    #[test]
    fn call_happens_once() {
        let cache = RepairCache::in_memory();
        let mut calls = 0;
        for _ in 0..3 {
            let got: Result<String, ()> = cache.get_or_call(1, CacheMode::Repair, "m", "k", || {
                calls += 1;
                Ok("answer".into())
            });
            assert_eq!(got.unwrap(), "answer");
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn errors_are_not_cached() {
        let cache = RepairCache::in_memory();
        let first: Result<String, &str> =
            cache.get_or_call(1, CacheMode::Scan, "m", "k", || Err("down"));
        assert!(first.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn disk_entries_survive_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let key = RepairCache::key(CacheMode::Vision, "v", "prompt", &["12".into()]);

        RepairCache::with_dir(dir.path()).put(12, &key, CacheMode::Vision, "v", "12\nText.");
        assert!(dir.path().join("page-0012").join(format!("{key}.json")).is_file());

        let fresh = RepairCache::with_dir(dir.path());
        let entry = fresh.get(12, &key).unwrap();
        assert_eq!(entry.response, "12\nText.");
        assert_eq!(entry.mode, CacheMode::Vision);
    }
}
