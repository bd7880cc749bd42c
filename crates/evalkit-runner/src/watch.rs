use crate::error::HarnessError;
use crate::outcome::WatchedFile;
use evalkit_core::{sha256_file_or_missing, MISSING_FILE_SHA256};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Watched paths from either a JSON array or a comma/newline separated string.
pub fn parse_watch_list(raw: Option<&Value>) -> Vec<String> {
    match raw {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.trim().to_string(),
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .filter(|entry| !entry.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .split(['\n', ','])
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Relative path -> content hash, taken at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSnapshot {
    hashes: BTreeMap<String, String>,
}

impl WatchSnapshot {
    pub fn get(&self, path: &str) -> Option<&str> {
        self.hashes.get(path).map(String::as_str)
    }
}

fn hash_watched(fixture_dir: &Path, relative: &str) -> Result<String, HarnessError> {
    let path = fixture_dir.join(relative);
    sha256_file_or_missing(&path)
        .map_err(|err| HarnessError::io(format!("hashing watched file {}", path.display()), err))
}

pub fn snapshot(fixture_dir: &Path, watch_list: &[String]) -> Result<WatchSnapshot, HarnessError> {
    let mut hashes = BTreeMap::new();
    for relative in watch_list {
        hashes.insert(relative.clone(), hash_watched(fixture_dir, relative)?);
    }
    Ok(WatchSnapshot { hashes })
}

/// Compare the current state of each watched path against `before`, in watch-list order.
pub fn diff(
    fixture_dir: &Path,
    watch_list: &[String],
    before: &WatchSnapshot,
) -> Result<Vec<WatchedFile>, HarnessError> {
    watch_list
        .iter()
        .map(|relative| {
            let before_sha256 = before
                .get(relative)
                .unwrap_or(MISSING_FILE_SHA256)
                .to_string();
            let after_sha256 = hash_watched(fixture_dir, relative)?;
            Ok(WatchedFile {
                path: relative.clone(),
                changed: before_sha256 != after_sha256,
                before_sha256,
                after_sha256,
            })
        })
        .collect()
}
