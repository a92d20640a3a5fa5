//! Run-artifact persistence: atomic JSON writes and JSON-lines appends.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::CoreError;

/// Atomically write `data` as pretty JSON.
///
/// Writes a `.tmp` sibling, then renames over `path`. Parent directories are
/// created as needed.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, data: &T) -> Result<(), CoreError> {
    let json = serde_json::to_string_pretty(data)?;
    write_atomic(path, json.as_bytes())
}

/// Atomically write raw bytes.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read JSON from `path`; `Ok(None)` when the file does not exist.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, CoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&data)?))
}

/// Append one compact JSON document followed by a newline.
pub fn append_json_line<T: serde::Serialize>(path: &Path, data: &T) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(data)?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}
