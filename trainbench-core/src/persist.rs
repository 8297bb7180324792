//! Shared persistence utilities — atomic file writes, YAML load/save.
//!
//! Every on-disk document (experiment config, status, model log) goes through
//! the same write-to-tmp-then-rename pattern so a crash mid-write never leaves
//! a half-serialized file behind.

use std::io;
use std::path::Path;

/// Atomically write YAML data to a file.
///
/// Serializes `data` to YAML, writes to a `.tmp` sibling file, then atomically
/// renames to the target path. Creates parent directories if they don't exist.
pub fn atomic_write_yaml<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let yaml = serde_yaml::to_string(data).map_err(io::Error::other)?;
    atomic_write(path, yaml.as_bytes())
}

/// Atomically write raw bytes to a file.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize YAML from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_yaml::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestDoc {
        name: String,
        count: u32,
    }

    #[test]
    fn test_atomic_write_yaml_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.yaml");

        let doc = TestDoc {
            name: "hello".into(),
            count: 42,
        };

        atomic_write_yaml(&path, &doc).unwrap();
        let loaded: Option<TestDoc> = load_yaml(&path).unwrap();
        assert_eq!(loaded, Some(doc));
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dir").join("doc.yaml");

        let doc = TestDoc {
            name: "nested".into(),
            count: 1,
        };

        atomic_write_yaml(&path, &doc).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_yaml_nonexistent() {
        let result: io::Result<Option<TestDoc>> = load_yaml(Path::new("/nonexistent/doc.yaml"));
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_atomic_write_no_tmp_leftover() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clean.yaml");

        atomic_write_yaml(&path, &"test").unwrap();

        let tmp = path.with_extension("tmp");
        assert!(!tmp.exists());
    }
}
