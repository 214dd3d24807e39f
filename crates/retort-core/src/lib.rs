use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest of a JSON value with object keys serialized in sorted order
/// (serde_json maps are BTreeMap-backed, so serialization is canonical).
pub fn canonical_json_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    sha256_bytes(&bytes)
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    atomic_write_bytes(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "retort_core_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    #[test]
    fn atomic_write_creates_parents_and_replaces() {
        let root = scratch_dir("atomic");
        let path = root.join("nested").join("state.json");
        atomic_write_bytes(&path, b"first").expect("first write");
        assert_eq!(fs::read(&path).expect("read back"), b"first");
        atomic_write_bytes(&path, b"second").expect("second write");
        assert_eq!(fs::read(&path).expect("read back"), b"second");
        let entries: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("list dir")
            .collect();
        assert_eq!(entries.len(), 1, "no tmp files left behind");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn json_pretty_round_trips() {
        let root = scratch_dir("json");
        let path = root.join("report.json");
        let value = json!({"b": 2, "a": [1, 2, 3]});
        atomic_write_json_pretty(&path, &value).expect("write");
        let raw = fs::read_to_string(&path).expect("read");
        let parsed: Value = serde_json::from_str(&raw).expect("parse");
        assert_eq!(parsed, value);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn canonical_digest_ignores_insertion_order() {
        let a = json!({"x": 1, "y": {"k": "v", "a": true}});
        let mut b = serde_json::Map::new();
        b.insert("y".to_string(), json!({"a": true, "k": "v"}));
        b.insert("x".to_string(), json!(1));
        assert_eq!(
            canonical_json_digest(&a),
            canonical_json_digest(&Value::Object(b))
        );
    }

    #[test]
    fn sha256_bytes_matches_known_vector() {
        assert_eq!(
            sha256_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
