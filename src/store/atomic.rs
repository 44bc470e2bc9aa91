//! Atomic file writes — full content to a temp sibling, then rename.
//!
//! Rename is atomic on a single filesystem, so a crash mid-write can never
//! leave the destination half-written. The temp file carries a unique name
//! per writer, so concurrent writers to different destinations in the same
//! directory cannot collide.

use std::path::Path;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::StoreError;

/// Write `bytes` to `path` atomically.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("data");
    let temp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let write = async {
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp, path).await
    };

    if let Err(e) = write.await {
        // Never leave a temp file behind to shadow real data.
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(StoreError::Io(e));
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".tmp"))
            .collect()
    }

    #[tokio::test]
    async fn writes_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        write_atomic(&path, b"hello").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        assert!(temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[tokio::test]
    async fn concurrent_writers_to_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut handles = Vec::new();
        for i in 0..10 {
            let path = dir.path().join(format!("file-{i}.json"));
            handles.push(tokio::spawn(async move {
                let body = format!("content-{i}");
                write_atomic(&path, body.as_bytes()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for i in 0..10 {
            let path = dir.path().join(format!("file-{i}.json"));
            assert_eq!(
                std::fs::read_to_string(&path).unwrap(),
                format!("content-{i}")
            );
        }
        assert!(temp_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn missing_parent_dir_propagates_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("out.json");
        let err = write_atomic(&path, b"x").await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[tokio::test]
    async fn json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value.json");
        write_json(&path, &serde_json::json!({"a": 1})).await.unwrap();
        let parsed: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed["a"], 1);
    }
}
