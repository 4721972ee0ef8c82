//! Blob store adapter
//!
//! Filesystem-backed blob storage under the service root folder. Keys are
//! opaque slash-separated paths following the persisted layout:
//! `songs/{song_id}/source.{ext}`, `songs/{song_id}/character/
//! reference.jpg`, `composed/{composed_video_id}.mp4`. Entries are
//! immutable per key; short-lived read URLs carry an HMAC-style token so
//! the HTTP surface can serve bytes without exposing the tree.

mod sweeper;

pub use sweeper::sweep_orphans;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Filesystem blob store
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    token_secret: String,
}

impl BlobStore {
    /// Open (and create) the blob tree under `root`
    pub fn new(root: PathBuf, token_secret: String) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating blob root {}", root.display()))?;
        Ok(Self { root, token_secret })
    }

    /// Blob key for a song's source audio
    pub fn source_key(song_id: Uuid, extension: &str) -> String {
        format!("songs/{song_id}/source.{extension}")
    }

    /// Blob key for a song's character reference image
    pub fn character_key(song_id: Uuid) -> String {
        format!("songs/{song_id}/character/reference.jpg")
    }

    /// Blob key for a composed video artifact
    pub fn composed_key(composed_video_id: Uuid) -> String {
        format!("composed/{composed_video_id}.mp4")
    }

    /// Absolute path of a key; rejects traversal outside the tree
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.split('/').any(|c| c == ".." || c.is_empty())
        {
            bail!("invalid blob key: {key}");
        }
        Ok(self.root.join(key))
    }

    /// Write bytes under a key, creating parent directories
    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing blob {key}"))?;
        tracing::debug!(key, bytes = bytes.len(), "Blob stored");
        Ok(())
    }

    /// Read all bytes of a key
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading blob {key}"))
    }

    /// Whether a key exists
    pub async fn exists(&self, key: &str) -> bool {
        match self.path_for(key) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Size of a stored blob in bytes
    pub async fn byte_size(&self, key: &str) -> Result<u64> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::metadata(&path).await?.len())
    }

    /// Delete a key, ignoring missing entries
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Short-lived read URL for a key (service-relative)
    pub fn read_url(&self, key: &str, ttl: std::time::Duration) -> String {
        let expires = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        let token = self.token_for(key, expires);
        format!("/blobs/{key}?exp={expires}&tok={token}")
    }

    /// Validate a read-URL token
    pub fn verify_token(&self, key: &str, expires: i64, token: &str) -> bool {
        if chrono::Utc::now().timestamp() > expires {
            return false;
        }
        self.token_for(key, expires) == token
    }

    fn token_for(&self, key: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.token_secret.as_bytes());
        hasher.update(b"|");
        hasher.update(key.as_bytes());
        hasher.update(b"|");
        hasher.update(expires.to_string().as_bytes());
        to_hex(&hasher.finalize())
    }

    /// Blob root path (sweeper + tests)
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// SHA-256 hex digest of a byte slice (upload dedup hash)
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    to_hex(&hasher.finalize())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path().to_path_buf(), "test-secret".into()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (_dir, store) = store();
        store.put("songs/a/source.mp3", b"hello").await.unwrap();
        assert!(store.exists("songs/a/source.mp3").await);
        assert_eq!(store.get("songs/a/source.mp3").await.unwrap(), b"hello");
        assert_eq!(store.byte_size("songs/a/source.mp3").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_traversal_keys_rejected() {
        let (_dir, store) = store();
        assert!(store.put("../escape", b"x").await.is_err());
        assert!(store.put("/abs", b"x").await.is_err());
        assert!(store.put("a//b", b"x").await.is_err());
    }

    #[test]
    fn test_read_url_token_round_trip() {
        let (_dir, store) = store();
        let url = store.read_url("composed/x.mp4", std::time::Duration::from_secs(60));
        // Parse exp and tok back out of the URL
        let query = url.split('?').nth(1).unwrap();
        let mut exp = 0i64;
        let mut tok = String::new();
        for pair in query.split('&') {
            let (k, v) = pair.split_once('=').unwrap();
            match k {
                "exp" => exp = v.parse().unwrap(),
                "tok" => tok = v.to_string(),
                _ => {}
            }
        }
        assert!(store.verify_token("composed/x.mp4", exp, &tok));
        assert!(!store.verify_token("composed/y.mp4", exp, &tok));
        assert!(!store.verify_token("composed/x.mp4", exp - 3600, &tok));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_dir, store) = store();
        store.put("k", b"x").await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(!store.exists("k").await);
    }
}
