use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use uuid::Uuid;

/// Content store backing prepared files and cached copy-out artifacts. Ids
/// are opaque strings unique for the lifetime of the process; stored bytes
/// are immutable once published.
#[async_trait]
pub trait FileStore: Send + Sync + 'static {
    async fn put(&self, name: &str, bytes: Bytes) -> Result<String>;
    async fn get(&self, id: &str) -> Option<(String, Bytes)>;
    async fn delete(&self, id: &str) -> bool;
    async fn contains(&self, id: &str) -> bool;
    fn list(&self) -> Vec<(String, String)>;
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub struct MemoryStore {
    blobs: DashMap<String, (String, Bytes)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            blobs: DashMap::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn put(&self, name: &str, bytes: Bytes) -> Result<String> {
        let id = new_id();
        self.blobs.insert(id.clone(), (name.to_string(), bytes));
        Ok(id)
    }

    async fn get(&self, id: &str) -> Option<(String, Bytes)> {
        self.blobs.get(id).map(|entry| entry.value().clone())
    }

    async fn delete(&self, id: &str) -> bool {
        self.blobs.remove(id).is_some()
    }

    async fn contains(&self, id: &str) -> bool {
        self.blobs.contains_key(id)
    }

    fn list(&self) -> Vec<(String, String)> {
        self.blobs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().0.clone()))
            .collect()
    }
}

/// One file per blob under `dir`, file name = blob id, raw contents. There
/// is no index file; construction scans the directory and adopts whatever it
/// finds, so blobs survive restarts.
pub struct DiskStore {
    dir: PathBuf,
    names: DashMap<String, String>,
}

impl DiskStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create file store dir {}", dir.display()))?;
        let names = DashMap::new();
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("scan file store dir {}", dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            if id.starts_with('.') {
                continue;
            }
            names.insert(id.clone(), id);
        }
        Ok(Self { dir, names })
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }
}

#[async_trait]
impl FileStore for DiskStore {
    async fn put(&self, name: &str, bytes: Bytes) -> Result<String> {
        let id = new_id();
        // write-then-rename keeps partially written blobs invisible
        let tmp = self.dir.join(format!(".{id}.tmp"));
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("write blob {id}"))?;
        tokio::fs::rename(&tmp, self.blob_path(&id))
            .await
            .with_context(|| format!("publish blob {id}"))?;
        self.names.insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn get(&self, id: &str) -> Option<(String, Bytes)> {
        let name = self.names.get(id).map(|entry| entry.value().clone())?;
        let bytes = tokio::fs::read(self.blob_path(id)).await.ok()?;
        Some((name, Bytes::from(bytes)))
    }

    async fn delete(&self, id: &str) -> bool {
        let known = self.names.remove(id).is_some();
        if known {
            let _ = tokio::fs::remove_file(self.blob_path(id)).await;
        }
        known
    }

    async fn contains(&self, id: &str) -> bool {
        self.names.contains_key(id)
    }

    fn list(&self) -> Vec<(String, String)> {
        self.names
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
