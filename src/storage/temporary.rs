// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Side-channel storage for series whose primary write failed

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{FederationError, Result};
use crate::model::Serie;

type BatchDeleter = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Series read back from temporary storage
///
/// The series stay stored until [`TemporaryBatch::delete`] is called, so a
/// failed replay leaves them in place.
pub struct TemporaryBatch {
    pub series: Vec<Serie>,
    deleter: Option<BatchDeleter>,
}

impl TemporaryBatch {
    fn new(series: Vec<Serie>, deleter: BatchDeleter) -> Self {
        Self {
            series,
            deleter: Some(deleter),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Number of entries across all series
    pub fn entry_count(&self) -> usize {
        self.series.iter().map(Serie::len).sum()
    }

    /// Remove the batch from temporary storage
    pub async fn delete(mut self) -> Result<()> {
        match self.deleter.take() {
            Some(deleter) => deleter().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
pub trait TemporaryStorage: Send + Sync {
    async fn write(&self, series: &[Serie]) -> Result<()>;

    /// Read the oldest stored writes until at least `count` entries are
    /// collected; one write is never split
    async fn read(&self, count: usize) -> Result<TemporaryBatch>;
}

/// Process-local temporary storage
#[derive(Clone, Default)]
pub struct MemoryTemporaryStorage {
    pending: Arc<Mutex<VecDeque<(u64, Vec<Serie>)>>>,
    sequence: Arc<AtomicU64>,
}

impl MemoryTemporaryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

#[async_trait]
impl TemporaryStorage for MemoryTemporaryStorage {
    async fn write(&self, series: &[Serie]) -> Result<()> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().await.push_back((seq, series.to_vec()));
        Ok(())
    }

    async fn read(&self, count: usize) -> Result<TemporaryBatch> {
        let pending = self.pending.lock().await;

        let mut taken = Vec::new();
        let mut series = Vec::new();
        let mut entries = 0;
        for (seq, stored) in pending.iter() {
            if entries >= count {
                break;
            }
            entries += stored.iter().map(Serie::len).sum::<usize>();
            series.extend(stored.iter().cloned());
            taken.push(*seq);
        }

        let queue = self.pending.clone();
        let deleter: BatchDeleter = Box::new(move || {
            async move {
                queue.lock().await.retain(|(seq, _)| !taken.contains(seq));
                Ok::<_, FederationError>(())
            }
            .boxed()
        });

        Ok(TemporaryBatch::new(series, deleter))
    }
}

/// Temporary storage as JSON files in one directory
///
/// File names start with the zero-padded write time so a lexicographic
/// listing is oldest first.
pub struct FileTemporaryStorage {
    directory: PathBuf,
    max_bytes: u64,
    lock: Mutex<()>,
}

impl FileTemporaryStorage {
    pub fn new(directory: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            directory: directory.into(),
            max_bytes,
            lock: Mutex::new(()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    async fn stored_files(&self) -> Result<Vec<(PathBuf, u64)>> {
        let mut files = Vec::new();
        let mut dir = match fs::read_dir(&self.directory).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let size = item.metadata().await?.len();
            files.push((path, size));
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl TemporaryStorage for FileTemporaryStorage {
    async fn write(&self, series: &[Serie]) -> Result<()> {
        let data = serde_json::to_vec(series)?;

        let _guard = self.lock.lock().await;
        let used: u64 = self.stored_files().await?.iter().map(|(_, size)| size).sum();
        if used + data.len() as u64 > self.max_bytes {
            return Err(anyhow!(
                "Temporary storage full ({} of {} bytes used)",
                used,
                self.max_bytes
            )
            .into());
        }

        fs::create_dir_all(&self.directory).await?;
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let name = format!("{:020}-{}.json", nanos, Uuid::new_v4());
        let path = self.directory.join(&name);
        let staged = path.with_extension("tmp");
        fs::write(&staged, &data).await?;
        fs::rename(&staged, &path).await?;

        debug!("Stored {} series in temporary file {}", series.len(), name);
        Ok(())
    }

    async fn read(&self, count: usize) -> Result<TemporaryBatch> {
        let mut taken = Vec::new();
        let mut series = Vec::new();
        let mut entries = 0;

        for (path, _) in self.stored_files().await? {
            if entries >= count {
                break;
            }
            let data = fs::read(&path).await?;
            let stored: Vec<Serie> = serde_json::from_slice(&data)?;
            entries += stored.iter().map(Serie::len).sum::<usize>();
            series.extend(stored);
            taken.push(path);
        }

        let deleter: BatchDeleter = Box::new(move || {
            async move {
                for path in taken {
                    match fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            warn!("Temporary file {} already removed", path.display());
                        }
                        Err(e) => return Err(FederationError::from(e)),
                    }
                }
                Ok(())
            }
            .boxed()
        });

        Ok(TemporaryBatch::new(series, deleter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entry, FieldValue, SortOrder};
    use chrono::{DateTime, TimeZone};
    use tempfile::TempDir;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn serie(id: &str, n: i64) -> Serie {
        let entries = (0..n).map(|s| Entry::new(ts(s)).with_field("value", s)).collect();
        Serie::with_entries(id.to_string(), entries, SortOrder::Ascending)
    }

    #[tokio::test]
    async fn test_memory_read_keeps_until_delete() {
        let storage = MemoryTemporaryStorage::new();
        storage.write(&[serie("a", 3)]).await.unwrap();
        storage.write(&[serie("b", 3)]).await.unwrap();

        let batch = storage.read(1).await.unwrap();
        assert_eq!(batch.series.len(), 1);
        assert_eq!(batch.series[0].key, "a");
        assert_eq!(storage.len().await, 2);

        batch.delete().await.unwrap();
        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn test_file_round_trip_oldest_first() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileTemporaryStorage::new(temp_dir.path(), 1024 * 1024);
        storage.write(&[serie("first", 2)]).await.unwrap();
        storage.write(&[serie("second", 2)]).await.unwrap();

        let batch = storage.read(100).await.unwrap();
        assert_eq!(batch.entry_count(), 4);
        assert_eq!(batch.series[0].key, "first");
        assert_eq!(batch.series[0].entries[1].field("value"), Some(FieldValue::Integer(1)));

        batch.delete().await.unwrap();
        assert!(storage.read(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_rejects_writes_beyond_max_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileTemporaryStorage::new(temp_dir.path(), 64);

        let result = storage.write(&[serie("a", 100)]).await;
        assert!(result.is_err());
        assert!(storage.read(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_reads_empty() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileTemporaryStorage::new(temp_dir.path().join("absent"), 1024);
        assert!(storage.read(10).await.unwrap().is_empty());
    }
}
