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

// Filesystem backend storing packed blobs under order-preserving keys
//
// Layout:
//
//   {base_path}/{id}|{9999 - year}/{row_key}-{nonce}.blob
//
// Directory and file names sort newest-first, so a bounded scan lists one
// directory range and walks files in name order until it passes `from`.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{
    just_after, ContinuationToken, DynamicStorage, Segment, SegmentDeleter, SegmentQuery, Storage,
};
use crate::codec::{BlobCompressor, EntryPacker, ProtoEntrySerializer};
use crate::config::FilesystemConfig;
use crate::error::{FederationError, Result};
use crate::keys::{max_partition_key, min_partition_key, partition_key, row_key, PARTITION_SEPARATOR};
use crate::merge::merge_first_wins;
use crate::model::{Entry, Serie, SortOrder};

const BLOB_EXTENSION: &str = "blob";
const ROW_KEY_WIDTH: usize = 19;

/// Convert a storage id into a single path component
///
/// Path separators, the partition separator, control characters and `%`
/// itself are percent-escaped, so distinct ids never share a directory.
pub fn id_to_dir_name(id: &str) -> String {
    let mut name = String::with_capacity(id.len());
    for c in id.chars() {
        if matches!(c, '%' | '/' | '\\') || c == PARTITION_SEPARATOR || c.is_ascii_control() {
            name.push_str(&format!("%{:02X}", c as u32));
        } else {
            name.push(c);
        }
    }
    name
}

/// One blob file inside a partition directory
#[derive(Debug, Clone)]
struct BlobFile {
    row_key: String,
    path: PathBuf,
}

/// Local-file storage built on the key and packing codecs
#[derive(Clone)]
pub struct FilesystemStorage {
    inner: Arc<FsInner>,
}

struct FsInner {
    base_path: PathBuf,
    packer: EntryPacker,
    compressor: BlobCompressor,
    initialized: OnceCell<()>,
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl FilesystemStorage {
    pub fn new(config: FilesystemConfig) -> Result<Self> {
        let base_path = PathBuf::from(&config.base_path);
        if config.max_blob_bytes == 0 {
            return Err(FederationError::Backend(anyhow::anyhow!(
                "max_blob_bytes must be > 0"
            )));
        }

        info!(
            "Initializing filesystem storage at: {} (blob limit {} bytes, {:?} compression)",
            base_path.display(),
            config.max_blob_bytes,
            config.compression
        );

        Ok(Self {
            inner: Arc::new(FsInner {
                base_path,
                packer: EntryPacker::new(Arc::new(ProtoEntrySerializer), config.max_blob_bytes),
                compressor: BlobCompressor::new(config.compression, config.compression_level),
                initialized: OnceCell::new(),
                locks: DashMap::new(),
            }),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.inner.base_path
    }
}

impl FsInner {
    /// Create the base directory once; concurrent first callers share the result
    async fn ensure_initialized(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                if !self.base_path.exists() {
                    info!("Creating base directory: {}", self.base_path.display());
                }
                fs::create_dir_all(&self.base_path).await?;
                Ok::<_, FederationError>(())
            })
            .await?;
        Ok(())
    }

    /// Per-id lock: readers share it, rewrites of blob files take it exclusively
    fn lock_for(&self, id: &str) -> Arc<RwLock<()>> {
        self.locks.entry(id.to_string()).or_default().clone()
    }

    /// Forget the lock of `id` once nobody else holds or awaits it
    fn release_lock(&self, id: &str, lock: Arc<RwLock<()>>) {
        drop(lock);
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn partition_dir(&self, id: &str, timestamp: &DateTime<Utc>) -> PathBuf {
        self.base_path
            .join(partition_key(&id_to_dir_name(id), timestamp))
    }

    /// Partition directories of `id` overlapping `[from, to)`, newest first
    async fn partitions(
        &self,
        id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<PathBuf>> {
        let dir_id = id_to_dir_name(id);
        let newest = to.map_or_else(|| max_partition_key(&dir_id), |t| partition_key(&dir_id, &t));
        let oldest = from.map_or_else(|| min_partition_key(&dir_id), |f| partition_key(&dir_id, &f));
        let expected_len = dir_id.len() + 5;

        let mut names = Vec::new();
        let mut dir = match fs::read_dir(&self.base_path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.len() == expected_len && newest <= name && name <= oldest {
                names.push(name);
            }
        }
        names.sort();
        Ok(names.into_iter().map(|n| self.base_path.join(n)).collect())
    }

    /// Blob files of one partition, newest first
    async fn blob_files(&self, partition: &Path) -> Result<Vec<BlobFile>> {
        let mut files = Vec::new();
        let mut dir = match fs::read_dir(partition).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(row_key) = name.get(..ROW_KEY_WIDTH) {
                files.push(BlobFile {
                    row_key: row_key.to_string(),
                    path,
                });
            }
        }
        files.sort_by(|a, b| a.row_key.cmp(&b.row_key));
        Ok(files)
    }

    /// Blobs that may hold entries within `[from, to)`, newest first
    ///
    /// Selection works at row-key (100ns) granularity and errs on the side
    /// of including a blob; callers filter entries by exact timestamp.
    /// Returns whether the scan passed `from` so older partitions can be skipped.
    async fn select_blobs(
        &self,
        partition: &Path,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<(Vec<BlobFile>, bool)> {
        let newest_row = to.map(|t| row_key(&t));
        let oldest_row = from.map(|f| row_key(&f));
        let mut selected = Vec::new();

        for file in self.blob_files(partition).await? {
            if newest_row.as_ref().is_some_and(|r| file.row_key < *r) {
                continue;
            }
            // this blob starts strictly before `from`; nothing older can match
            let passed_from = oldest_row.as_ref().is_some_and(|r| file.row_key > *r);
            selected.push(file);
            if passed_from {
                return Ok((selected, true));
            }
        }
        Ok((selected, false))
    }

    async fn read_blob(&self, file: &BlobFile) -> Result<Vec<Entry>> {
        let raw = fs::read(&file.path).await?;
        let data = self.compressor.decompress(&raw)?;
        self.packer.unpack(&data, SortOrder::Descending)
    }

    /// Entries of `id` within `[from, to)`, newest first, at most `limit`
    async fn scan(
        &self,
        id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Entry>> {
        self.ensure_initialized().await?;
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.read().await;
            self.scan_locked(id, from, to, limit).await
        };
        self.release_lock(id, lock);
        result
    }

    async fn scan_locked(
        &self,
        id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Entry>> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut entries = Vec::new();

        for partition in self.partitions(id, from, to).await? {
            let (files, passed_from) = self.select_blobs(&partition, from, to).await?;
            for file in &files {
                for entry in self.read_blob(file).await? {
                    if in_range(&entry.timestamp, from, to) {
                        entries.push(entry);
                        if entries.len() >= limit {
                            return Ok(entries);
                        }
                    }
                }
            }
            if passed_from {
                break;
            }
        }
        Ok(entries)
    }

    /// Replace `old` blob files of a partition with a fresh packing of `entries`
    async fn replace_blobs(&self, partition: &Path, old: &[BlobFile], entries: &[Entry]) -> Result<()> {
        let blobs = self.packer.pack(entries)?;
        if !blobs.is_empty() {
            fs::create_dir_all(partition).await?;
        }

        let mut staged = Vec::with_capacity(blobs.len());
        for blob in &blobs {
            let name = format!(
                "{}-{}.{}",
                row_key(&blob.from),
                Uuid::new_v4().simple(),
                BLOB_EXTENSION
            );
            let staging = partition.join(format!("{}.tmp", name));
            let data = self.compressor.compress(&blob.data)?;

            let mut file = fs::File::create(&staging).await?;
            file.write_all(&data).await?;
            file.flush().await?;
            staged.push((staging, partition.join(name)));
        }

        for file in old {
            match fs::remove_file(&file.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        for (staging, target) in staged {
            fs::rename(&staging, &target).await?;
        }

        debug!(
            "Rewrote partition {}: {} blobs replaced by {} ({} entries)",
            partition.display(),
            old.len(),
            blobs.len(),
            entries.len()
        );
        Ok(())
    }

    async fn write_serie(&self, serie: &Serie) -> Result<()> {
        if serie.is_empty() {
            return Ok(());
        }
        self.ensure_initialized().await?;
        let lock = self.lock_for(&serie.key);
        let result = {
            let _guard = lock.write().await;
            self.write_serie_locked(serie).await
        };
        self.release_lock(&serie.key, lock);
        result
    }

    async fn write_serie_locked(&self, serie: &Serie) -> Result<()> {
        // Later duplicates in one batch win, matching overwrite semantics
        let mut by_year: BTreeMap<i32, Vec<Entry>> = BTreeMap::new();
        for entry in serie.entries.iter().rev() {
            by_year
                .entry(entry.timestamp.year())
                .or_default()
                .push(entry.clone());
        }

        for mut incoming in by_year.into_values() {
            incoming.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            let newest = incoming[0].timestamp;
            let oldest = incoming[incoming.len() - 1].timestamp;
            let partition = self.partition_dir(&serie.key, &newest);

            let (old, _) = self
                .select_blobs(&partition, Some(oldest), Some(just_after(newest)))
                .await?;
            let mut existing = Vec::new();
            for file in &old {
                existing.extend(self.read_blob(file).await?);
            }

            let merged = merge_first_wins(
                vec![
                    Serie::with_entries((), incoming, SortOrder::Descending),
                    Serie::with_entries((), existing, SortOrder::Descending),
                ],
                SortOrder::Descending,
            );
            self.replace_blobs(&partition, &old, &merged).await?;
        }
        Ok(())
    }

    async fn delete_id(
        &self,
        id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        self.ensure_initialized().await?;
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.write().await;
            self.delete_id_locked(id, from, to).await
        };
        self.release_lock(id, lock);
        result
    }

    async fn delete_id_locked(
        &self,
        id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let mut removed = 0;

        for partition in self.partitions(id, from, to).await? {
            let (files, passed_from) = self.select_blobs(&partition, from, to).await?;
            let mut kept = Vec::new();
            let mut partition_removed = 0;
            for file in &files {
                for entry in self.read_blob(file).await? {
                    if in_range(&entry.timestamp, from, to) {
                        partition_removed += 1;
                    } else {
                        kept.push(entry);
                    }
                }
            }
            if partition_removed > 0 {
                self.replace_blobs(&partition, &files, &kept).await?;
                remove_if_empty(&partition).await;
                removed += partition_removed;
            }
            if passed_from {
                break;
            }
        }
        Ok(removed)
    }
}

fn in_range(timestamp: &DateTime<Utc>, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> bool {
    from.map_or(true, |f| *timestamp >= f) && to.map_or(true, |t| *timestamp < t)
}

async fn remove_if_empty(partition: &Path) {
    if let Ok(mut dir) = fs::read_dir(partition).await {
        if let Ok(None) = dir.next_entry().await {
            if let Err(e) = fs::remove_dir(partition).await {
                warn!("Failed to remove empty partition {}: {}", partition.display(), e);
            }
        }
    }
}

#[async_trait]
impl Storage for FilesystemStorage {
    async fn write(&self, series: &[Serie]) -> Result<()> {
        for serie in series {
            self.inner.write_serie(serie).await?;
        }
        Ok(())
    }

    async fn delete_range(
        &self,
        ids: &[String],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            removed += self.inner.delete_id(id, from, to).await?;
        }
        Ok(removed)
    }

    async fn read_latest(&self, ids: &[String], count: usize) -> Result<Vec<Serie>> {
        let mut series = Vec::with_capacity(ids.len());
        for id in ids {
            let entries = if count == 0 {
                Vec::new()
            } else {
                self.inner.scan(id, None, None, Some(count)).await?
            };
            series.push(Serie::with_entries(id.clone(), entries, SortOrder::Descending));
        }
        Ok(series)
    }

    async fn read_range(
        &self,
        ids: &[String],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        sort: SortOrder,
    ) -> Result<Vec<Serie>> {
        let mut series = Vec::with_capacity(ids.len());
        for id in ids {
            let mut entries = self.inner.scan(id, from, to, None).await?;
            if sort == SortOrder::Ascending {
                entries.reverse();
            }
            series.push(Serie::with_entries(id.clone(), entries, sort));
        }
        Ok(series)
    }

    fn as_dynamic(&self) -> Option<&dyn DynamicStorage> {
        Some(self)
    }

    async fn health_check(&self) -> Result<bool> {
        if let Err(e) = self.inner.ensure_initialized().await {
            warn!("Health check failed - cannot create base path: {}", e);
            return Ok(false);
        }
        let probe = self.inner.base_path.join(".health_check_test");
        match fs::File::create(&probe).await {
            Ok(mut f) => {
                if let Err(e) = f.write_all(b"test").await {
                    warn!("Health check failed - cannot write: {}", e);
                    return Ok(false);
                }
                let _ = fs::remove_file(&probe).await;
                Ok(true)
            }
            Err(e) => {
                warn!("Health check failed - cannot create file: {}", e);
                Ok(false)
            }
        }
    }

    fn backend_type(&self) -> &str {
        "filesystem"
    }
}

#[async_trait]
impl DynamicStorage for FilesystemStorage {
    /// Offset-based paging; the skip count is only meaningful while the
    /// range is unchanged, so drain loops restart without a token after deleting.
    async fn read_segmented(
        &self,
        id: &str,
        query: &SegmentQuery,
        token: Option<&ContinuationToken>,
    ) -> Result<Segment> {
        let skip = query.skip(token)?;
        let mut all = self.inner.scan(id, query.from, query.to, None).await?;
        if query.sort == SortOrder::Ascending {
            all.reverse();
        }
        let entries: Vec<Entry> = all.into_iter().skip(skip).take(query.segment_size).collect();
        let token = ContinuationToken::Skip {
            skip: skip + entries.len(),
            has_more: query.segment_size > 0 && entries.len() == query.segment_size,
        };

        let inner = self.inner.clone();
        let owner = id.to_string();
        let deleter: SegmentDeleter = Arc::new(move |from: DateTime<Utc>, to: DateTime<Utc>| {
            let inner = inner.clone();
            let owner = owner.clone();
            async move { inner.delete_id(&owner, Some(from), Some(to)).await }.boxed()
        });

        Ok(Segment::new(id, entries, query.sort, token, deleter))
    }
}
