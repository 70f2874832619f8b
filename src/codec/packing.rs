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

//! Size-bounded entry packing
//!
//! Turns a newest-first run of entries into backend-cell-sized blobs.
//!
//! # Blob Format
//!
//! A blob is a plain concatenation of frames, oldest entry first:
//!
//! ```text
//! [len: u32 LE][entry bytes] [len: u32 LE][entry bytes] ...
//! ```
//!
//! Storing oldest-first makes an ascending read a forward scan and a
//! descending read a reverse scan, so neither direction re-sorts.
//!
//! A blob never spans two calendar years, so every blob is addressable by
//! exactly one partition key (see [`crate::keys`]).

use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};
use std::sync::Arc;
use tracing::debug;

use super::entry::EntrySerializer;
use crate::error::{FederationError, Result};
use crate::model::{Entry, SortOrder};

/// Bytes of the length prefix in front of every entry
pub const FRAME_HEADER_BYTES: usize = 4;

/// One backend cell holding several serialized entries
#[derive(Debug, Clone, PartialEq)]
pub struct PackedBlob {
    /// Timestamp of the oldest entry in the blob
    pub from: DateTime<Utc>,
    /// Timestamp of the newest entry in the blob
    pub to: DateTime<Utc>,
    pub count: usize,
    pub data: Bytes,
}

struct BlobBuilder {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    year: i32,
    count: usize,
    data: Vec<u8>,
}

impl BlobBuilder {
    fn new(first: DateTime<Utc>) -> Self {
        Self {
            from: first,
            to: first,
            year: first.year(),
            count: 0,
            data: Vec::new(),
        }
    }

    fn push(&mut self, encoded: &[u8], timestamp: DateTime<Utc>) {
        self.data
            .extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        self.data.extend_from_slice(encoded);
        self.to = timestamp;
        self.count += 1;
    }

    fn finish(self) -> PackedBlob {
        PackedBlob {
            from: self.from,
            to: self.to,
            count: self.count,
            data: Bytes::from(self.data),
        }
    }
}

/// Packs and unpacks entries using a per-entry serializer
#[derive(Clone)]
pub struct EntryPacker {
    serializer: Arc<dyn EntrySerializer>,
    max_blob_bytes: usize,
}

impl EntryPacker {
    pub fn new(serializer: Arc<dyn EntrySerializer>, max_blob_bytes: usize) -> Self {
        Self {
            serializer,
            max_blob_bytes,
        }
    }

    pub fn max_blob_bytes(&self) -> usize {
        self.max_blob_bytes
    }

    /// Pack entries given newest-first into blobs, returned newest-first
    ///
    /// A new blob starts when the running size plus one worst-case entry
    /// would exceed the limit, or when the calendar year changes.
    ///
    /// # Errors
    ///
    /// `EntryTooLarge` when a single framed entry exceeds the blob limit.
    pub fn pack(&self, entries: &[Entry]) -> Result<Vec<PackedBlob>> {
        debug_assert!(
            entries
                .windows(2)
                .all(|w| w[0].timestamp >= w[1].timestamp),
            "pack expects entries sorted newest-first"
        );

        let worst_case = self
            .serializer
            .max_entry_size()
            .map(|size| size + FRAME_HEADER_BYTES);

        let mut blobs = Vec::new();
        let mut current: Option<BlobBuilder> = None;
        let mut scratch = Vec::new();

        for entry in entries.iter().rev() {
            scratch.clear();
            self.serializer.serialize(entry, &mut scratch)?;

            let framed = scratch.len() + FRAME_HEADER_BYTES;
            if framed > self.max_blob_bytes {
                return Err(FederationError::EntryTooLarge {
                    size: framed,
                    max: self.max_blob_bytes,
                });
            }

            let reserve = worst_case.map_or(framed, |w| w.max(framed));
            let starts_new_blob = current.as_ref().is_some_and(|blob| {
                blob.data.len() + reserve > self.max_blob_bytes
                    || blob.year != entry.timestamp.year()
            });
            if starts_new_blob {
                if let Some(blob) = current.take() {
                    blobs.push(blob.finish());
                }
            }

            current
                .get_or_insert_with(|| BlobBuilder::new(entry.timestamp))
                .push(&scratch, entry.timestamp);
        }

        if let Some(blob) = current {
            blobs.push(blob.finish());
        }
        blobs.reverse();

        debug!(
            "Packed {} entries into {} blobs (limit {} bytes)",
            entries.len(),
            blobs.len(),
            self.max_blob_bytes
        );

        Ok(blobs)
    }

    /// Decode every entry of a blob in the requested direction
    pub fn unpack(&self, data: &[u8], sort: SortOrder) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        let mut offset = 0usize;

        while offset < data.len() {
            let header = data
                .get(offset..offset + FRAME_HEADER_BYTES)
                .ok_or_else(|| truncated(offset))?;
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            offset += FRAME_HEADER_BYTES;

            let body = data.get(offset..offset + len).ok_or_else(|| truncated(offset))?;
            entries.push(self.serializer.deserialize(body)?);
            offset += len;
        }

        if sort == SortOrder::Descending {
            entries.reverse();
        }
        Ok(entries)
    }
}

fn truncated(offset: usize) -> FederationError {
    FederationError::Serialization(format!("blob truncated at byte {}", offset))
}
