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

//! Order-preserving partition/row key encoding
//!
//! Sorted string-keyed backends only offer ascending lexicographic range scans.
//! Both keys are built so that ascending string order equals *descending*
//! chronological order, making "newest first" the natural scan direction:
//!
//! - partition key: `{id}|{9999 - year:04}`
//! - row key: `{MAX_TICKS - ticks:019}`
//!
//! Ticks are 100ns intervals since 0001-01-01T00:00:00Z. Encoding is
//! write-only addressing; payloads carry the real timestamp.

use chrono::{DateTime, Datelike, Utc};

use crate::error::Result;

/// Largest representable tick count (9999-12-31T23:59:59.9999999Z)
pub const MAX_TICKS: i64 = 3_155_378_975_999_999_999;

/// Seconds between 0001-01-01 and the unix epoch
const EPOCH_OFFSET_SECONDS: i64 = 62_135_596_800;

const TICKS_PER_SECOND: i64 = 10_000_000;

/// Separator between the id and the year suffix of a partition key
pub const PARTITION_SEPARATOR: char = '|';

/// Suffix of the partition holding the latest possible year
pub const MAX_PARTITION_SUFFIX: &str = "0000";

/// Suffix of the partition holding the earliest possible year
pub const MIN_PARTITION_SUFFIX: &str = "9999";

/// Convert a timestamp to 100ns ticks since 0001-01-01, clamped to `[0, MAX_TICKS]`
pub fn to_ticks(timestamp: &DateTime<Utc>) -> i64 {
    let seconds = timestamp.timestamp() + EPOCH_OFFSET_SECONDS;
    let sub = i64::from(timestamp.timestamp_subsec_nanos()) / 100;
    seconds
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add(sub)
        .clamp(0, MAX_TICKS)
}

/// Year suffix for a timestamp: `9999 - year`, always four digits
pub fn partition_suffix(timestamp: &DateTime<Utc>) -> String {
    let year = timestamp.year().clamp(0, 9999);
    format!("{:04}", 9999 - year)
}

/// Partition key for an id at a given time
pub fn partition_key(id: &str, timestamp: &DateTime<Utc>) -> String {
    format!("{}{}{}", id, PARTITION_SEPARATOR, partition_suffix(timestamp))
}

/// Row key for a timestamp (19-digit reversed tick count)
pub fn row_key(timestamp: &DateTime<Utc>) -> String {
    format!("{:019}", MAX_TICKS - to_ticks(timestamp))
}

/// Partition key sorting before every real partition of `id` (newest bound)
pub fn max_partition_key(id: &str) -> String {
    format!("{}{}{}", id, PARTITION_SEPARATOR, MAX_PARTITION_SUFFIX)
}

/// Partition key sorting after every real partition of `id` (oldest bound)
pub fn min_partition_key(id: &str) -> String {
    format!("{}{}{}", id, PARTITION_SEPARATOR, MIN_PARTITION_SUFFIX)
}

/// Bidirectional mapping between a typed key and its storage identifier
pub trait KeyConverter<K>: Send + Sync {
    fn to_id(&self, key: &K) -> String;

    fn from_id(&self, id: &str) -> Result<K>;
}

/// Identity converter for plain string keys
#[derive(Debug, Clone, Copy, Default)]
pub struct StringKeyConverter;

impl KeyConverter<String> for StringKeyConverter {
    fn to_id(&self, key: &String) -> String {
        key.clone()
    }

    fn from_id(&self, id: &str) -> Result<String> {
        Ok(id.to_string())
    }
}
