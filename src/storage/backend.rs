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

// Storage traits implemented by every backend

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::aggregate::Aggregation;
use crate::error::{FederationError, Result};
use crate::model::{Entry, Serie, SortOrder};

/// Generic time-series storage backend
///
/// Every operation is atomic only within the backend itself. Bounds are
/// half-open `[from, to)`; `None` means unbounded on that side.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write series, overwriting entries with identical timestamps
    async fn write(&self, series: &[Serie]) -> Result<()>;

    /// Delete entries of `ids` within `[from, to)`, returning how many were removed
    async fn delete_range(
        &self,
        ids: &[String],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<usize>;

    /// Delete every entry of `ids`
    async fn delete_all(&self, ids: &[String]) -> Result<usize> {
        self.delete_range(ids, None, None).await
    }

    /// Read the `count` newest entries of every id, newest first
    async fn read_latest(&self, ids: &[String], count: usize) -> Result<Vec<Serie>>;

    /// Read every entry of `ids`
    async fn read(&self, ids: &[String], sort: SortOrder) -> Result<Vec<Serie>> {
        self.read_range(ids, None, None, sort).await
    }

    /// Read entries of `ids` within `[from, to)`
    async fn read_range(
        &self,
        ids: &[String],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        sort: SortOrder,
    ) -> Result<Vec<Serie>>;

    /// Write with exponential backoff on retryable failures
    async fn write_with_retry(&self, series: &[Serie], max_retries: u32) -> Result<()> {
        use tokio::time::{sleep, Duration};
        use tracing::{info, warn};

        let mut attempt = 0;
        let mut delay = Duration::from_millis(100);

        loop {
            match self.write(series).await {
                Ok(()) => {
                    if attempt > 0 {
                        info!(
                            "Wrote {} series to '{}' after {} retries",
                            series.len(),
                            self.backend_type(),
                            attempt
                        );
                    }
                    return Ok(());
                }
                Err(e) if attempt < max_retries && e.is_retryable() => {
                    warn!(
                        "Write to '{}' failed (attempt {}/{}): {}. Retrying in {:?}",
                        self.backend_type(),
                        attempt + 1,
                        max_retries,
                        e,
                        delay
                    );
                    sleep(delay).await;
                    delay *= 2;
                    delay = delay.min(Duration::from_secs(30));
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        "Write to '{}' failed after {} attempts: {}",
                        self.backend_type(),
                        attempt + 1,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Segmented read/delete capability
    fn as_dynamic(&self) -> Option<&dyn DynamicStorage> {
        None
    }

    /// Native grouped-read capability
    fn as_grouped(&self) -> Option<&dyn GroupedStorage> {
        None
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    /// Backend type identifier
    fn backend_type(&self) -> &str;
}

/// Storage able to page through a key and delete exactly what it returned
#[async_trait]
pub trait DynamicStorage: Storage {
    /// Read one segment; pass the previous segment's token to continue
    async fn read_segmented(
        &self,
        id: &str,
        query: &SegmentQuery,
        token: Option<&ContinuationToken>,
    ) -> Result<Segment>;
}

/// Storage able to aggregate several ids server-side
#[async_trait]
pub trait GroupedStorage: Storage {
    /// Merge `ids` within `[from, to)`, folding same-timestamp entries
    async fn read_grouped(
        &self,
        ids: &[String],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        sort: SortOrder,
        aggregation: &Aggregation,
    ) -> Result<Vec<Entry>>;
}

/// Bounds of a segmented read
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub segment_size: usize,
    pub sort: SortOrder,
}

impl SegmentQuery {
    pub fn new(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>, segment_size: usize) -> Self {
        Self {
            from,
            to,
            segment_size,
            sort: SortOrder::Descending,
        }
    }

    pub fn with_sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    /// Effective bounds after applying a timestamp-boundary token
    ///
    /// Descending reads continue strictly before the boundary, ascending
    /// reads strictly after it.
    pub fn narrowed(
        &self,
        token: Option<&ContinuationToken>,
    ) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
        match token {
            None => Ok((self.from, self.to)),
            Some(ContinuationToken::Timestamp { boundary, .. }) => match self.sort {
                SortOrder::Descending => Ok((self.from, Some(*boundary))),
                SortOrder::Ascending => Ok((Some(just_after(*boundary)), self.to)),
            },
            Some(other) => Err(FederationError::InvalidContinuationToken(format!(
                "expected a timestamp token, got {}",
                other
            ))),
        }
    }

    /// Offset encoded by a skip-count token
    pub fn skip(&self, token: Option<&ContinuationToken>) -> Result<usize> {
        match token {
            None => Ok(0),
            Some(ContinuationToken::Skip { skip, .. }) => Ok(*skip),
            Some(other) => Err(FederationError::InvalidContinuationToken(format!(
                "expected a skip token, got {}",
                other
            ))),
        }
    }
}

/// Smallest representable instant after `timestamp`, saturating at the maximum
pub fn just_after(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp
        .checked_add_signed(ChronoDuration::nanoseconds(1))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Pagination cursor, valid only for the query it was derived from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContinuationToken {
    /// Boundary timestamp of the last returned entry (exclusive next time)
    Timestamp {
        boundary: DateTime<Utc>,
        has_more: bool,
    },
    /// Number of entries already consumed
    Skip { skip: usize, has_more: bool },
}

impl ContinuationToken {
    pub fn has_more(&self) -> bool {
        match self {
            ContinuationToken::Timestamp { has_more, .. } => *has_more,
            ContinuationToken::Skip { has_more, .. } => *has_more,
        }
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContinuationToken::Timestamp { boundary, has_more } => {
                write!(f, "timestamp({}, has_more={})", boundary.to_rfc3339(), has_more)
            }
            ContinuationToken::Skip { skip, has_more } => {
                write!(f, "skip({}, has_more={})", skip, has_more)
            }
        }
    }
}

/// Deletes `[from, to)` of one id on the storage that produced a segment
pub type SegmentDeleter =
    Arc<dyn Fn(DateTime<Utc>, DateTime<Utc>) -> BoxFuture<'static, Result<usize>> + Send + Sync>;

/// One page of a segmented read
pub struct Segment {
    pub id: String,
    pub entries: Vec<Entry>,
    pub sort: SortOrder,
    pub token: ContinuationToken,
    deleter: SegmentDeleter,
}

impl Segment {
    pub fn new(
        id: impl Into<String>,
        entries: Vec<Entry>,
        sort: SortOrder,
        token: ContinuationToken,
        deleter: SegmentDeleter,
    ) -> Self {
        Self {
            id: id.into(),
            entries,
            sort,
            token,
            deleter,
        }
    }

    /// Route this segment's delete through `wrap`, e.g. to gate it
    pub fn map_deleter(mut self, wrap: impl FnOnce(SegmentDeleter) -> SegmentDeleter) -> Self {
        self.deleter = wrap(self.deleter);
        self
    }

    pub fn has_more(&self) -> bool {
        self.token.has_more()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_serie(self) -> Serie {
        Serie::with_entries(self.id, self.entries, self.sort)
    }

    /// Delete exactly the entries of this segment
    ///
    /// The range comes from the batch's min/max timestamps, not from the
    /// token, so calling it again removes nothing.
    pub async fn delete(&self) -> Result<usize> {
        let (Some(first), Some(last)) = (self.entries.first(), self.entries.last()) else {
            return Ok(0);
        };
        let oldest = first.timestamp.min(last.timestamp);
        let newest = first.timestamp.max(last.timestamp);
        (self.deleter)(oldest, just_after(newest)).await
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("entries", &self.entries.len())
            .field("sort", &self.sort)
            .field("token", &self.token)
            .finish()
    }
}

/// Timestamp token for a page; `has_more` iff the page was full
pub fn timestamp_token(entries: &[Entry], segment_size: usize, fallback: DateTime<Utc>) -> ContinuationToken {
    ContinuationToken::Timestamp {
        boundary: entries.last().map(|e| e.timestamp).unwrap_or(fallback),
        has_more: segment_size > 0 && entries.len() == segment_size,
    }
}
