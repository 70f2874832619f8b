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

// In-memory cache backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

use super::backend::{
    timestamp_token, ContinuationToken, DynamicStorage, GroupedStorage, Segment, SegmentDeleter,
    SegmentQuery, Storage,
};
use crate::aggregate::Aggregation;
use crate::error::{FederationError, Result};
use crate::merge::merge_aggregated;
use crate::model::{Entry, Serie, SortOrder};

type Series = DashMap<String, BTreeMap<DateTime<Utc>, Entry>>;

/// Ordered in-memory storage, usable as a hot tier
///
/// Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    series: Arc<Series>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored entries across ids
    pub fn len(&self) -> usize {
        self.series.iter().map(|s| s.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn range_of(
        &self,
        id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        sort: SortOrder,
        limit: Option<usize>,
    ) -> Vec<Entry> {
        let Some(bounds) = bounds(from, to) else {
            return Vec::new();
        };
        let Some(entries) = self.series.get(id) else {
            return Vec::new();
        };
        let limit = limit.unwrap_or(usize::MAX);
        let range = entries.range(bounds);
        match sort {
            SortOrder::Ascending => range.take(limit).map(|(_, e)| e.clone()).collect(),
            SortOrder::Descending => range.rev().take(limit).map(|(_, e)| e.clone()).collect(),
        }
    }
}

fn bounds(
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Option<(Bound<DateTime<Utc>>, Bound<DateTime<Utc>>)> {
    if let (Some(from), Some(to)) = (from, to) {
        if from >= to {
            return None;
        }
    }
    Some((
        from.map_or(Bound::Unbounded, Bound::Included),
        to.map_or(Bound::Unbounded, Bound::Excluded),
    ))
}

fn delete_from(
    series: &Series,
    id: &str,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> usize {
    let Some(bounds) = bounds(from, to) else {
        return 0;
    };
    let Some(mut entries) = series.get_mut(id) else {
        return 0;
    };
    let doomed: Vec<DateTime<Utc>> = entries.range(bounds).map(|(ts, _)| *ts).collect();
    for ts in &doomed {
        entries.remove(ts);
    }
    doomed.len()
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn write(&self, series: &[Serie]) -> Result<()> {
        for serie in series {
            let mut entries = self.series.entry(serie.key.clone()).or_default();
            for entry in &serie.entries {
                entries.insert(entry.timestamp, entry.clone());
            }
        }
        Ok(())
    }

    async fn delete_range(
        &self,
        ids: &[String],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let removed = ids
            .iter()
            .map(|id| delete_from(&self.series, id, from, to))
            .sum();
        debug!("Deleted {} entries from memory storage", removed);
        Ok(removed)
    }

    async fn read_latest(&self, ids: &[String], count: usize) -> Result<Vec<Serie>> {
        Ok(ids
            .iter()
            .map(|id| {
                let entries = self.range_of(id, None, None, SortOrder::Descending, Some(count));
                Serie::with_entries(id.clone(), entries, SortOrder::Descending)
            })
            .collect())
    }

    async fn read_range(
        &self,
        ids: &[String],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        sort: SortOrder,
    ) -> Result<Vec<Serie>> {
        Ok(ids
            .iter()
            .map(|id| Serie::with_entries(id.clone(), self.range_of(id, from, to, sort, None), sort))
            .collect())
    }

    fn as_dynamic(&self) -> Option<&dyn DynamicStorage> {
        Some(self)
    }

    fn as_grouped(&self) -> Option<&dyn GroupedStorage> {
        Some(self)
    }

    fn backend_type(&self) -> &str {
        "memory"
    }
}

#[async_trait]
impl DynamicStorage for MemoryStorage {
    async fn read_segmented(
        &self,
        id: &str,
        query: &SegmentQuery,
        token: Option<&ContinuationToken>,
    ) -> Result<Segment> {
        let (from, to) = query.narrowed(token)?;
        let entries = self.range_of(id, from, to, query.sort, Some(query.segment_size));
        let token = timestamp_token(&entries, query.segment_size, Utc::now());

        let series = self.series.clone();
        let owner = id.to_string();
        let deleter: SegmentDeleter = Arc::new(move |from: DateTime<Utc>, to: DateTime<Utc>| {
            let removed = delete_from(&series, &owner, Some(from), Some(to));
            async move { Ok::<_, FederationError>(removed) }.boxed()
        });

        Ok(Segment::new(id, entries, query.sort, token, deleter))
    }
}

#[async_trait]
impl GroupedStorage for MemoryStorage {
    async fn read_grouped(
        &self,
        ids: &[String],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        sort: SortOrder,
        aggregation: &Aggregation,
    ) -> Result<Vec<Entry>> {
        let series = self.read_range(ids, from, to, sort).await?;
        Ok(merge_aggregated(series, sort, aggregation))
    }
}
