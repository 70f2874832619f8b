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

// Bounded-concurrency wrapper around any storage

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::sync::Arc;

use super::backend::{
    ContinuationToken, DynamicStorage, GroupedStorage, Segment, SegmentDeleter, SegmentQuery, Storage,
};
use crate::aggregate::Aggregation;
use crate::concurrency::ConcurrencyGate;
use crate::error::{FederationError, Result};
use crate::model::{Entry, Serie, SortOrder};

/// Caps in-flight reads and writes against one storage instance
///
/// Deletes count as writes. Capabilities of the wrapped storage are
/// preserved and gated the same way.
pub struct ThrottledStorage<S: ?Sized = dyn Storage> {
    inner: Arc<S>,
    gate: ConcurrencyGate,
}

impl<S: Storage + ?Sized> ThrottledStorage<S> {
    pub fn new(inner: Arc<S>, gate: ConcurrencyGate) -> Self {
        Self { inner, gate }
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }
}

#[async_trait]
impl<S: Storage + ?Sized + 'static> Storage for ThrottledStorage<S> {
    async fn write(&self, series: &[Serie]) -> Result<()> {
        let _permit = self.gate.acquire_write().await?;
        self.inner.write(series).await
    }

    async fn delete_range(
        &self,
        ids: &[String],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let _permit = self.gate.acquire_write().await?;
        self.inner.delete_range(ids, from, to).await
    }

    async fn read_latest(&self, ids: &[String], count: usize) -> Result<Vec<Serie>> {
        let _permit = self.gate.acquire_read().await?;
        self.inner.read_latest(ids, count).await
    }

    async fn read_range(
        &self,
        ids: &[String],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        sort: SortOrder,
    ) -> Result<Vec<Serie>> {
        let _permit = self.gate.acquire_read().await?;
        self.inner.read_range(ids, from, to, sort).await
    }

    fn as_dynamic(&self) -> Option<&dyn DynamicStorage> {
        self.inner.as_dynamic().map(|_| self as &dyn DynamicStorage)
    }

    fn as_grouped(&self) -> Option<&dyn GroupedStorage> {
        self.inner.as_grouped().map(|_| self as &dyn GroupedStorage)
    }

    async fn health_check(&self) -> Result<bool> {
        self.inner.health_check().await
    }

    fn backend_type(&self) -> &str {
        self.inner.backend_type()
    }
}

#[async_trait]
impl<S: Storage + ?Sized + 'static> DynamicStorage for ThrottledStorage<S> {
    async fn read_segmented(
        &self,
        id: &str,
        query: &SegmentQuery,
        token: Option<&ContinuationToken>,
    ) -> Result<Segment> {
        let dynamic = self
            .inner
            .as_dynamic()
            .ok_or(FederationError::MissingCollaborator("segmented storage"))?;
        let segment = {
            let _permit = self.gate.acquire_read().await?;
            dynamic.read_segmented(id, query, token).await?
        };

        let gate = self.gate.clone();
        Ok(segment.map_deleter(move |inner: SegmentDeleter| -> SegmentDeleter {
            Arc::new(move |from: DateTime<Utc>, to: DateTime<Utc>| {
                let gate = gate.clone();
                let inner = inner.clone();
                async move {
                    let _permit = gate.acquire_write().await?;
                    inner(from, to).await
                }
                .boxed()
            })
        }))
    }
}

#[async_trait]
impl<S: Storage + ?Sized + 'static> GroupedStorage for ThrottledStorage<S> {
    async fn read_grouped(
        &self,
        ids: &[String],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        sort: SortOrder,
        aggregation: &Aggregation,
    ) -> Result<Vec<Entry>> {
        let grouped = self
            .inner
            .as_grouped()
            .ok_or(FederationError::MissingCollaborator("grouped storage"))?;
        let _permit = self.gate.acquire_read().await?;
        grouped.read_grouped(ids, from, to, sort, aggregation).await
    }
}
