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

//! Client façade over the federated storages.
//!
//! Writes are routed per entry to the one dynamic-tier storage whose window
//! contains it. Reads fan out to every dynamic and volume window that
//! intersects the requested range and merge the results first-wins, newest
//! window first. Storage calls are issued concurrently; a failing storage
//! never cancels its siblings.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::aggregate::Aggregation;
use crate::config::{ClientSettings, FederationConfig};
use crate::error::{FederationError, Result};
use crate::keys::{KeyConverter, StringKeyConverter};
use crate::merge::{merge_aggregated, merge_first_wins};
use crate::migration::{MigrationJob, MigrationPlanner};
use crate::model::{Entry, Serie, SortOrder};
use crate::pubsub::{
    LocalPublishSubscribe, PublicationType, PublishSubscribe, Subscription, SubscriptionCallback,
    SubscriptionType,
};
use crate::selector::{compare_from, StaticStorageSelector, StorageSelection, StorageSelector};
use crate::storage::{BackendFactory, SegmentQuery, Storage, TemporaryStorage};

/// Outcome of a migration run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub jobs: usize,
    pub moved: usize,
    /// Rendered errors of failed jobs; the other jobs still ran
    pub failures: Vec<String>,
}

impl MigrationReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct ClientBuilder<K> {
    dynamic: Arc<dyn StorageSelector>,
    volume: Option<Arc<dyn StorageSelector>>,
    temporary: Option<Arc<dyn TemporaryStorage>>,
    remote: Option<Arc<dyn PublishSubscribe>>,
    converter: Arc<dyn KeyConverter<K>>,
    settings: ClientSettings,
}

impl<K> ClientBuilder<K>
where
    K: Clone + Send + Sync + 'static,
{
    pub fn new(dynamic: Arc<dyn StorageSelector>, converter: Arc<dyn KeyConverter<K>>) -> Self {
        Self {
            dynamic,
            volume: None,
            temporary: None,
            remote: None,
            converter,
            settings: ClientSettings::default(),
        }
    }

    pub fn volume(mut self, volume: Arc<dyn StorageSelector>) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn temporary(mut self, temporary: Arc<dyn TemporaryStorage>) -> Self {
        self.temporary = Some(temporary);
        self
    }

    pub fn remote(mut self, remote: Arc<dyn PublishSubscribe>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Client<K> {
        let planner = self
            .volume
            .as_ref()
            .map(|volume| MigrationPlanner::new(self.dynamic.clone(), volume.clone()));

        Client {
            dynamic: self.dynamic,
            volume: self.volume,
            planner,
            temporary: self.temporary,
            local: Arc::new(LocalPublishSubscribe::new()),
            remote: self.remote,
            converter: self.converter,
            settings: self.settings,
        }
    }
}

pub struct Client<K = String> {
    dynamic: Arc<dyn StorageSelector>,
    volume: Option<Arc<dyn StorageSelector>>,
    planner: Option<MigrationPlanner>,
    temporary: Option<Arc<dyn TemporaryStorage>>,
    local: Arc<LocalPublishSubscribe>,
    remote: Option<Arc<dyn PublishSubscribe>>,
    converter: Arc<dyn KeyConverter<K>>,
    settings: ClientSettings,
}

impl Client<String> {
    /// Build storages, selectors and the temporary storage from configuration
    pub fn from_config(config: &FederationConfig) -> anyhow::Result<Self> {
        let storages = BackendFactory::create_all(&config.storages)?;

        let dynamic = StaticStorageSelector::from_rules(&config.topology.dynamic, &storages)?;
        let mut builder = ClientBuilder::new(Arc::new(dynamic), Arc::new(StringKeyConverter))
            .settings(config.client.clone());

        if !config.topology.volume.is_empty() {
            let volume = StaticStorageSelector::from_rules(&config.topology.volume, &storages)?;
            builder = builder.volume(Arc::new(volume));
        }

        if let Some(temporary) = BackendFactory::create_temporary(&config.temporary)? {
            builder = builder.temporary(temporary);
        }

        info!(
            "Client ready with {} storages ({} dynamic, {} volume windows)",
            storages.len(),
            config.topology.dynamic.len(),
            config.topology.volume.len()
        );
        Ok(builder.build())
    }
}

impl<K> Client<K>
where
    K: Clone + Send + Sync + 'static,
{
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn local(&self) -> &Arc<LocalPublishSubscribe> {
        &self.local
    }

    pub fn converter(&self) -> &Arc<dyn KeyConverter<K>> {
        &self.converter
    }

    fn default_publication(&self) -> PublicationType {
        if self.settings.publish_after_write {
            PublicationType::Latest
        } else {
            PublicationType::None
        }
    }

    fn to_ids(&self, keys: &[K]) -> Vec<String> {
        keys.iter().map(|key| self.converter.to_id(key)).collect()
    }

    pub fn resolve_series(&self, series: Vec<Serie<K>>) -> Vec<Serie> {
        series
            .into_iter()
            .map(|serie| {
                let id = self.converter.to_id(&serie.key);
                serie.map_key(|_| id)
            })
            .collect()
    }

    // ---------------------------------------------------------------- writes

    pub async fn write(&self, series: Vec<Serie<K>>) -> Result<()> {
        self.write_with_publication(series, self.default_publication())
            .await
    }

    pub async fn write_with_publication(
        &self,
        series: Vec<Serie<K>>,
        publication: PublicationType,
    ) -> Result<()> {
        let series = self.resolve_series(series);
        self.write_resolved(series, publication, true).await
    }

    /// Fail with `NoStorageForKey` when some entry has no authoritative storage
    pub fn check_routing(&self, series: &[Serie]) -> Result<()> {
        for serie in series {
            for entry in &serie.entries {
                self.dynamic.select_for_write(&serie.key, &entry.timestamp)?;
            }
        }
        Ok(())
    }

    /// Group entries by the storage authoritative for them
    fn route(&self, series: &[Serie]) -> Result<Vec<(StorageSelection, Vec<Serie>)>> {
        let mut routed: Vec<(StorageSelection, Vec<Serie>)> = Vec::new();

        for serie in series.iter().filter(|s| !s.is_empty()) {
            for entry in &serie.entries {
                let selection = self.dynamic.select_for_write(&serie.key, &entry.timestamp)?;
                let slot = match routed.iter().position(|(s, _)| s.same_as(&selection)) {
                    Some(slot) => slot,
                    None => {
                        routed.push((selection, Vec::new()));
                        routed.len() - 1
                    }
                };

                let batch = &mut routed[slot].1;
                match batch.last_mut() {
                    Some(last) if last.key == serie.key => last.push(entry.clone()),
                    _ => batch.push(Serie::with_entries(
                        serie.key.clone(),
                        vec![entry.clone()],
                        serie.sort,
                    )),
                }
            }
        }
        Ok(routed)
    }

    /// Write id-keyed series; failed storages are shunted to temporary storage when allowed
    pub async fn write_resolved(
        &self,
        series: Vec<Serie>,
        publication: PublicationType,
        use_temporary: bool,
    ) -> Result<()> {
        let routed = self.route(&series)?;
        if routed.is_empty() {
            return Ok(());
        }

        let retries = self.settings.write_retries;
        let results = join_all(routed.into_iter().map(|(selection, batch)| async move {
            let result = selection.storage.write_with_retry(&batch, retries).await;
            (selection, batch, result)
        }))
        .await;

        let attempted = results.len();
        let mut written = Vec::new();
        let mut failed = Vec::new();
        let mut errors = Vec::new();
        for (selection, batch, result) in results {
            match result {
                Ok(()) => {
                    debug!("Wrote {} series to '{}'", batch.len(), selection.name);
                    written.extend(batch);
                }
                Err(e) => {
                    warn!("Write to '{}' failed: {}", selection.name, e);
                    errors.push(format!("{}: {}", selection.name, e));
                    failed.extend(batch);
                }
            }
        }

        self.publish(&written, publication).await;

        if failed.is_empty() {
            return Ok(());
        }

        if use_temporary {
            if let Some(temporary) = &self.temporary {
                match temporary.write(&failed).await {
                    Ok(()) => {
                        warn!(
                            "Shunted {} series to temporary storage after {} failed writes",
                            failed.len(),
                            errors.len()
                        );
                        return Ok(());
                    }
                    Err(e) => error!("Temporary storage rejected {} series: {}", failed.len(), e),
                }
            }
        }

        Err(FederationError::PartialWriteFailure {
            failed: errors.len(),
            succeeded: attempted - errors.len(),
            errors,
        })
    }

    async fn publish(&self, series: &[Serie], publication: PublicationType) {
        if series.is_empty() || publication == PublicationType::None {
            return;
        }
        if let Err(e) = self.local.publish(series, publication).await {
            warn!("Local publish failed: {}", e);
        }
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.publish(series, publication).await {
                warn!("Remote publish failed: {}", e);
            }
        }
    }

    // ----------------------------------------------------------------- reads

    /// Every window of both tiers intersecting `[from, to)`, newest first
    fn read_selections(
        &self,
        id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Vec<StorageSelection> {
        let mut selections = self.dynamic.select_for_read(id, from, to);
        if let Some(volume) = &self.volume {
            selections.extend(volume.select_for_read(id, from, to));
        }
        // Stable, so the dynamic tier wins ties
        selections.sort_by(|a, b| compare_from(&b.from, &a.from));

        let mut unique: Vec<StorageSelection> = Vec::with_capacity(selections.len());
        for selection in selections {
            if !unique.iter().any(|s| s.same_as(&selection)) {
                unique.push(selection);
            }
        }
        unique
    }

    async fn read_id(
        &self,
        id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        sort: SortOrder,
    ) -> Result<Vec<Entry>> {
        let selections = self.read_selections(id, from, to);
        let ids = [id.to_string()];
        let results = join_all(
            selections
                .iter()
                .map(|s| s.storage.read_range(&ids, s.from, s.to, sort)),
        )
        .await;

        let mut series = Vec::with_capacity(results.len());
        for result in results {
            series.extend(result?);
        }
        Ok(merge_first_wins(series, sort))
    }

    async fn read_latest_id(&self, id: &str, count: usize) -> Result<Vec<Entry>> {
        let selections = self.read_selections(id, None, None);
        let ids = [id.to_string()];
        let results = join_all(selections.iter().map(|s| latest_in(s, &ids, count))).await;

        let mut series = Vec::with_capacity(results.len());
        for result in results {
            series.extend(result?);
        }
        let mut entries = merge_first_wins(series, SortOrder::Descending);
        entries.truncate(count);
        Ok(entries)
    }

    /// The `count` newest entries per key, newest first
    pub async fn read_latest(&self, keys: &[K], count: usize) -> Result<Vec<Serie<K>>> {
        let ids = self.to_ids(keys);
        let results = join_all(ids.iter().map(|id| self.read_latest_id(id, count))).await;

        keys.iter()
            .zip(results)
            .map(|(key, entries)| Ok(Serie::with_entries(key.clone(), entries?, SortOrder::Descending)))
            .collect()
    }

    pub async fn read(&self, keys: &[K], sort: SortOrder) -> Result<Vec<Serie<K>>> {
        self.read_range(keys, None, None, sort).await
    }

    pub async fn read_range(
        &self,
        keys: &[K],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        sort: SortOrder,
    ) -> Result<Vec<Serie<K>>> {
        let ids = self.to_ids(keys);
        let results = join_all(ids.iter().map(|id| self.read_id(id, from, to, sort))).await;

        keys.iter()
            .zip(results)
            .map(|(key, entries)| Ok(Serie::with_entries(key.clone(), entries?, sort)))
            .collect()
    }

    /// Read `keys` as one serie under `group`, folding equal timestamps
    pub async fn read_grouped(
        &self,
        group: K,
        keys: &[K],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        sort: SortOrder,
        aggregation: &Aggregation,
    ) -> Result<Serie<K>> {
        let ids = self.to_ids(keys);
        if ids.is_empty() {
            return Ok(Serie::with_entries(group, Vec::new(), sort));
        }

        let entries = match self.shared_grouped_selections(&ids, from, to) {
            Some(selections) => {
                debug!("Native grouped read of {} keys over {} storages", ids.len(), selections.len());
                let results = join_all(selections.iter().map(|s| async {
                    let grouped = s
                        .storage
                        .as_grouped()
                        .ok_or(FederationError::MissingCollaborator("grouped storage"))?;
                    grouped.read_grouped(&ids, s.from, s.to, sort, aggregation).await
                }))
                .await;

                let mut series = Vec::with_capacity(results.len());
                for result in results {
                    series.push(Serie::with_entries((), result?, sort));
                }
                merge_first_wins(series, sort)
            }
            None => {
                let results = join_all(ids.iter().map(|id| self.read_id(id, from, to, sort))).await;
                let mut series = Vec::with_capacity(results.len());
                for (id, result) in ids.iter().zip(results) {
                    series.push(Serie::with_entries(id.clone(), result?, sort));
                }
                merge_aggregated(series, sort, aggregation)
            }
        };

        Ok(Serie::with_entries(group, entries, sort))
    }

    /// Selections usable for a native grouped read: identical for every id and all grouped-capable
    fn shared_grouped_selections(
        &self,
        ids: &[String],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Option<Vec<StorageSelection>> {
        let first = self.read_selections(&ids[0], from, to);
        if first.iter().any(|s| s.storage.as_grouped().is_none()) {
            return None;
        }
        for id in &ids[1..] {
            let other = self.read_selections(id, from, to);
            let same = other.len() == first.len()
                && other.iter().zip(&first).all(|(a, b)| a.same_as(b));
            if !same {
                return None;
            }
        }
        Some(first)
    }

    // --------------------------------------------------------------- deletes

    pub async fn delete_range(
        &self,
        keys: &[K],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let ids = self.to_ids(keys);
        let targets: Vec<(String, StorageSelection)> = ids
            .iter()
            .flat_map(|id| {
                self.read_selections(id, from, to)
                    .into_iter()
                    .map(move |s| (id.clone(), s))
            })
            .collect();

        let results = join_all(targets.iter().map(|(id, s)| async move {
            s.storage
                .delete_range(std::slice::from_ref(id), s.from, s.to)
                .await
        }))
        .await;

        let mut removed = 0;
        let mut first_error = None;
        for ((id, selection), result) in targets.iter().zip(results) {
            match result {
                Ok(n) => removed += n,
                Err(e) => {
                    error!("Delete of '{}' on '{}' failed: {}", id, selection.name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!("Deleted {} entries of {} keys", removed, ids.len());
                Ok(removed)
            }
        }
    }

    pub async fn delete_all(&self, keys: &[K]) -> Result<usize> {
        self.delete_range(keys, None, None).await
    }

    // ------------------------------------------------------------- migration

    /// Move `[min_from, max_to)` of `keys` from the dynamic to the volume tier
    pub async fn migrate(
        &self,
        keys: &[K],
        min_from: Option<DateTime<Utc>>,
        max_to: Option<DateTime<Utc>>,
        segment_size: usize,
    ) -> Result<MigrationReport> {
        let planner = self
            .planner
            .as_ref()
            .ok_or(FederationError::MissingCollaborator("volume storage selector"))?;

        let jobs: Vec<MigrationJob> = self
            .to_ids(keys)
            .iter()
            .flat_map(|id| planner.plan(id, min_from, max_to))
            .collect();

        let results = join_all(jobs.iter().map(|job| job.run(segment_size))).await;

        let mut report = MigrationReport {
            jobs: jobs.len(),
            ..Default::default()
        };
        for (job, result) in jobs.iter().zip(results) {
            match result {
                Ok(moved) => report.moved += moved,
                Err(e) => {
                    error!(
                        "Migration of '{}' from '{}' to '{}' failed: {}",
                        job.id, job.hot.name, job.cold.name, e
                    );
                    report
                        .failures
                        .push(format!("{} ({} -> {}): {}", job.id, job.hot.name, job.cold.name, e));
                }
            }
        }
        Ok(report)
    }

    // ----------------------------------------------------------- temporary

    /// Replay series shunted to temporary storage, `batch_size` entries at a time
    ///
    /// A batch is removed only after it was written; on error it stays put.
    pub async fn move_from_temporary_storage(&self, batch_size: usize) -> Result<usize> {
        let temporary = self
            .temporary
            .as_ref()
            .ok_or(FederationError::MissingCollaborator("temporary storage"))?;

        let mut moved = 0;
        loop {
            let batch = temporary.read(batch_size).await?;
            if batch.is_empty() {
                break;
            }

            let entries = batch.entry_count();
            self.write_resolved(batch.series.clone(), self.default_publication(), false)
                .await?;
            batch.delete().await?;
            moved += entries;
        }

        if moved > 0 {
            info!("Moved {} entries out of temporary storage", moved);
        }
        Ok(moved)
    }

    // ---------------------------------------------------------- subscribing

    fn typed_callback(
        &self,
        callback: impl Fn(Serie<K>) + Send + Sync + 'static,
    ) -> SubscriptionCallback {
        let converter = self.converter.clone();
        Arc::new(move |serie: &Serie| match converter.from_id(&serie.key) {
            Ok(key) => callback(serie.clone().map_key(|_| key)),
            Err(e) => warn!("Dropping publication for '{}': {}", serie.key, e),
        })
    }

    /// Subscribe to writes made through this client
    pub async fn subscribe_local(
        &self,
        keys: &[K],
        kind: SubscriptionType,
        callback: impl Fn(Serie<K>) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.local
            .subscribe(&self.to_ids(keys), kind, self.typed_callback(callback))
            .await
    }

    pub async fn subscribe_local_all(
        &self,
        kind: SubscriptionType,
        callback: impl Fn(Serie<K>) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.local.subscribe_all(kind, self.typed_callback(callback)).await
    }

    /// Subscribe through the remote publish/subscribe
    pub async fn subscribe(
        &self,
        keys: &[K],
        kind: SubscriptionType,
        callback: impl Fn(Serie<K>) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let remote = self
            .remote
            .as_ref()
            .ok_or(FederationError::MissingCollaborator("remote publish/subscribe"))?;
        remote
            .subscribe(&self.to_ids(keys), kind, self.typed_callback(callback))
            .await
    }

    /// Health of every declared storage, by name
    pub async fn health_check(&self) -> HashMap<String, bool> {
        let mut storages: HashMap<String, Arc<dyn Storage>> = HashMap::new();
        let mut declared = self.dynamic.declared();
        if let Some(volume) = &self.volume {
            declared.extend(volume.declared());
        }
        for selection in declared {
            storages.entry(selection.name).or_insert(selection.storage);
        }

        let results = join_all(storages.values().map(|s| s.health_check())).await;
        storages
            .keys()
            .zip(results)
            .map(|(name, result)| (name.clone(), result.unwrap_or(false)))
            .collect()
    }
}

/// Newest `count` entries of one selection, staying inside its window
async fn latest_in(selection: &StorageSelection, ids: &[String], count: usize) -> Result<Vec<Serie>> {
    if selection.from.is_none() && selection.to.is_none() {
        return selection.storage.read_latest(ids, count).await;
    }

    match selection.storage.as_dynamic() {
        Some(dynamic) => {
            let query = SegmentQuery::new(selection.from, selection.to, count);
            let mut series = Vec::with_capacity(ids.len());
            for id in ids {
                series.push(dynamic.read_segmented(id, &query, None).await?.into_serie());
            }
            Ok(series)
        }
        None => {
            let mut series = selection
                .storage
                .read_range(ids, selection.from, selection.to, SortOrder::Descending)
                .await?;
            for serie in &mut series {
                serie.entries.truncate(count);
            }
            Ok(series)
        }
    }
}
