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

// Write batching in front of the client

use anyhow::anyhow;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::error::{FederationError, Result};
use crate::model::Serie;
use crate::pubsub::PublicationType;

struct PendingWrite {
    series: Vec<Serie>,
    entries: usize,
    publication: PublicationType,
    done: oneshot::Sender<std::result::Result<(), String>>,
}

/// Resolves once the batch holding the write was flushed
pub struct WriteHandle {
    done: oneshot::Receiver<std::result::Result<(), String>>,
}

impl WriteHandle {
    pub async fn wait(self) -> Result<()> {
        match self.done.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(FederationError::Backend(anyhow!(message))),
            Err(_) => Err(FederationError::Backend(anyhow!("write batcher stopped"))),
        }
    }
}

#[derive(Debug, Default)]
pub struct BatcherStats {
    pub flushes: AtomicU64,
    pub entries_written: AtomicU64,
    pub failed_flushes: AtomicU64,
}

struct Shared {
    queue: Mutex<VecDeque<PendingWrite>>,
    notify: Notify,
    batch_size: usize,
    stats: BatcherStats,
}

/// Collects writes from many producers and flushes them in batches
///
/// One background loop drains at most `batch_size` entries per flush, every
/// `flush_interval` or as soon as a full batch is queued. A write is never
/// split across flushes.
pub struct WriteBatcher<K = String> {
    client: Arc<Client<K>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<K> WriteBatcher<K>
where
    K: Clone + Send + Sync + 'static,
{
    pub fn new(client: Arc<Client<K>>, batch_size: usize, flush_interval: Duration) -> Self {
        let flush_interval = flush_interval.max(Duration::from_millis(1));
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            batch_size: batch_size.max(1),
            stats: BatcherStats::default(),
        });
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(flush_loop(
            client.clone(),
            shared.clone(),
            cancel.clone(),
            flush_interval,
        ));

        Self {
            client,
            shared,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Batcher using the client's own batch settings
    pub fn from_client(client: Arc<Client<K>>) -> Self {
        let batch_size = client.settings().batch_size;
        let flush_interval = client.settings().flush_interval();
        Self::new(client, batch_size, flush_interval)
    }

    pub fn stats(&self) -> &BatcherStats {
        &self.shared.stats
    }

    pub async fn pending(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    pub async fn enqueue(&self, series: Vec<Serie<K>>) -> Result<WriteHandle> {
        let publication = if self.client.settings().publish_after_write {
            PublicationType::Latest
        } else {
            PublicationType::None
        };
        self.enqueue_with_publication(series, publication).await
    }

    pub async fn enqueue_with_publication(
        &self,
        series: Vec<Serie<K>>,
        publication: PublicationType,
    ) -> Result<WriteHandle> {
        if self.cancel.is_cancelled() {
            return Err(FederationError::Backend(anyhow!("write batcher stopped")));
        }

        let series = self.client.resolve_series(series);
        // An unroutable entry would fail the whole shared flush
        self.client.check_routing(&series)?;
        let entries = series.iter().map(Serie::len).sum();
        let (tx, rx) = oneshot::channel();

        let queued_entries: usize = {
            let mut queue = self.shared.queue.lock().await;
            queue.push_back(PendingWrite {
                series,
                entries,
                publication,
                done: tx,
            });
            queue.iter().map(|p| p.entries).sum()
        };

        if queued_entries >= self.shared.batch_size {
            self.shared.notify.notify_one();
        }
        Ok(WriteHandle { done: rx })
    }

    /// Enqueue and wait for the flush
    pub async fn write(&self, series: Vec<Serie<K>>) -> Result<()> {
        self.enqueue(series).await?.wait().await
    }

    /// Stop the loop after flushing everything already queued
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                warn!("Write batcher loop ended abnormally: {}", e);
            }
        }
        info!(
            "Write batcher stopped after {} flushes",
            self.shared.stats.flushes.load(Ordering::Relaxed)
        );
    }
}

impl<K> Drop for WriteBatcher<K> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn flush_loop<K>(
    client: Arc<Client<K>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    flush_interval: Duration,
) where
    K: Clone + Send + Sync + 'static,
{
    let mut interval = tokio::time::interval(flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
            _ = shared.notify.notified() => {}
        }
        while flush_once(&client, &shared).await {}
    }

    // Writes accepted before cancellation still complete
    while flush_once(&client, &shared).await {}
    debug!("Write batcher loop exited");
}

/// Flush one batch; false when the queue was empty
async fn flush_once<K>(client: &Client<K>, shared: &Shared) -> bool
where
    K: Clone + Send + Sync + 'static,
{
    let batch: Vec<PendingWrite> = {
        let mut queue = shared.queue.lock().await;
        let mut batch = Vec::new();
        let mut entries = 0;
        while let Some(next) = queue.front() {
            if !batch.is_empty() && entries + next.entries > shared.batch_size {
                break;
            }
            entries += next.entries;
            if let Some(pending) = queue.pop_front() {
                batch.push(pending);
            }
        }
        batch
    };

    if batch.is_empty() {
        return false;
    }

    // Publication of the batch is the widest any producer asked for
    let publication = batch
        .iter()
        .map(|p| p.publication)
        .fold(PublicationType::None, widest);
    let entries: usize = batch.iter().map(|p| p.entries).sum();
    let series: Vec<Serie> = batch.iter().flat_map(|p| p.series.iter().cloned()).collect();

    let outcomes: Vec<std::result::Result<(), String>> =
        match client.write_resolved(series, publication, true).await {
            // Routing changed since enqueue; keep the other producers' writes
            Err(FederationError::NoStorageForKey { id, timestamp }) if batch.len() > 1 => {
                warn!(
                    "No storage for '{}' at {}, flushing {} writes one by one",
                    id,
                    timestamp,
                    batch.len()
                );
                let mut outcomes = Vec::with_capacity(batch.len());
                for pending in &batch {
                    let result = client
                        .write_resolved(pending.series.clone(), pending.publication, true)
                        .await;
                    outcomes.push(result.map_err(|e| e.to_string()));
                }
                outcomes
            }
            result => vec![result.map_err(|e| e.to_string()); batch.len()],
        };

    shared.stats.flushes.fetch_add(1, Ordering::Relaxed);
    let written: usize = batch
        .iter()
        .zip(&outcomes)
        .filter(|(_, outcome)| outcome.is_ok())
        .map(|(pending, _)| pending.entries)
        .sum();
    shared
        .stats
        .entries_written
        .fetch_add(written as u64, Ordering::Relaxed);

    match outcomes.iter().find_map(|outcome| outcome.as_ref().err()) {
        None => debug!("Flushed {} writes ({} entries)", batch.len(), entries),
        Some(e) => {
            shared.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Flush of {} writes failed, {} of {} entries written: {}",
                batch.len(),
                written,
                entries,
                e
            );
        }
    }

    for (pending, outcome) in batch.into_iter().zip(outcomes) {
        // Producer may have stopped waiting
        let _ = pending.done.send(outcome);
    }
    true
}

fn widest(a: PublicationType, b: PublicationType) -> PublicationType {
    use PublicationType::*;
    match (a, b) {
        (None, other) | (other, None) => other,
        (Latest, Latest) => Latest,
        (All, All) => All,
        _ => LatestAndAll,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widest_publication() {
        use PublicationType::*;
        assert_eq!(widest(None, None), None);
        assert_eq!(widest(None, Latest), Latest);
        assert_eq!(widest(All, None), All);
        assert_eq!(widest(Latest, All), LatestAndAll);
        assert_eq!(widest(LatestAndAll, Latest), LatestAndAll);
    }
}
