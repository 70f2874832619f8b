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

// Periodic hot-to-cold migration sweeps

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{Client, MigrationReport};
use crate::config::MigrationSettings;

struct Sweep<K> {
    key: K,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs one cancellable sweep task per key
///
/// Each sweep migrates entries older than `now - retain_hot`. Failures are
/// logged and the sweep runs again at the next tick.
pub struct MigrationScheduler<K = String> {
    client: Arc<Client<K>>,
    segment_size: usize,
    retain_hot: Duration,
    root: CancellationToken,
    sweeps: Mutex<HashMap<String, Sweep<K>>>,
}

impl<K> MigrationScheduler<K>
where
    K: Clone + Send + Sync + 'static,
{
    pub fn new(client: Arc<Client<K>>, segment_size: usize, retain_hot: Duration) -> Self {
        Self {
            client,
            segment_size,
            retain_hot,
            root: CancellationToken::new(),
            sweeps: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(client: Arc<Client<K>>, settings: &MigrationSettings) -> Self {
        Self::new(client, settings.segment_size, settings.retain_hot())
    }

    pub async fn scheduled(&self) -> usize {
        self.sweeps.lock().await.len()
    }

    /// Start sweeping `key` every `interval`, replacing an existing sweep
    pub async fn schedule(&self, key: K, interval: Duration) {
        let id = self.client.converter().to_id(&key);
        let mut sweeps = self.sweeps.lock().await;
        if let Some(previous) = sweeps.remove(&id) {
            previous.cancel.cancel();
        }

        let sweep = self.spawn(key, id.clone(), interval);
        sweeps.insert(id, sweep);
    }

    /// Stop sweeping `key`; false when it was not scheduled
    pub async fn unschedule(&self, key: &K) -> bool {
        let id = self.client.converter().to_id(key);
        let removed = self.sweeps.lock().await.remove(&id);
        match removed {
            Some(sweep) => {
                sweep.cancel.cancel();
                if let Err(e) = sweep.handle.await {
                    warn!("Sweep of '{}' ended abnormally: {}", id, e);
                }
                info!("Unscheduled migration of '{}'", id);
                true
            }
            None => false,
        }
    }

    /// Restart every sweep with a new interval
    pub async fn reschedule_all(&self, interval: Duration) {
        let mut sweeps = self.sweeps.lock().await;
        let previous: Vec<(String, Sweep<K>)> = sweeps.drain().collect();
        for (id, sweep) in previous {
            sweep.cancel.cancel();
            let replacement = self.spawn(sweep.key, id.clone(), interval);
            sweeps.insert(id, replacement);
        }
        info!("Rescheduled {} sweeps every {:?}", sweeps.len(), interval);
    }

    /// Cancel every sweep and wait for in-flight runs to finish
    pub async fn shutdown(&self) {
        self.root.cancel();
        let sweeps: Vec<(String, Sweep<K>)> = self.sweeps.lock().await.drain().collect();
        for (id, sweep) in sweeps {
            if let Err(e) = sweep.handle.await {
                warn!("Sweep of '{}' ended abnormally: {}", id, e);
            }
        }
        info!("Migration scheduler stopped");
    }

    fn spawn(&self, key: K, id: String, interval: Duration) -> Sweep<K> {
        let cancel = self.root.child_token();
        let client = self.client.clone();
        let token = cancel.clone();
        let task_key = key.clone();
        let segment_size = self.segment_size;
        let retain_hot = self.retain_hot;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        // A started run is never cut short
                        run_sweep(&client, &task_key, &id, segment_size, retain_hot).await;
                    }
                }
            }
            debug!("Sweep of '{}' cancelled", id);
        });

        Sweep { key, cancel, handle }
    }
}

/// One migration pass over everything older than the retention cut-off
pub async fn run_sweep<K>(
    client: &Client<K>,
    key: &K,
    id: &str,
    segment_size: usize,
    retain_hot: Duration,
) -> Option<MigrationReport>
where
    K: Clone + Send + Sync + 'static,
{
    let retain = match chrono::Duration::from_std(retain_hot) {
        Ok(retain) => retain,
        Err(e) => {
            error!("Invalid retention for '{}': {}", id, e);
            return None;
        }
    };
    let cutoff = Utc::now() - retain;

    match client
        .migrate(std::slice::from_ref(key), None, Some(cutoff), segment_size)
        .await
    {
        Ok(report) => {
            if !report.is_complete() {
                warn!(
                    "Sweep of '{}' moved {} entries, {} jobs failed",
                    id,
                    report.moved,
                    report.failures.len()
                );
            } else if report.moved > 0 {
                info!("Sweep of '{}' moved {} entries before {}", id, report.moved, cutoff);
            }
            Some(report)
        }
        Err(e) => {
            error!("Sweep of '{}' failed: {}", id, e);
            None
        }
    }
}
