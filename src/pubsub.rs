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

// Publish/subscribe of written series

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::error::Result;
use crate::model::{Serie, SortOrder};

/// What a publisher announces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationType {
    None,
    /// Only the newest entry of each serie
    #[default]
    Latest,
    /// Every written entry
    All,
    LatestAndAll,
}

impl PublicationType {
    pub fn includes(self, kind: SubscriptionType) -> bool {
        matches!(
            (self, kind),
            (PublicationType::Latest, SubscriptionType::Latest)
                | (PublicationType::All, SubscriptionType::All)
                | (PublicationType::LatestAndAll, _)
        )
    }
}

/// What a subscriber receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    Latest,
    All,
}

pub type SubscriptionCallback = Arc<dyn Fn(&Serie) + Send + Sync>;

/// Handle to an active subscription
///
/// Dropping it unsubscribes.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

#[async_trait]
pub trait PublishSubscribe: Send + Sync {
    async fn publish(&self, series: &[Serie], publication: PublicationType) -> Result<()>;

    /// Subscribe to the given ids
    async fn subscribe(
        &self,
        ids: &[String],
        kind: SubscriptionType,
        callback: SubscriptionCallback,
    ) -> Result<Subscription>;

    /// Subscribe to every id
    async fn subscribe_all(
        &self,
        kind: SubscriptionType,
        callback: SubscriptionCallback,
    ) -> Result<Subscription>;
}

struct Subscriber {
    ids: Option<HashSet<String>>,
    kind: SubscriptionType,
    callback: SubscriptionCallback,
}

impl Subscriber {
    fn wants(&self, id: &str, kind: SubscriptionType) -> bool {
        self.kind == kind && self.ids.as_ref().map_or(true, |ids| ids.contains(id))
    }
}

/// In-process delivery; callbacks run on the publishing task
#[derive(Default)]
pub struct LocalPublishSubscribe {
    subscribers: Arc<DashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl LocalPublishSubscribe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn register(&self, subscriber: Subscriber) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, subscriber);

        let subscribers: Weak<DashMap<u64, Subscriber>> = Arc::downgrade(&self.subscribers);
        Subscription::new(move || {
            if let Some(subscribers) = subscribers.upgrade() {
                subscribers.remove(&id);
            }
        })
    }

    fn deliver(&self, serie: &Serie, kind: SubscriptionType) {
        // Collect first so a callback may unsubscribe without deadlocking
        let callbacks: Vec<SubscriptionCallback> = self
            .subscribers
            .iter()
            .filter(|s| s.value().wants(&serie.key, kind))
            .map(|s| s.value().callback.clone())
            .collect();

        for callback in callbacks {
            callback(serie);
        }
    }
}

/// Newest entry of a serie, whatever its direction
fn latest_of(serie: &Serie) -> Option<Serie> {
    let latest = serie.entries.iter().max_by_key(|e| e.timestamp)?;
    Some(Serie::with_entries(
        serie.key.clone(),
        vec![latest.clone()],
        SortOrder::Descending,
    ))
}

#[async_trait]
impl PublishSubscribe for LocalPublishSubscribe {
    async fn publish(&self, series: &[Serie], publication: PublicationType) -> Result<()> {
        if publication == PublicationType::None || self.subscribers.is_empty() {
            return Ok(());
        }

        for serie in series.iter().filter(|s| !s.is_empty()) {
            if publication.includes(SubscriptionType::Latest) {
                if let Some(latest) = latest_of(serie) {
                    self.deliver(&latest, SubscriptionType::Latest);
                }
            }
            if publication.includes(SubscriptionType::All) {
                self.deliver(serie, SubscriptionType::All);
            }
        }

        debug!("Published {} series locally ({:?})", series.len(), publication);
        Ok(())
    }

    async fn subscribe(
        &self,
        ids: &[String],
        kind: SubscriptionType,
        callback: SubscriptionCallback,
    ) -> Result<Subscription> {
        Ok(self.register(Subscriber {
            ids: Some(ids.iter().cloned().collect()),
            kind,
            callback,
        }))
    }

    async fn subscribe_all(
        &self,
        kind: SubscriptionType,
        callback: SubscriptionCallback,
    ) -> Result<Subscription> {
        Ok(self.register(Subscriber {
            ids: None,
            kind,
            callback,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Entry;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn serie(id: &str, seconds: &[i64]) -> Serie {
        let entries = seconds.iter().map(|s| Entry::new(ts(*s))).collect();
        Serie::with_entries(id.to_string(), entries, SortOrder::Ascending)
    }

    fn recorder() -> (Arc<Mutex<Vec<Serie>>>, SubscriptionCallback) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let callback: SubscriptionCallback = Arc::new(move |serie: &Serie| {
            sink.lock().unwrap().push(serie.clone());
        });
        (received, callback)
    }

    #[tokio::test]
    async fn test_latest_receives_newest_entry_only() {
        let pubsub = LocalPublishSubscribe::new();
        let (received, callback) = recorder();
        let _subscription = pubsub
            .subscribe(&["a".to_string()], SubscriptionType::Latest, callback)
            .await
            .unwrap();

        pubsub
            .publish(&[serie("a", &[1, 3, 2]), serie("b", &[5])], PublicationType::LatestAndAll)
            .await
            .unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].entries.len(), 1);
        assert_eq!(received[0].entries[0].timestamp, ts(3));
    }

    #[tokio::test]
    async fn test_all_subscription_skips_latest_publication() {
        let pubsub = LocalPublishSubscribe::new();
        let (received, callback) = recorder();
        let _subscription = pubsub.subscribe_all(SubscriptionType::All, callback).await.unwrap();

        pubsub.publish(&[serie("a", &[1])], PublicationType::Latest).await.unwrap();
        assert!(received.lock().unwrap().is_empty());

        pubsub.publish(&[serie("a", &[1, 2])], PublicationType::All).await.unwrap();
        assert_eq!(received.lock().unwrap()[0].entries.len(), 2);
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let pubsub = LocalPublishSubscribe::new();
        let (received, callback) = recorder();
        let subscription = pubsub.subscribe_all(SubscriptionType::All, callback).await.unwrap();
        assert_eq!(pubsub.subscriber_count(), 1);

        drop(subscription);
        assert_eq!(pubsub.subscriber_count(), 0);

        pubsub.publish(&[serie("a", &[1])], PublicationType::All).await.unwrap();
        assert!(received.lock().unwrap().is_empty());
    }
}
