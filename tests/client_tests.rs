// Client façade integration tests: routing, fan-out, fallbacks and publishing

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use series_federation::storage::MemoryTemporaryStorage;
use series_federation::{
    AggregateFunction, Aggregation, Client, ClientBuilder, Entry, FederationError, FieldKind,
    FieldValue, MemoryStorage, PublicationType, Result, Serie, SortOrder, StaticStorageSelector,
    Storage, StringKeyConverter, SubscriptionType,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

fn year(y: i32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, 6, 1, 0, 0, 0).unwrap()
}

fn boundary() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
}

fn serie(id: &str, stamps: &[DateTime<Utc>], value: f64) -> Serie {
    let entries = stamps
        .iter()
        .map(|ts| Entry::new(*ts).with_field("value", value))
        .collect();
    Serie::with_entries(id.to_string(), entries, SortOrder::Ascending)
}

/// Memory storage whose writes fail while `failing` is set
#[derive(Default)]
struct FlakyStorage {
    inner: MemoryStorage,
    failing: AtomicBool,
}

impl FlakyStorage {
    fn failing() -> Self {
        let storage = Self::default();
        storage.failing.store(true, Ordering::SeqCst);
        storage
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn write(&self, series: &[Serie]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(FederationError::Backend(anyhow!("storage unavailable")));
        }
        self.inner.write(series).await
    }

    async fn delete_range(
        &self,
        ids: &[String],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        self.inner.delete_range(ids, from, to).await
    }

    async fn read_latest(&self, ids: &[String], count: usize) -> Result<Vec<Serie>> {
        self.inner.read_latest(ids, count).await
    }

    async fn read_range(
        &self,
        ids: &[String],
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        sort: SortOrder,
    ) -> Result<Vec<Serie>> {
        self.inner.read_range(ids, from, to, sort).await
    }

    fn backend_type(&self) -> &str {
        "flaky"
    }
}

/// Old window on `old`, new window on `new`, split at 2020
fn split_selector(old: Arc<dyn Storage>, new: Arc<dyn Storage>) -> StaticStorageSelector {
    StaticStorageSelector::new()
        .with_window("old", old, None, Some(boundary()))
        .with_window("new", new, Some(boundary()), None)
}

fn client(selector: StaticStorageSelector) -> ClientBuilder<String> {
    ClientBuilder::new(Arc::new(selector), Arc::new(StringKeyConverter))
}

fn recorder() -> (Arc<Mutex<Vec<Serie>>>, impl Fn(Serie) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |serie: Serie| sink.lock().unwrap().push(serie))
}

#[tokio::test]
async fn test_write_routes_each_entry_to_its_window() {
    let old = Arc::new(MemoryStorage::new());
    let new = Arc::new(MemoryStorage::new());
    let client = client(split_selector(old.clone(), new.clone())).build();

    client
        .write(vec![serie("sensor", &[year(2018), year(2019), year(2021)], 1.0)])
        .await
        .unwrap();

    assert_eq!(old.len(), 2);
    assert_eq!(new.len(), 1);

    let read = client.read(&["sensor".to_string()], SortOrder::Ascending).await.unwrap();
    let stamps: Vec<_> = read[0].entries.iter().map(|e| e.timestamp).collect();
    assert_eq!(stamps, vec![year(2018), year(2019), year(2021)]);
}

#[tokio::test]
async fn test_write_outside_every_window_fails() {
    let selector = StaticStorageSelector::new().with_window(
        "new",
        Arc::new(MemoryStorage::new()),
        Some(boundary()),
        None,
    );
    let client = client(selector).build();

    let err = client
        .write(vec![serie("sensor", &[year(2010)], 1.0)])
        .await
        .unwrap_err();
    assert!(matches!(err, FederationError::NoStorageForKey { .. }));
}

#[tokio::test]
async fn test_partial_failure_publishes_only_written_series() {
    let flaky = Arc::new(FlakyStorage::failing());
    let healthy = Arc::new(MemoryStorage::new());
    let client = client(split_selector(flaky.clone(), healthy.clone())).build();

    let (seen, callback) = recorder();
    let _subscription = client
        .subscribe_local(&["sensor".to_string()], SubscriptionType::All, callback)
        .await
        .unwrap();

    let err = client
        .write_with_publication(
            vec![serie("sensor", &[year(2019), year(2021)], 1.0)],
            PublicationType::All,
        )
        .await
        .unwrap_err();

    match err {
        FederationError::PartialWriteFailure {
            failed,
            succeeded,
            errors,
        } => {
            assert_eq!(failed, 1);
            assert_eq!(succeeded, 1);
            assert!(errors[0].starts_with("old"));
        }
        other => panic!("unexpected error: {}", other),
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].entries[0].timestamp, year(2021));
    assert_eq!(healthy.len(), 1);
}

#[tokio::test]
async fn test_failed_writes_replayed_from_temporary_storage() {
    let flaky = Arc::new(FlakyStorage::failing());
    let healthy = Arc::new(MemoryStorage::new());
    let temporary = Arc::new(MemoryTemporaryStorage::new());
    let client = client(split_selector(flaky.clone(), healthy.clone()))
        .temporary(temporary.clone())
        .build();

    client
        .write(vec![serie("sensor", &[year(2018), year(2019), year(2021)], 1.0)])
        .await
        .unwrap();
    assert_eq!(temporary.len().await, 1);
    assert_eq!(healthy.len(), 1);

    // Still failing: the batch stays in temporary storage
    assert!(client.move_from_temporary_storage(100).await.is_err());
    assert_eq!(temporary.len().await, 1);

    flaky.failing.store(false, Ordering::SeqCst);
    let moved = client.move_from_temporary_storage(100).await.unwrap();
    assert_eq!(moved, 2);
    assert!(temporary.is_empty().await);
    assert_eq!(flaky.inner.len(), 2);
}

#[tokio::test]
async fn test_missing_collaborators() {
    let client: Client = client(StaticStorageSelector::new().with_window(
        "hot",
        Arc::new(MemoryStorage::new()),
        None,
        None,
    ))
    .build();
    let keys = vec!["sensor".to_string()];

    let migrate = client.migrate(&keys, None, None, 100).await;
    assert!(matches!(migrate, Err(FederationError::MissingCollaborator(_))));

    let replay = client.move_from_temporary_storage(100).await;
    assert!(matches!(replay, Err(FederationError::MissingCollaborator(_))));

    let subscribe = client.subscribe(&keys, SubscriptionType::Latest, |_| {}).await;
    assert!(matches!(subscribe, Err(FederationError::MissingCollaborator(_))));
}

#[tokio::test]
async fn test_reads_merge_tiers_with_dynamic_winning() {
    let hot = Arc::new(MemoryStorage::new());
    let cold = Arc::new(MemoryStorage::new());
    let client = client(StaticStorageSelector::new().with_window("hot", hot.clone(), None, None))
        .volume(Arc::new(
            StaticStorageSelector::new().with_window("cold", cold.clone(), None, None),
        ))
        .build();

    cold.write(&[serie("sensor", &[year(2010), year(2011)], 1.0)]).await.unwrap();
    hot.write(&[serie("sensor", &[year(2011), year(2012)], 2.0)]).await.unwrap();

    let read = client.read(&["sensor".to_string()], SortOrder::Descending).await.unwrap();
    let values: Vec<_> = read[0].entries.iter().map(|e| e.field("value")).collect();
    assert_eq!(
        values,
        vec![
            Some(FieldValue::Float(2.0)),
            Some(FieldValue::Float(2.0)),
            Some(FieldValue::Float(1.0)),
        ]
    );

    let latest = client.read_latest(&["sensor".to_string()], 2).await.unwrap();
    let stamps: Vec<_> = latest[0].entries.iter().map(|e| e.timestamp).collect();
    assert_eq!(stamps, vec![year(2012), year(2011)]);
}

#[tokio::test]
async fn test_read_latest_stays_inside_windows() {
    let old = Arc::new(MemoryStorage::new());
    let new = Arc::new(MemoryStorage::new());
    let client = client(split_selector(old.clone(), new.clone())).build();

    // Stray entry outside the window of the storage holding it
    old.write(&[serie("sensor", &[year(2022)], 9.0)]).await.unwrap();
    client
        .write(vec![serie("sensor", &[year(2018), year(2021)], 1.0)])
        .await
        .unwrap();

    let latest = client.read_latest(&["sensor".to_string()], 5).await.unwrap();
    let stamps: Vec<_> = latest[0].entries.iter().map(|e| e.timestamp).collect();
    assert_eq!(stamps, vec![year(2021), year(2018)]);
}

#[tokio::test]
async fn test_grouped_read_native_and_fallback_agree() {
    let keys = vec!["a".to_string(), "b".to_string()];
    let aggregation = Aggregation::new(AggregateFunction::Sum, [("value", FieldKind::Float)]);
    let data = vec![
        serie("a", &[year(2021), year(2022)], 1.0),
        serie("b", &[year(2022), year(2023)], 2.0),
    ];

    // Memory storage groups natively
    let native = client(StaticStorageSelector::new().with_window(
        "hot",
        Arc::new(MemoryStorage::new()),
        None,
        None,
    ))
    .build();
    native.write(data.clone()).await.unwrap();

    // Flaky storage has no grouped capability
    let fallback = client(StaticStorageSelector::new().with_window(
        "plain",
        Arc::new(FlakyStorage::default()),
        None,
        None,
    ))
    .build();
    fallback.write(data).await.unwrap();

    let group = "group".to_string();
    let a = native
        .read_grouped(group.clone(), &keys, None, None, SortOrder::Ascending, &aggregation)
        .await
        .unwrap();
    let b = fallback
        .read_grouped(group.clone(), &keys, None, None, SortOrder::Ascending, &aggregation)
        .await
        .unwrap();

    assert_eq!(a.key, "group");
    assert_eq!(a.entries, b.entries);
    assert_eq!(a.entries.len(), 3);
    assert_eq!(a.entries[1].field("value"), Some(FieldValue::Float(3.0)));
    assert_eq!(a.entries[1].count(), 2);
}

#[tokio::test]
async fn test_delete_range_covers_both_tiers() {
    let hot = Arc::new(MemoryStorage::new());
    let cold = Arc::new(MemoryStorage::new());
    let client = client(StaticStorageSelector::new().with_window("hot", hot.clone(), None, None))
        .volume(Arc::new(
            StaticStorageSelector::new().with_window("cold", cold.clone(), None, None),
        ))
        .build();

    hot.write(&[serie("sensor", &[year(2021), year(2023)], 1.0)]).await.unwrap();
    cold.write(&[serie("sensor", &[year(2019), year(2021)], 1.0)]).await.unwrap();

    let removed = client
        .delete_range(&["sensor".to_string()], Some(year(2020)), Some(year(2022)))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(hot.len(), 1);
    assert_eq!(cold.len(), 1);

    let removed = client.delete_all(&["sensor".to_string()]).await.unwrap();
    assert_eq!(removed, 2);
    assert!(hot.is_empty() && cold.is_empty());
}

#[tokio::test]
async fn test_latest_publication_delivers_newest_entry() {
    let client = client(StaticStorageSelector::new().with_window(
        "hot",
        Arc::new(MemoryStorage::new()),
        None,
        None,
    ))
    .build();

    let (seen, callback) = recorder();
    let subscription = client
        .subscribe_local_all(SubscriptionType::Latest, callback)
        .await
        .unwrap();

    client
        .write(vec![serie("sensor", &[year(2021), year(2023), year(2022)], 1.0)])
        .await
        .unwrap();
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].entries.len(), 1);
        assert_eq!(seen[0].entries[0].timestamp, year(2023));
    }

    drop(subscription);
    assert_eq!(client.local().subscriber_count(), 0);
    client.write(vec![serie("sensor", &[year(2024)], 1.0)]).await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_health_check_reports_every_storage() {
    let client = client(split_selector(
        Arc::new(MemoryStorage::new()),
        Arc::new(MemoryStorage::new()),
    ))
    .build();

    let health = client.health_check().await;
    assert_eq!(health.len(), 2);
    assert!(health.values().all(|ok| *ok));
}
