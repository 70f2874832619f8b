// Segmented read/delete integration tests for every dynamic storage

use chrono::{DateTime, Duration, TimeZone, Utc};
use series_federation::config::FilesystemConfig;
use series_federation::{
    CompressionType, ContinuationToken, DynamicStorage, Entry, FilesystemStorage, MemoryStorage,
    Segment, SegmentQuery, Serie, SortOrder, Storage,
};
use tempfile::TempDir;

const TOTAL: i64 = 45_000;
const PAGE: usize = 10_000;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
}

fn serie(id: &str, n: i64) -> Serie {
    let entries = (0..n)
        .map(|i| Entry::new(start() + Duration::seconds(i)).with_field("value", i))
        .collect();
    Serie::with_entries(id.to_string(), entries, SortOrder::Ascending)
}

async fn read_all_pages(storage: &dyn DynamicStorage, id: &str, query: &SegmentQuery) -> Vec<Segment> {
    let mut pages = Vec::new();
    let mut token: Option<ContinuationToken> = None;
    loop {
        let page = storage.read_segmented(id, query, token.as_ref()).await.unwrap();
        let more = page.has_more();
        token = Some(page.token.clone());
        pages.push(page);
        if !more {
            break;
        }
    }
    pages
}

async fn exhaust_then_delete(storage: &dyn Storage) {
    storage.write(&[serie("sensor", TOTAL)]).await.unwrap();
    let dynamic = storage.as_dynamic().expect("segmented capability");
    let query = SegmentQuery::new(None, None, PAGE);

    let pages = read_all_pages(dynamic, "sensor", &query).await;
    let sizes: Vec<usize> = pages.iter().map(Segment::len).collect();
    assert_eq!(sizes, vec![PAGE, PAGE, PAGE, PAGE, 5_000]);

    // Newest first, no overlap between pages
    assert_eq!(pages[0].entries[0].timestamp, start() + Duration::seconds(TOTAL - 1));
    for pair in pages.windows(2) {
        let last = pair[0].entries.last().unwrap().timestamp;
        let next = pair[1].entries.first().unwrap().timestamp;
        assert!(next < last);
    }

    let mut removed = 0;
    for page in &pages {
        removed += page.delete().await.unwrap();
    }
    assert_eq!(removed, TOTAL as usize);

    let again = dynamic.read_segmented("sensor", &query, None).await.unwrap();
    assert!(again.is_empty());
    assert!(!again.has_more());
}

#[tokio::test]
async fn test_memory_segmented_exhaustion() {
    let storage = MemoryStorage::new();
    exhaust_then_delete(&storage).await;
    assert!(storage.is_empty());
}

#[tokio::test]
async fn test_filesystem_segmented_exhaustion() {
    let temp_dir = TempDir::new().unwrap();
    let storage = FilesystemStorage::new(FilesystemConfig {
        base_path: temp_dir.path().to_string_lossy().to_string(),
        max_blob_bytes: 64 * 1024,
        compression: CompressionType::Lz4,
        ..Default::default()
    })
    .unwrap();

    exhaust_then_delete(&storage).await;
}

#[tokio::test]
async fn test_segment_delete_is_idempotent() {
    let storage = MemoryStorage::new();
    storage.write(&[serie("sensor", 30)]).await.unwrap();
    let query = SegmentQuery::new(None, None, 10);

    let page = storage.read_segmented("sensor", &query, None).await.unwrap();
    assert_eq!(page.delete().await.unwrap(), 10);
    assert_eq!(page.delete().await.unwrap(), 0);
    assert_eq!(storage.len(), 20);
}

#[tokio::test]
async fn test_segment_delete_leaves_newer_writes() {
    let storage = MemoryStorage::new();
    storage.write(&[serie("sensor", 10)]).await.unwrap();
    let query = SegmentQuery::new(None, None, 100);
    let page = storage.read_segmented("sensor", &query, None).await.unwrap();

    // Arrives between read and delete
    let late = Entry::new(start() + Duration::seconds(3600));
    storage
        .write(&[Serie::with_entries("sensor".to_string(), vec![late.clone()], SortOrder::Descending)])
        .await
        .unwrap();

    assert_eq!(page.delete().await.unwrap(), 10);
    let left = storage.read(&["sensor".to_string()], SortOrder::Descending).await.unwrap();
    assert_eq!(left[0].entries, vec![late]);
}

#[tokio::test]
async fn test_ascending_pages_follow_boundary() {
    let storage = MemoryStorage::new();
    storage.write(&[serie("sensor", 25)]).await.unwrap();
    let query = SegmentQuery::new(None, None, 10).with_sort(SortOrder::Ascending);

    let pages = read_all_pages(&storage, "sensor", &query).await;
    let sizes: Vec<usize> = pages.iter().map(Segment::len).collect();
    assert_eq!(sizes, vec![10, 10, 5]);
    assert_eq!(pages[1].entries[0].timestamp, start() + Duration::seconds(10));
}

#[tokio::test]
async fn test_foreign_token_is_rejected() {
    let storage = MemoryStorage::new();
    storage.write(&[serie("sensor", 5)]).await.unwrap();
    let query = SegmentQuery::new(None, None, 2);
    let token = ContinuationToken::Skip { skip: 2, has_more: true };

    let result = storage.read_segmented("sensor", &query, Some(&token)).await;
    assert!(result.is_err());
}
