// Blob packing integration tests

use chrono::{DateTime, Duration, TimeZone, Utc};
use series_federation::codec::packing::FRAME_HEADER_BYTES;
use series_federation::codec::{EntryPacker, ProtoEntrySerializer};
use series_federation::{Entry, FederationError, SortOrder};
use std::sync::Arc;

fn packer(max_blob_bytes: usize) -> EntryPacker {
    EntryPacker::new(Arc::new(ProtoEntrySerializer), max_blob_bytes)
}

fn newest_first(start: DateTime<Utc>, n: i64, step: Duration) -> Vec<Entry> {
    (0..n)
        .rev()
        .map(|i| Entry::new(start + step * i as i32).with_field("value", i))
        .collect()
}

#[test]
fn test_pack_unpack_preserves_entries() {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let entries = newest_first(start, 500, Duration::seconds(1));
    let packer = packer(1024);

    let blobs = packer.pack(&entries).unwrap();
    assert!(blobs.len() > 1);

    let mut restored = Vec::new();
    for blob in &blobs {
        assert!(blob.data.len() <= 1024);
        assert!(blob.from <= blob.to);
        restored.extend(packer.unpack(&blob.data, SortOrder::Descending).unwrap());
    }
    assert_eq!(restored, entries);
}

#[test]
fn test_blobs_never_span_years() {
    let start = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 0).unwrap();
    let entries = newest_first(start, 120, Duration::seconds(1));

    let blobs = packer(1024 * 1024).pack(&entries).unwrap();

    assert_eq!(blobs.len(), 2);
    assert_eq!(blobs[0].from.format("%Y").to_string(), "2024");
    assert_eq!(blobs[1].to.format("%Y").to_string(), "2023");
    assert_eq!(blobs[0].count + blobs[1].count, 120);
}

#[test]
fn test_oversized_entry_is_rejected() {
    let mut entry = Entry::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    for i in 0..64 {
        entry = entry.with_field(format!("field_{i:03}"), i as f64);
    }

    let err = packer(128).pack(&[entry]).unwrap_err();
    match err {
        FederationError::EntryTooLarge { size, max } => {
            assert!(size > max);
            assert_eq!(max, 128);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_frames_are_length_prefixed_oldest_first() {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let entries = newest_first(start, 2, Duration::seconds(1));
    let blobs = packer(4096).pack(&entries).unwrap();

    let data = &blobs[0].data;
    let first_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    assert!(FRAME_HEADER_BYTES + first_len < data.len());

    let ascending = packer(4096).unpack(data, SortOrder::Ascending).unwrap();
    assert_eq!(ascending[0].timestamp, start);
}
