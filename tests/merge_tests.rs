// Merge and aggregation integration tests

use chrono::{DateTime, TimeZone, Utc};
use series_federation::merge::{merge_aggregated, merge_first_wins};
use series_federation::{AggregateFunction, Aggregation, Entry, FieldKind, FieldValue, Serie, SortOrder};

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn serie(tag: i64, secs: &[i64], sort: SortOrder) -> Serie {
    let entries = secs
        .iter()
        .map(|s| Entry::new(ts(*s)).with_field("source", tag))
        .collect();
    Serie::with_entries("sensor".to_string(), entries, sort)
}

#[test]
fn test_first_wins_prefers_earlier_serie() {
    let merged = merge_first_wins(
        vec![
            serie(1, &[9, 5, 1], SortOrder::Descending),
            serie(2, &[8, 5, 2], SortOrder::Descending),
        ],
        SortOrder::Descending,
    );

    let times: Vec<i64> = merged.iter().map(|e| e.timestamp.timestamp()).collect();
    assert_eq!(times, vec![9, 8, 5, 2, 1]);
    let at_five = merged.iter().find(|e| e.timestamp == ts(5)).unwrap();
    assert_eq!(at_five.field("source"), Some(FieldValue::Integer(1)));
}

#[test]
fn test_first_wins_is_idempotent() {
    let input = vec![
        serie(1, &[1, 3, 5], SortOrder::Ascending),
        serie(2, &[2, 3, 4], SortOrder::Ascending),
    ];
    let once = merge_first_wins(input.clone(), SortOrder::Ascending);
    let again = merge_first_wins(
        vec![Serie::with_entries("sensor".to_string(), once.clone(), SortOrder::Ascending)],
        SortOrder::Ascending,
    );
    assert_eq!(once, again);

    // Merging the result with an input changes nothing either
    let with_input = merge_first_wins(
        vec![
            Serie::with_entries("sensor".to_string(), once.clone(), SortOrder::Ascending),
            input[1].clone(),
        ],
        SortOrder::Ascending,
    );
    assert_eq!(once, with_input);
}

#[test]
fn test_merge_of_empty_and_single_entry_series() {
    let merged = merge_first_wins(
        vec![
            Serie::new("sensor".to_string()),
            serie(3, &[7], SortOrder::Ascending),
        ],
        SortOrder::Descending,
    );
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].timestamp, ts(7));
}

#[test]
fn test_aggregated_merge_weights_by_count() {
    let bucket = |value: f64, count: u64| {
        let mut entry = Entry::new(ts(60)).with_field("value", value);
        entry.set_count(count);
        Serie::with_entries("sensor".to_string(), vec![entry], SortOrder::Descending)
    };
    let aggregation = Aggregation::new(AggregateFunction::Average, [("value", FieldKind::Float)]);

    let merged = merge_aggregated(
        vec![bucket(10.0, 2), bucket(20.0, 3), bucket(30.0, 5)],
        SortOrder::Descending,
        &aggregation,
    );

    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].field("value"), Some(FieldValue::Float(23.0)));
    assert_eq!(merged[0].count(), 10);
}

#[test]
fn test_aggregated_merge_keeps_lone_entries() {
    let left = Serie::with_entries(
        "a".to_string(),
        vec![
            Entry::new(ts(1)).with_field("value", 5i64),
            Entry::new(ts(2)).with_field("value", 7i64),
        ],
        SortOrder::Ascending,
    );
    let right = Serie::with_entries(
        "b".to_string(),
        vec![Entry::new(ts(2)).with_field("value", 3i64)],
        SortOrder::Ascending,
    );
    let aggregation = Aggregation::new(AggregateFunction::Sum, [("value", FieldKind::Integer)]);

    let merged = merge_aggregated(vec![left, right], SortOrder::Ascending, &aggregation);

    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].field("value"), Some(FieldValue::Integer(5)));
    assert_eq!(merged[1].field("value"), Some(FieldValue::Integer(10)));
    assert_eq!(merged[1].count(), 2);
}
