// Key codec integration tests

use chrono::{DateTime, Duration, TimeZone, Utc};
use series_federation::keys::{
    max_partition_key, min_partition_key, partition_key, row_key, to_ticks, MAX_TICKS,
};

fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

#[test]
fn test_partition_keys_sort_newest_year_first() {
    let mut keys = vec![
        partition_key("sensor", &at(2015, 6, 1)),
        partition_key("sensor", &at(2023, 1, 1)),
        partition_key("sensor", &at(1999, 12, 31)),
    ];
    keys.sort();

    assert_eq!(
        keys,
        vec!["sensor|7976", "sensor|7984", "sensor|8000"]
    );
}

#[test]
fn test_partition_bounds_enclose_every_year() {
    for year in [1, 1970, 2024, 9999] {
        let key = partition_key("sensor", &at(year, 1, 1));
        assert!(max_partition_key("sensor") <= key);
        assert!(key <= min_partition_key("sensor"));
    }
}

#[test]
fn test_row_keys_sort_newest_first() {
    let base = at(2024, 3, 1);
    let older = row_key(&base);
    let newer = row_key(&(base + Duration::microseconds(1)));

    assert_eq!(older.len(), 19);
    assert!(newer < older);
}

#[test]
fn test_row_key_extremes() {
    let min = Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap();
    assert_eq!(to_ticks(&min), 0);
    assert_eq!(row_key(&min), format!("{:019}", MAX_TICKS));
    assert_eq!(row_key(&DateTime::<Utc>::MAX_UTC), format!("{:019}", 0));
}

#[test]
fn test_ticks_have_100ns_resolution() {
    let base = at(2024, 3, 1);
    assert_eq!(to_ticks(&(base + Duration::nanoseconds(100))) - to_ticks(&base), 1);
    assert_eq!(to_ticks(&(base + Duration::nanoseconds(99))), to_ticks(&base));
}
