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

// Entry and serie data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Name of the field holding the number of raw measurements an entry represents
pub const COUNT_FIELD: &str = "count";

/// Scalar value of a named field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
}

impl FieldValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            FieldValue::Integer(v) => *v as f64,
            FieldValue::Float(v) => *v,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

/// Direction entries are ordered in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

impl SortOrder {
    /// Compare two timestamps in this direction
    pub fn compare(self, a: &DateTime<Utc>, b: &DateTime<Utc>) -> Ordering {
        match self {
            SortOrder::Ascending => a.cmp(b),
            SortOrder::Descending => b.cmp(a),
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            SortOrder::Ascending => SortOrder::Descending,
            SortOrder::Descending => SortOrder::Ascending,
        }
    }
}

/// One measurement. Ordering is defined by `timestamp` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Entry {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field assignment
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<FieldValue> {
        self.fields.get(name).copied()
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Number of raw measurements folded into this entry (1 unless pre-aggregated)
    pub fn count(&self) -> u64 {
        match self.fields.get(COUNT_FIELD) {
            Some(FieldValue::Integer(v)) if *v > 0 => *v as u64,
            Some(FieldValue::Float(v)) if *v > 0.0 => *v as u64,
            _ => 1,
        }
    }

    pub fn set_count(&mut self, count: u64) {
        self.fields
            .insert(COUNT_FIELD.to_string(), FieldValue::Integer(count as i64));
    }
}

/// Ordered list of entries belonging to one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Serie<K = String> {
    pub key: K,
    pub entries: Vec<Entry>,
    pub sort: SortOrder,
}

impl<K> Serie<K> {
    pub fn new(key: K) -> Self {
        Self {
            key,
            entries: Vec::new(),
            sort: SortOrder::Descending,
        }
    }

    pub fn with_entries(key: K, entries: Vec<Entry>, sort: SortOrder) -> Self {
        Self { key, entries, sort }
    }

    pub fn push(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-sort entries and update the annotated direction
    pub fn sort_by(&mut self, sort: SortOrder) {
        self.entries
            .sort_by(|a, b| sort.compare(&a.timestamp, &b.timestamp));
        self.sort = sort;
    }

    /// Whether the entries actually follow the annotated direction
    pub fn is_sorted(&self) -> bool {
        self.entries
            .windows(2)
            .all(|w| self.sort.compare(&w[0].timestamp, &w[1].timestamp) != Ordering::Greater)
    }

    /// Oldest and newest timestamps, regardless of direction
    pub fn time_bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = self.entries.first()?.timestamp;
        let last = self.entries.last()?.timestamp;
        Some((first.min(last), first.max(last)))
    }

    pub fn map_key<T>(self, f: impl FnOnce(K) -> T) -> Serie<T> {
        Serie {
            key: f(self.key),
            entries: self.entries,
            sort: self.sort,
        }
    }
}
