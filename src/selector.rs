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

//! Routing of keys and time ranges to storage instances.
//!
//! Every storage is declared authoritative for a half-open validity window
//! `[from, to)`; `None` bounds are open. Reads fan out over every window
//! intersecting the requested range, newest window first.

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::TopologyRule;
use crate::error::{FederationError, Result};
use crate::storage::Storage;

/// A storage together with the part of its validity window that applies
#[derive(Clone)]
pub struct StorageSelection {
    pub name: String,
    pub storage: Arc<dyn Storage>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl StorageSelection {
    pub fn new(
        name: impl Into<String>,
        storage: Arc<dyn Storage>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            name: name.into(),
            storage,
            from,
            to,
        }
    }

    pub fn contains(&self, timestamp: &DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| from <= *timestamp) && self.to.map_or(true, |to| *timestamp < to)
    }

    /// Same storage and same window
    pub fn same_as(&self, other: &StorageSelection) -> bool {
        self.name == other.name && self.from == other.from && self.to == other.to
    }

    /// Window narrowed to `[from, to)`, `None` when nothing is left
    pub fn clipped(&self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Option<Self> {
        let (from, to) = intersect(self.from, self.to, from, to)?;
        Some(Self {
            name: self.name.clone(),
            storage: self.storage.clone(),
            from,
            to,
        })
    }
}

impl fmt::Debug for StorageSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageSelection")
            .field("name", &self.name)
            .field("from", &self.from)
            .field("to", &self.to)
            .finish()
    }
}

/// Intersection of two half-open ranges, `None` when empty
pub fn intersect(
    a_from: Option<DateTime<Utc>>,
    a_to: Option<DateTime<Utc>>,
    b_from: Option<DateTime<Utc>>,
    b_to: Option<DateTime<Utc>>,
) -> Option<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
    let from = match (a_from, b_from) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    let to = match (a_to, b_to) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    match (from, to) {
        (Some(from), Some(to)) if from >= to => None,
        _ => Some((from, to)),
    }
}

/// Ordering of window starts with an open start oldest
pub fn compare_from(a: &Option<DateTime<Utc>>, b: &Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

pub trait StorageSelector: Send + Sync {
    /// Every declared window for `id`, unclipped, newest window first
    fn windows(&self, id: &str) -> Vec<StorageSelection>;

    /// Every declared window, whatever ids it applies to
    fn declared(&self) -> Vec<StorageSelection>;

    /// The one storage authoritative for `id` at `timestamp`
    fn select_for_write(&self, id: &str, timestamp: &DateTime<Utc>) -> Result<StorageSelection> {
        self.windows(id)
            .into_iter()
            .find(|selection| selection.contains(timestamp))
            .ok_or_else(|| FederationError::NoStorageForKey {
                id: id.to_string(),
                timestamp: *timestamp,
            })
    }

    /// Windows intersecting `[from, to)`, clipped to it, newest first
    fn select_for_read(
        &self,
        id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Vec<StorageSelection> {
        self.windows(id)
            .iter()
            .filter_map(|selection| selection.clipped(from, to))
            .collect()
    }
}

struct Window {
    selection: StorageSelection,
    pattern: Option<Regex>,
}

/// Selector over a fixed set of declared windows
pub struct StaticStorageSelector {
    windows: Vec<Window>,
}

impl StaticStorageSelector {
    pub fn new() -> Self {
        Self { windows: Vec::new() }
    }

    /// Build from topology rules, resolving storage names
    pub fn from_rules(
        rules: &[TopologyRule],
        storages: &HashMap<String, Arc<dyn Storage>>,
    ) -> anyhow::Result<Self> {
        let mut selector = Self::new();
        for rule in rules {
            let storage = storages
                .get(&rule.storage)
                .ok_or_else(|| anyhow!("Undeclared storage '{}'", rule.storage))?;
            let pattern = rule
                .pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .with_context(|| format!("Invalid pattern for storage '{}'", rule.storage))?;
            selector.push(
                StorageSelection::new(&rule.storage, storage.clone(), rule.from, rule.to),
                pattern,
            );
        }
        Ok(selector)
    }

    /// Declare a window for every id
    pub fn with_window(
        mut self,
        name: &str,
        storage: Arc<dyn Storage>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.push(StorageSelection::new(name, storage, from, to), None);
        self
    }

    fn push(&mut self, selection: StorageSelection, pattern: Option<Regex>) {
        self.windows.push(Window { selection, pattern });
        // Stable, so equal starts keep declaration order
        self.windows
            .sort_by(|a, b| compare_from(&b.selection.from, &a.selection.from));
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl Default for StaticStorageSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageSelector for StaticStorageSelector {
    fn windows(&self, id: &str) -> Vec<StorageSelection> {
        self.windows
            .iter()
            .filter(|w| w.pattern.as_ref().map_or(true, |p| p.is_match(id)))
            .map(|w| w.selection.clone())
            .collect()
    }

    fn declared(&self) -> Vec<StorageSelection> {
        self.windows.iter().map(|w| w.selection.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use chrono::TimeZone;

    fn year(y: i32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, 1, 1, 0, 0, 0).unwrap()
    }

    fn memory() -> Arc<dyn Storage> {
        Arc::new(MemoryStorage::new())
    }

    fn selector() -> StaticStorageSelector {
        StaticStorageSelector::new()
            .with_window("old", memory(), Some(year(2010)), Some(year(2015)))
            .with_window("new", memory(), Some(year(2015)), None)
    }

    #[test]
    fn test_read_selection_is_clipped_and_newest_first() {
        let selections = selector().select_for_read("sensor", Some(year(2012)), Some(year(2018)));

        assert_eq!(selections.len(), 2);
        assert_eq!(selections[0].name, "new");
        assert_eq!(selections[0].from, Some(year(2015)));
        assert_eq!(selections[0].to, Some(year(2018)));
        assert_eq!(selections[1].name, "old");
        assert_eq!(selections[1].from, Some(year(2012)));
        assert_eq!(selections[1].to, Some(year(2015)));
    }

    #[test]
    fn test_window_end_is_exclusive() {
        let selections = selector().select_for_read("sensor", Some(year(2000)), Some(year(2010)));
        assert!(selections.is_empty());

        let write = selector().select_for_write("sensor", &year(2015)).unwrap();
        assert_eq!(write.name, "new");
    }

    #[test]
    fn test_write_outside_every_window_fails() {
        let err = selector().select_for_write("sensor", &year(2001)).unwrap_err();
        assert!(matches!(err, FederationError::NoStorageForKey { .. }));
    }

    #[test]
    fn test_pattern_restricts_ids() {
        let mut storages: HashMap<String, Arc<dyn Storage>> = HashMap::new();
        storages.insert("hot".to_string(), memory());
        storages.insert("plc".to_string(), memory());
        let rules = vec![
            TopologyRule::unbounded("hot"),
            TopologyRule {
                storage: "plc".to_string(),
                pattern: Some("^plc/".to_string()),
                from: Some(year(2020)),
                to: None,
            },
        ];
        let selector = StaticStorageSelector::from_rules(&rules, &storages).unwrap();

        let plc = selector.select_for_write("plc/1", &year(2021)).unwrap();
        assert_eq!(plc.name, "plc");
        let other = selector.select_for_write("meter/1", &year(2021)).unwrap();
        assert_eq!(other.name, "hot");
    }

    #[test]
    fn test_intersect() {
        assert_eq!(intersect(None, None, None, None), Some((None, None)));
        assert_eq!(
            intersect(Some(year(2010)), None, None, Some(year(2012))),
            Some((Some(year(2010)), Some(year(2012))))
        );
        assert_eq!(intersect(Some(year(2012)), None, None, Some(year(2012))), None);
    }
}
