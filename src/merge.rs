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

//! K-way merge of sorted streams
//!
//! Inputs must already be sorted in the requested direction. Items whose
//! keys compare equal across (or within) streams form a conflict group; the
//! group is handed to the resolver in stream-priority order (lower stream
//! index first) and replaced by the single item it returns.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::aggregate::Aggregation;
use crate::model::{Entry, Serie, SortOrder};

struct Head<K> {
    key: K,
    stream: usize,
    order: SortOrder,
}

impl<K: Ord> PartialEq for Head<K> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord> Eq for Head<K> {}

impl<K: Ord> PartialOrd for Head<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord> Ord for Head<K> {
    // BinaryHeap pops the greatest head: the next key in merge order,
    // and on ties the lowest stream index.
    fn cmp(&self, other: &Self) -> Ordering {
        let by_key = match self.order {
            SortOrder::Ascending => other.key.cmp(&self.key),
            SortOrder::Descending => self.key.cmp(&other.key),
        };
        by_key.then_with(|| other.stream.cmp(&self.stream))
    }
}

fn in_order<K: Ord>(order: SortOrder, previous: &K, next: &K) -> bool {
    match order {
        SortOrder::Ascending => previous <= next,
        SortOrder::Descending => previous >= next,
    }
}

/// Merge sorted streams, resolving equal-key groups with `resolve`
///
/// # Panics
///
/// Panics when a stream is not sorted in `order`; that is a caller bug and
/// silently emitting a misordered result would be worse.
pub fn merge_sorted<T, K, F, R>(streams: Vec<Vec<T>>, order: SortOrder, key: F, mut resolve: R) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> K,
    R: FnMut(Vec<T>) -> T,
{
    let capacity = streams.iter().map(Vec::len).sum();
    let mut output = Vec::with_capacity(capacity);
    let mut iters: Vec<_> = streams.into_iter().map(|s| s.into_iter().peekable()).collect();
    let mut heap = BinaryHeap::with_capacity(iters.len());

    for (stream, iter) in iters.iter_mut().enumerate() {
        if let Some(first) = iter.peek() {
            heap.push(Head {
                key: key(first),
                stream,
                order,
            });
        }
    }

    // Take the head item of a stream and queue its successor
    let mut advance = |heap: &mut BinaryHeap<Head<K>>, head: &Head<K>| -> Option<T> {
        let iter = &mut iters[head.stream];
        let item = iter.next()?;
        if let Some(next) = iter.peek() {
            let next_key = key(next);
            assert!(
                in_order(order, &head.key, &next_key),
                "merge input stream {} is not sorted {:?}",
                head.stream,
                order
            );
            heap.push(Head {
                key: next_key,
                stream: head.stream,
                order,
            });
        }
        Some(item)
    };

    while let Some(head) = heap.pop() {
        let Some(first) = advance(&mut heap, &head) else {
            continue;
        };

        let mut group: Option<Vec<T>> = None;
        while heap.peek().is_some_and(|next| next.key == head.key) {
            if let Some(next) = heap.pop() {
                if let Some(item) = advance(&mut heap, &next) {
                    group.get_or_insert_with(Vec::new).push(item);
                }
            }
        }

        match group {
            None => output.push(first),
            Some(mut rest) => {
                rest.insert(0, first);
                output.push(resolve(rest));
            }
        }
    }

    output
}

/// Conflict resolver keeping the entry of the highest-priority stream
pub fn first_wins(group: Vec<Entry>) -> Entry {
    group
        .into_iter()
        .next()
        .unwrap_or_else(|| unreachable!("conflict groups are never empty"))
}

fn assert_direction<K>(series: &[Serie<K>], order: SortOrder) {
    for serie in series {
        assert!(
            serie.len() < 2 || serie.sort == order,
            "cannot merge a {:?} serie into a {:?} merge",
            serie.sort,
            order
        );
    }
}

/// Merge series entries with first-wins; the first serie is authoritative
pub fn merge_first_wins<K>(series: Vec<Serie<K>>, order: SortOrder) -> Vec<Entry> {
    assert_direction(&series, order);
    let streams = series.into_iter().map(|s| s.entries).collect();
    merge_sorted(streams, order, |e: &Entry| e.timestamp, first_wins)
}

/// Merge series entries, folding same-timestamp entries with `aggregation`
pub fn merge_aggregated<K>(
    series: Vec<Serie<K>>,
    order: SortOrder,
    aggregation: &Aggregation,
) -> Vec<Entry> {
    assert_direction(&series, order);
    let streams = series.into_iter().map(|s| s.entries).collect();
    merge_sorted(streams, order, |e: &Entry| e.timestamp, |group| {
        aggregation.resolve(group)
    })
}
