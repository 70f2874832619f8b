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

//! Hot to cold tier migration.
//!
//! The planner pairs every hot window with every cold window it overlaps,
//! clipped to the requested range. Each job then drains its range from the
//! hot storage one segment at a time: read, write to cold, delete exactly
//! what was read.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{FederationError, Result};
use crate::model::Serie;
use crate::selector::{compare_from, intersect, StorageSelection, StorageSelector};
use crate::storage::SegmentQuery;

/// Move `[from, to)` of one id from `hot` to `cold`
#[derive(Debug, Clone)]
pub struct MigrationJob {
    pub id: String,
    pub hot: StorageSelection,
    pub cold: StorageSelection,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl MigrationJob {
    /// Run to exhaustion, returning the number of entries moved
    ///
    /// Every page is re-read without a token: the previous page has been
    /// deleted, so the first page of the remaining range is always next.
    pub async fn run(&self, segment_size: usize) -> Result<usize> {
        let dynamic = self
            .hot
            .storage
            .as_dynamic()
            .ok_or(FederationError::MissingCollaborator("segmented hot storage"))?;
        let query = SegmentQuery::new(self.from, self.to, segment_size);

        let mut moved = 0;
        loop {
            let segment = dynamic.read_segmented(&self.id, &query, None).await?;
            if segment.is_empty() {
                break;
            }

            let has_more = segment.has_more();
            let serie = Serie::with_entries(
                segment.id.clone(),
                segment.entries.clone(),
                segment.sort,
            );
            self.cold.storage.write(&[serie]).await?;
            moved += segment.delete().await?;

            debug!(
                "Moved {} entries of '{}' from '{}' to '{}'",
                segment.len(),
                self.id,
                self.hot.name,
                self.cold.name
            );

            if !has_more {
                break;
            }
        }

        if moved > 0 {
            info!(
                "Migrated {} entries of '{}' from '{}' to '{}'",
                moved, self.id, self.hot.name, self.cold.name
            );
        }
        Ok(moved)
    }
}

/// Pairs hot and cold windows into migration jobs
#[derive(Clone)]
pub struct MigrationPlanner {
    hot: Arc<dyn StorageSelector>,
    cold: Arc<dyn StorageSelector>,
}

impl MigrationPlanner {
    pub fn new(hot: Arc<dyn StorageSelector>, cold: Arc<dyn StorageSelector>) -> Self {
        Self { hot, cold }
    }

    /// Jobs moving `[min_from, max_to)` of `id`, oldest first
    pub fn plan(
        &self,
        id: &str,
        min_from: Option<DateTime<Utc>>,
        max_to: Option<DateTime<Utc>>,
    ) -> Vec<MigrationJob> {
        let mut hot = self.hot.windows(id);
        let mut cold = self.cold.windows(id);
        hot.sort_by(|a, b| compare_from(&a.from, &b.from));
        cold.sort_by(|a, b| compare_from(&a.from, &b.from));

        let mut jobs = Vec::new();
        let mut cursor = 0;
        for cold_window in &cold {
            // Hot windows ending before this cold window can't meet any later one
            while cursor < hot.len() && ends_before(&hot[cursor], cold_window.from) {
                cursor += 1;
            }

            for hot_window in &hot[cursor..] {
                if let (Some(hot_from), Some(cold_to)) = (hot_window.from, cold_window.to) {
                    if hot_from >= cold_to {
                        break;
                    }
                }
                if hot_window.same_as(cold_window) {
                    continue;
                }

                let Some((from, to)) =
                    intersect(hot_window.from, hot_window.to, cold_window.from, cold_window.to)
                else {
                    continue;
                };
                let Some((from, to)) = intersect(from, to, min_from, max_to) else {
                    continue;
                };

                jobs.push(MigrationJob {
                    id: id.to_string(),
                    hot: hot_window.clone(),
                    cold: cold_window.clone(),
                    from,
                    to,
                });
            }
        }
        jobs
    }
}

fn ends_before(window: &StorageSelection, from: Option<DateTime<Utc>>) -> bool {
    match (window.to, from) {
        (Some(to), Some(from)) => to <= from,
        _ => false,
    }
}
