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

// Federation layer over heterogeneous time-series storages
//
// This crate presents many storage instances as one logical store:
// - Routes writes to the storage whose validity window holds each entry
// - Fans reads out over every intersecting window and merges them first-wins
// - Packs entries into size-bounded, year-aligned blobs on sorted key stores
// - Migrates aged data from the hot tier to the cold tier in segments
// - Shunts failed writes to temporary storage and publishes written series

pub mod aggregate;
pub mod batcher;
pub mod client;
pub mod codec;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod keys;
pub mod merge;
pub mod migration;
pub mod model;
pub mod pubsub;
pub mod scheduler;
pub mod selector;
pub mod storage;

// Re-export main types
pub use aggregate::{AggregateFunction, Aggregation, FieldCalculator, FieldKind};
pub use batcher::{WriteBatcher, WriteHandle};
pub use client::{Client, ClientBuilder, MigrationReport};
pub use codec::{CompressionLevel, CompressionType, EntryPacker, EntrySerializer, ProtoEntrySerializer};
pub use concurrency::ConcurrencyGate;
pub use config::{load_config, load_config_with_env, FederationConfig};
pub use error::{FederationError, Result};
pub use keys::{KeyConverter, StringKeyConverter};
pub use migration::{MigrationJob, MigrationPlanner};
pub use model::{Entry, FieldValue, Serie, SortOrder};
pub use pubsub::{
    LocalPublishSubscribe, PublicationType, PublishSubscribe, Subscription, SubscriptionType,
};
pub use scheduler::MigrationScheduler;
pub use selector::{StaticStorageSelector, StorageSelection, StorageSelector};
pub use storage::{
    BackendFactory, ContinuationToken, DynamicStorage, FilesystemStorage, GroupedStorage,
    MemoryStorage, Segment, SegmentQuery, Storage, TemporaryStorage, ThrottledStorage,
};
