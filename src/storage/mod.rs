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

// Storage module
//
// Provides a trait-based abstraction over time-series storages
// (in-memory hot tier, blob-packed filesystem cold tier), optional
// segmented and grouped capabilities, a bounded-concurrency wrapper
// and the temporary side channel for failed writes.

pub mod backend;
pub mod factory;
pub mod filesystem;
pub mod memory;
pub mod temporary;
pub mod throttled;

pub use backend::{
    just_after, ContinuationToken, DynamicStorage, GroupedStorage, Segment, SegmentDeleter,
    SegmentQuery, Storage,
};
pub use factory::BackendFactory;
pub use filesystem::FilesystemStorage;
pub use memory::MemoryStorage;
pub use temporary::{FileTemporaryStorage, MemoryTemporaryStorage, TemporaryBatch, TemporaryStorage};
pub use throttled::ThrottledStorage;
