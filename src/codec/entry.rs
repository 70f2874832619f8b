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

// Per-entry binary serialization

use chrono::DateTime;
use prost::Message;
use std::collections::BTreeMap;

use crate::error::{FederationError, Result};
use crate::model::{Entry, FieldValue};

/// Serializes single entries to and from bytes
///
/// The packing codec frames whatever this produces; implementations only
/// need to be self-consistent.
pub trait EntrySerializer: Send + Sync {
    /// Append the encoded entry to `buf`
    fn serialize(&self, entry: &Entry, buf: &mut Vec<u8>) -> Result<()>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Entry>;

    /// Upper bound on one encoded entry, when the format has a fixed worst case
    fn max_entry_size(&self) -> Option<usize> {
        None
    }
}

/// Wire representation of one entry
#[derive(Clone, PartialEq, Message)]
pub struct EntryRecord {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(uint32, tag = "2")]
    pub nanos: u32,
    #[prost(btree_map = "string, sint64", tag = "3")]
    pub integers: BTreeMap<String, i64>,
    #[prost(btree_map = "string, double", tag = "4")]
    pub floats: BTreeMap<String, f64>,
}

/// Protobuf entry serializer (prost)
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoEntrySerializer;

impl EntrySerializer for ProtoEntrySerializer {
    fn serialize(&self, entry: &Entry, buf: &mut Vec<u8>) -> Result<()> {
        let mut record = EntryRecord {
            seconds: entry.timestamp.timestamp(),
            nanos: entry.timestamp.timestamp_subsec_nanos(),
            ..Default::default()
        };
        for (name, value) in &entry.fields {
            match value {
                FieldValue::Integer(v) => {
                    record.integers.insert(name.clone(), *v);
                }
                FieldValue::Float(v) => {
                    record.floats.insert(name.clone(), *v);
                }
            }
        }

        record
            .encode(buf)
            .map_err(|e| FederationError::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Entry> {
        let record = EntryRecord::decode(bytes)?;
        let timestamp = DateTime::from_timestamp(record.seconds, record.nanos).ok_or_else(|| {
            FederationError::Serialization(format!(
                "timestamp out of range: {}s {}ns",
                record.seconds, record.nanos
            ))
        })?;

        let mut entry = Entry::new(timestamp);
        for (name, value) in record.integers {
            entry.fields.insert(name, FieldValue::Integer(value));
        }
        for (name, value) in record.floats {
            entry.fields.insert(name, FieldValue::Float(value));
        }
        Ok(entry)
    }
}
