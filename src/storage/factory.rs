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

// Backend factory for creating storages from configuration

use super::backend::Storage;
use super::filesystem::FilesystemStorage;
use super::memory::MemoryStorage;
use super::temporary::{FileTemporaryStorage, MemoryTemporaryStorage, TemporaryStorage};
use super::throttled::ThrottledStorage;
use crate::concurrency::ConcurrencyGate;
use crate::config::{StorageDefinition, TemporaryConfig};
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub struct BackendFactory;

impl BackendFactory {
    /// Create a storage from its definition, wrapped in its concurrency gate
    pub fn create(name: &str, definition: &StorageDefinition) -> Result<Arc<dyn Storage>> {
        let backend: Arc<dyn Storage> = match definition.backend.as_str() {
            "memory" => Arc::new(MemoryStorage::new()),

            "filesystem" => {
                let backend_config = definition
                    .backend_config
                    .as_filesystem()
                    .ok_or_else(|| anyhow::anyhow!("Filesystem config missing for storage '{}'", name))?;

                Arc::new(FilesystemStorage::new(backend_config.clone())?)
            }

            unknown => bail!(
                "Unknown storage backend: '{}'. Supported: memory, filesystem",
                unknown
            ),
        };

        let gate = ConcurrencyGate::new(
            definition.concurrency.max_reads,
            definition.concurrency.max_writes,
        );
        info!(
            "Created {} storage '{}' (reads: {}, writes: {})",
            backend.backend_type(),
            name,
            gate.max_reads(),
            gate.max_writes()
        );

        Ok(Arc::new(ThrottledStorage::new(backend, gate)))
    }

    /// Create every declared storage, keyed by name
    pub fn create_all<'a, I>(definitions: I) -> Result<HashMap<String, Arc<dyn Storage>>>
    where
        I: IntoIterator<Item = (&'a String, &'a StorageDefinition)>,
    {
        definitions
            .into_iter()
            .map(|(name, definition)| Ok((name.clone(), Self::create(name, definition)?)))
            .collect()
    }

    /// Create the temporary storage, `None` when disabled
    pub fn create_temporary(config: &TemporaryConfig) -> Result<Option<Arc<dyn TemporaryStorage>>> {
        match config.backend.as_str() {
            "none" => Ok(None),
            "memory" => Ok(Some(Arc::new(MemoryTemporaryStorage::new()))),
            "filesystem" => {
                let path = config
                    .path
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("Temporary storage path missing"))?;
                Ok(Some(Arc::new(FileTemporaryStorage::new(path, config.max_bytes))))
            }
            unknown => bail!(
                "Unknown temporary backend: '{}'. Supported: none, memory, filesystem",
                unknown
            ),
        }
    }
}
