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

// Bounded parallelism for backend calls
//
// Backends throttle by the number of in-flight requests, so every storage
// instance gets its own read and write gates.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{FederationError, Result};

/// Which gate a permit was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
}

/// Scoped permit; the slot is released when it is dropped,
/// whichever way the guarded operation ends
#[derive(Debug)]
pub struct OperationPermit {
    kind: OperationKind,
    _permit: OwnedSemaphorePermit,
}

impl OperationPermit {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

/// Independent read/write counting gates
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    reads: Arc<Semaphore>,
    writes: Arc<Semaphore>,
    max_reads: usize,
    max_writes: usize,
}

impl ConcurrencyGate {
    pub fn new(max_reads: usize, max_writes: usize) -> Self {
        let max_reads = max_reads.max(1);
        let max_writes = max_writes.max(1);
        Self {
            reads: Arc::new(Semaphore::new(max_reads)),
            writes: Arc::new(Semaphore::new(max_writes)),
            max_reads,
            max_writes,
        }
    }

    pub async fn acquire_read(&self) -> Result<OperationPermit> {
        Self::acquire(&self.reads, OperationKind::Read).await
    }

    pub async fn acquire_write(&self) -> Result<OperationPermit> {
        Self::acquire(&self.writes, OperationKind::Write).await
    }

    async fn acquire(semaphore: &Arc<Semaphore>, kind: OperationKind) -> Result<OperationPermit> {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| FederationError::Backend(anyhow::anyhow!("{:?} gate closed: {}", kind, e)))?;
        Ok(OperationPermit {
            kind,
            _permit: permit,
        })
    }

    /// Read slots currently free
    pub fn available_reads(&self) -> usize {
        self.reads.available_permits()
    }

    /// Write slots currently free
    pub fn available_writes(&self) -> usize {
        self.writes.available_permits()
    }

    pub fn max_reads(&self) -> usize {
        self.max_reads
    }

    pub fn max_writes(&self) -> usize {
        self.max_writes
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new(32, 16)
    }
}
