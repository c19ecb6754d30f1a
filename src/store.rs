// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Three-tier record store.
//!
//! Closure records live in three independent, non-transactional tiers:
//!
//! | Tier | Medium | Role |
//! |------|--------|------|
//! | memory | in-process map | per-session, cheapest reads |
//! | durable | client-side string KV | survives restarts on one device |
//! | remote | shared row store | authoritative across sessions |
//!
//! Read precedence is memory > durable; the remote tier is only consulted
//! through [`TieredStore::fetch_remote`] (the recovery resolver's job).
//! Writes to memory and durable are synchronous and authoritative; the
//! remote write is best-effort and surfaces failure as a [`CacheWarning`].
//! On conflicting records the most recently *written* wins, decided by
//! `created_at`, never by tier precedence.

use crate::base::{ClosureKey, InvoiceId};
use crate::error::{CacheWarning, ClosureError};
use crate::record::{FechamentoRecord, SourceTier};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Durable client-side store: a plain string key/value interface, one entry
/// per logical key, value is the JSON-serialized record.
pub trait DurableStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, ClosureError>;

    fn write(&self, key: &str, value: &str) -> Result<(), ClosureError>;

    fn remove(&self, key: &str) -> Result<(), ClosureError>;
}

/// Remote row store keyed by `(invoice_id, sub_invoice_id)`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upsert(&self, record: &FechamentoRecord) -> Result<(), ClosureError>;

    async fn fetch(&self, key: &ClosureKey) -> Result<Option<FechamentoRecord>, ClosureError>;

    /// Select every row whose parent invoice id is in `ids`.
    async fn fetch_by_invoice_ids(
        &self,
        ids: &[InvoiceId],
    ) -> Result<Vec<FechamentoRecord>, ClosureError>;

    /// Delete rows matching the key (either the parent or the child id).
    async fn remove(&self, key: &ClosureKey) -> Result<(), ClosureError>;
}

/// Reference durable tier backed by a concurrent map. Used by tests and the
/// offline registration binary.
#[derive(Debug, Default)]
pub struct InMemoryDurableStore {
    entries: DashMap<String, String>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DurableStore for InMemoryDurableStore {
    fn read(&self, key: &str) -> Result<Option<String>, ClosureError> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    fn write(&self, key: &str, value: &str) -> Result<(), ClosureError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), ClosureError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Reference remote tier backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    rows: DashMap<ClosureKey, FechamentoRecord>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn upsert(&self, record: &FechamentoRecord) -> Result<(), ClosureError> {
        self.rows.insert(record.key(), record.clone());
        Ok(())
    }

    async fn fetch(&self, key: &ClosureKey) -> Result<Option<FechamentoRecord>, ClosureError> {
        Ok(self.rows.get(key).map(|r| r.clone()))
    }

    async fn fetch_by_invoice_ids(
        &self,
        ids: &[InvoiceId],
    ) -> Result<Vec<FechamentoRecord>, ClosureError> {
        Ok(self
            .rows
            .iter()
            .filter(|entry| ids.contains(&entry.key().invoice_id))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn remove(&self, key: &ClosureKey) -> Result<(), ClosureError> {
        self.rows.remove(key);
        Ok(())
    }
}

/// The tiered record store.
///
/// Session-scoped and independent of any UI lifecycle: the memory tier is an
/// owned concurrent map, the other tiers are injected. No locking beyond the
/// map's own sharding is needed; within a session the tiers are sequential
/// steps in one call chain.
pub struct TieredStore {
    memory: DashMap<ClosureKey, FechamentoRecord>,
    durable: Arc<dyn DurableStore>,
    remote: Arc<dyn RemoteStore>,
}

impl TieredStore {
    pub fn new(durable: Arc<dyn DurableStore>, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            memory: DashMap::new(),
            durable,
            remote,
        }
    }

    /// Fast-tier read: memory first, then durable with a memory fill.
    ///
    /// Never consults the remote tier; a miss here does not mean the record
    /// does not exist, only that this device has no copy.
    pub fn get(&self, key: &ClosureKey) -> Result<Option<FechamentoRecord>, ClosureError> {
        if let Some(hit) = self.memory.get(key) {
            let mut record = hit.clone();
            record.source_tier = SourceTier::Memory;
            return Ok(Some(record));
        }

        let Some(raw) = self.durable.read(&key.storage_key())? else {
            return Ok(None);
        };
        let mut record: FechamentoRecord = serde_json::from_str(&raw)
            .map_err(|e| ClosureError::Serialization(e.to_string()))?;
        record.source_tier = SourceTier::Durable;

        // Cache fill so the next read is a memory hit.
        self.memory.insert(key.clone(), record.clone());
        debug!(%key, "durable tier hit, memory tier filled");
        Ok(Some(record))
    }

    /// Write-through: memory and durable synchronously (authoritative), then
    /// the remote tier best-effort. A remote failure is returned as a
    /// warning, not an error: the artifacts are already safely cached.
    pub async fn put(
        &self,
        record: &FechamentoRecord,
    ) -> Result<Option<CacheWarning>, ClosureError> {
        let key = record.key();
        self.write_fast(&key, record)?;

        match self.remote.upsert(record).await {
            Ok(()) => Ok(None),
            Err(e) => {
                let warning = CacheWarning {
                    key: key.to_string(),
                    detail: e.to_string(),
                };
                warn!(%key, error = %e, "remote tier write failed, record cached locally only");
                Ok(Some(warning))
            }
        }
    }

    /// Writes only the fast tiers. Used by the recovery resolver to cache a
    /// record that already exists remotely.
    pub fn fill_local(&self, record: &FechamentoRecord) -> Result<(), ClosureError> {
        self.write_fast(&record.key(), record)
    }

    fn write_fast(&self, key: &ClosureKey, record: &FechamentoRecord) -> Result<(), ClosureError> {
        let json = serde_json::to_string(record)
            .map_err(|e| ClosureError::Serialization(e.to_string()))?;
        self.durable.write(&key.storage_key(), &json)?;
        self.memory.insert(key.clone(), record.clone());
        Ok(())
    }

    /// Destructive removal. Fast tiers are cleared first so a failed remote
    /// delete can never leave the record visible as active; the remote
    /// delete is attempted once and logged, not retried.
    pub async fn delete(&self, key: &ClosureKey) -> Result<(), ClosureError> {
        self.memory.remove(key);
        self.durable.remove(&key.storage_key())?;

        if let Err(e) = self.remote.remove(key).await {
            warn!(%key, error = %e, "remote tier delete failed, row needs manual cleanup");
        }
        Ok(())
    }

    /// Remote-tier read, for the recovery resolver.
    pub async fn fetch_remote(
        &self,
        key: &ClosureKey,
    ) -> Result<Option<FechamentoRecord>, ClosureError> {
        let mut found = self.remote.fetch(key).await?;
        if let Some(record) = found.as_mut() {
            record.source_tier = SourceTier::Remote;
        }
        Ok(found)
    }

    /// Remote-tier bulk read, for out-of-band reconciliation.
    pub async fn fetch_remote_by_invoice_ids(
        &self,
        ids: &[InvoiceId],
    ) -> Result<Vec<FechamentoRecord>, ClosureError> {
        self.remote.fetch_by_invoice_ids(ids).await
    }

    /// Resolves two records claiming the same key: the most recently written
    /// wins, by `created_at`. When both carry a slip id and the ids differ
    /// (two independent issuances raced), the loser is logged for manual
    /// reconciliation with the bank; its slip is still live until canceled.
    pub fn reconcile(a: FechamentoRecord, b: FechamentoRecord) -> FechamentoRecord {
        let (winner, loser) = if b.created_at > a.created_at {
            (b, a)
        } else {
            (a, b)
        };
        if let (Some(kept), Some(dropped)) = (&winner.boleto_id, &loser.boleto_id) {
            if kept != dropped {
                warn!(
                    key = %winner.key(),
                    kept = %kept,
                    dropped = %dropped,
                    "conflicting slip ids for one closure, keeping the newest; review the dropped slip manually"
                );
            }
        }
        winner
    }
}
