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

//! # Fechamento
//!
//! This library provides the invoice-closure engine behind a shipping-label
//! and invoicing dashboard: issuing a bank slip ("boleto") when an invoice
//! is closed for collection, caching the rendered documents across three
//! storage tiers, recovering them when a tier misses, and propagating
//! realtime payment events.
//!
//! ## Core Components
//!
//! - [`BoletoLifecycle`]: State machine for closing, viewing, and canceling
//!   a closure; the sole writer of records
//! - [`TieredStore`]: Memory, durable, and remote tiers acting as one cache
//! - [`ArtifactRecoveryResolver`]: Fallback chain for cache misses
//! - [`PaymentEventListener`]: Realtime settlement and credit propagation
//! - [`patch_manifest_header`]: Stamps run-specific totals onto a generated
//!   carrier manifest
//!
//! ## Example
//!
//! ```no_run
//! use fechamento_rs::{InMemoryDurableStore, InMemoryRemoteStore, TieredStore};
//! use fechamento_rs::{ClosureError, ClosureKey, FechamentoRecord, InvoiceId};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), ClosureError> {
//! let store = TieredStore::new(
//!     Arc::new(InMemoryDurableStore::new()),
//!     Arc::new(InMemoryRemoteStore::new()),
//! );
//!
//! let record = FechamentoRecord::new(InvoiceId::from("INV-1"), None, "Acme", "12345678901");
//! store.put(&record).await?;
//!
//! let key = ClosureKey::parent(InvoiceId::from("INV-1"));
//! assert!(store.get(&key)?.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## Consistency
//!
//! The three tiers are independent and non-transactional. Writes to the
//! memory and durable tiers are synchronous and authoritative; the remote
//! tier is best-effort on write and delete, and the design tolerates
//! last-writer-wins across operator sessions. Duplicate slip issuance is
//! prevented by a read-before-write check plus an in-flight reservation,
//! accepted as best-effort rather than a hard mutual-exclusion guarantee.

pub mod base;
pub mod error;
pub mod events;
pub mod invoice;
pub mod issuance_log;
pub mod lifecycle;
pub mod manifest;
pub mod pdf;
pub mod provider;
pub mod record;
pub mod resolver;
pub mod store;

pub use base::{BoletoId, ClosureKey, InvoiceId, SubInvoiceId};
pub use error::{CacheWarning, ClosureError, ProviderCall};
pub use events::{
    ChangeEvent, CreditRow, FeedFilter, InvoiceRow, PaymentEventListener, QueryCache,
    SettlementNotice,
};
pub use invoice::{Invoice, InvoiceStatus};
pub use lifecycle::{BoletoLifecycle, BulkReport, CancelFlag, Closed, OutOfBandClosure};
pub use manifest::{ManifestHeader, patch_manifest_header};
pub use pdf::{decode_pdf, encode_pdf, merge_pdfs};
pub use provider::{
    CancellationRequest, InvoiceRenderer, IssuanceApi, IssuanceRequest, IssuanceResponse,
    SlipDocument, SlipProvider, SlipQuery,
};
pub use record::{ClosureState, FechamentoRecord, SourceTier};
pub use resolver::{ArtifactRecoveryResolver, Recovered};
pub use store::{
    DurableStore, InMemoryDurableStore, InMemoryRemoteStore, RemoteStore, TieredStore,
};
