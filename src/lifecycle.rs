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

//! Closure lifecycle.
//!
//! The [`BoletoLifecycle`] is the sole writer of closure records. It owns
//! the idempotency rules that keep slip issuance a once-per-key side effect:
//! a read-before-write check against the record store, plus an in-flight
//! reservation for the window where the provider call is still pending.
//!
//! # Operations
//!
//! | Operation | Behavior |
//! |-----------|----------|
//! | `close_invoice` | Issues a slip once, caches the returned documents |
//! | `view_closure` | Returns cached artifacts, recovering them if missing |
//! | `cancel_closure` | Cancels the slip at the provider, then removes the record |
//! | `register_bulk` | Registers closures made out-of-band, documents filled lazily |

use crate::base::ClosureKey;
use crate::error::{CacheWarning, ClosureError};
use crate::invoice::Invoice;
use crate::issuance_log::IssuanceLog;
use crate::pdf;
use crate::provider::{
    CancellationRequest, InvoiceRenderer, IssuanceApi, IssuanceRequest, SlipProvider,
};
use crate::record::{ClosureState, FechamentoRecord};
use crate::resolver::{ArtifactRecoveryResolver, Recovered};
use crate::store::TieredStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Cooperative cancellation for bulk operations.
///
/// Checked between items; a network call already in flight for the current
/// item runs to completion, since issuance cannot be aborted mid-flight.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Result of a `close_invoice` call.
#[derive(Debug, Clone)]
pub struct Closed {
    pub record: FechamentoRecord,
    /// Present when the remote tier missed the write-through; the record is
    /// still safely cached on this device.
    pub warning: Option<CacheWarning>,
}

/// A closure made in another environment, registered after the fact. The
/// slip id is known; documents are recovered lazily on the next view.
#[derive(Debug, Clone)]
pub struct OutOfBandClosure {
    pub invoice_id: crate::base::InvoiceId,
    pub sub_invoice_id: Option<crate::base::SubInvoiceId>,
    pub client_name: String,
    pub document_number: String,
    pub boleto_id: crate::base::BoletoId,
    /// Original closure timestamp, kept when known so conflict resolution
    /// still favors genuinely newer records.
    pub created_at: Option<DateTime<Utc>>,
}

/// Per-item outcomes of a bulk registration run.
#[derive(Debug, Default)]
pub struct BulkReport {
    pub registered: usize,
    pub failed: usize,
    /// True when the run stopped early on a cancellation request.
    pub canceled: bool,
    pub outcomes: Vec<(ClosureKey, Result<(), ClosureError>)>,
}

/// State machine governing issuance, caching, recovery, and cancellation of
/// a bank slip tied to an invoice or sub-invoice.
pub struct BoletoLifecycle {
    store: Arc<TieredStore>,
    issuance: Arc<dyn IssuanceApi>,
    resolver: ArtifactRecoveryResolver,
    inflight: IssuanceLog,
}

impl BoletoLifecycle {
    pub fn new(
        store: Arc<TieredStore>,
        issuance: Arc<dyn IssuanceApi>,
        slips: Arc<dyn SlipProvider>,
        renderer: Arc<dyn InvoiceRenderer>,
    ) -> Self {
        let resolver = ArtifactRecoveryResolver::new(store.clone(), slips, renderer);
        Self {
            store,
            issuance,
            resolver,
            inflight: IssuanceLog::new(),
        }
    }

    /// Current lifecycle state for an invoice, from the fast tiers only.
    pub fn state(&self, invoice: &Invoice) -> Result<ClosureState, ClosureError> {
        let key = invoice.closure_key();
        if self.inflight.is_inflight(&key) {
            return Ok(ClosureState::Issuing);
        }
        if let Some(record) = self.store.get(&key)? {
            return Ok(record.state());
        }
        if invoice.status == crate::invoice::InvoiceStatus::Canceled {
            return Ok(ClosureState::Canceled);
        }
        Ok(ClosureState::None)
    }

    /// Closes an invoice for collection: issues a slip, builds the record,
    /// and writes it through the store.
    ///
    /// Idempotent: an existing record for the key is returned unchanged and
    /// the provider is not called again — repeated clicks must never issue a
    /// second slip. The provider has been observed to report success while
    /// returning no documents; that outcome is tolerated and the record is
    /// registered without PDFs, to be recovered on the next view.
    ///
    /// # Errors
    ///
    /// - [`ClosureError::NotCollectable`] - status admits no closure.
    /// - [`ClosureError::IssuanceInFlight`] - a concurrent close is pending.
    /// - [`ClosureError::Provider`] - the issuance call failed; the error
    ///   carries the request payload for operator troubleshooting.
    pub async fn close_invoice(&self, invoice: &Invoice) -> Result<Closed, ClosureError> {
        if !invoice.status.can_close() {
            return Err(ClosureError::NotCollectable {
                status: invoice.status.to_string(),
            });
        }

        let key = invoice.closure_key();
        if let Some(existing) = self.store.get(&key)? {
            debug!(%key, state = ?existing.state(), "closure already on record, skipping issuance");
            return Ok(Closed {
                record: existing,
                warning: None,
            });
        }

        let _guard = self.inflight.begin(&key)?;
        let request = IssuanceRequest::from_invoice(invoice);
        info!(%key, client = %invoice.client_name, "issuing slip");

        let response = self
            .issuance
            .issue(&request)
            .await
            .map_err(|e| attach_request(e, request.payload_json()))?;

        // The slip is issued at this point; an unreadable document payload
        // must not lose the record (that would invite a duplicate issuance
        // later). Undecodable documents degrade to the no-documents case.
        let invoice_pdf = decode_or_discard(&key, "invoice", response.invoice_pdf.as_deref());
        let boleto_pdf = decode_or_discard(&key, "slip", response.boleto_pdf.as_deref());

        let record = FechamentoRecord::new(
            key.invoice_id.clone(),
            key.sub_invoice_id.clone(),
            invoice.client_name.clone(),
            invoice.document_number.clone().unwrap_or_default(),
        )
        .with_documents(invoice_pdf, boleto_pdf, response.nosso_numero());

        if record.state() == ClosureState::Issued {
            info!(%key, "provider returned no slip document, closure registered without artifacts");
        }

        let warning = self.store.put(&record).await?;
        Ok(Closed { record, warning })
    }

    /// Returns the closure artifacts for display or delivery.
    ///
    /// Never issues a slip: when the record is missing or incomplete but the
    /// invoice's status implies a prior closure, recovery runs instead —
    /// re-issuing from a view action would be a monetary error.
    ///
    /// # Errors
    ///
    /// - [`ClosureError::NotClosed`] - no record anywhere and the status
    ///   does not imply a closure; there is nothing to recover.
    pub async fn view_closure(&self, invoice: &Invoice) -> Result<Recovered, ClosureError> {
        let key = invoice.closure_key();
        let local = self.store.get(&key)?;

        if local.is_none() && !invoice.status.implies_closure() {
            return Err(ClosureError::NotClosed);
        }

        self.resolver.resolve(invoice, local).await
    }

    /// Cancels the slip at the provider, then removes the record from all
    /// tiers.
    ///
    /// The caller must have obtained explicit user confirmation before
    /// calling; this method does not prompt. If the provider call fails the
    /// record is kept so the user can retry.
    ///
    /// # Errors
    ///
    /// - [`ClosureError::MissingBoletoId`] - no slip id on record; fails
    ///   before any network call.
    /// - [`ClosureError::Provider`] - the cancellation was rejected; the raw
    ///   provider message is preserved for manual reconciliation.
    pub async fn cancel_closure(&self, invoice: &Invoice) -> Result<(), ClosureError> {
        let key = invoice.closure_key();
        let boleto_id = self
            .store
            .get(&key)?
            .and_then(|record| record.boleto_id)
            .ok_or(ClosureError::MissingBoletoId)?;

        let request = CancellationRequest::new(boleto_id);
        self.issuance
            .cancel(&request)
            .await
            .map_err(|e| attach_request(e, request.payload_json()))?;

        self.store.delete(&key).await?;
        info!(%key, "closure canceled and removed");
        Ok(())
    }

    /// Registers closures issued out-of-band (a previous deployment, another
    /// environment). Records carry the known slip id and no documents; the
    /// next `view_closure` fills them lazily.
    ///
    /// Individual failures do not abort the run. The cancel flag is checked
    /// between items.
    pub async fn register_bulk(
        &self,
        entries: &[OutOfBandClosure],
        cancel: &CancelFlag,
    ) -> BulkReport {
        let mut report = BulkReport::default();

        for entry in entries {
            if cancel.is_canceled() {
                report.canceled = true;
                info!(
                    done = report.outcomes.len(),
                    total = entries.len(),
                    "bulk registration canceled"
                );
                break;
            }

            let key = ClosureKey {
                invoice_id: entry.invoice_id.clone(),
                sub_invoice_id: entry.sub_invoice_id.clone(),
            };
            let outcome = self.register_one(&key, entry).await;
            match &outcome {
                Ok(()) => report.registered += 1,
                Err(_) => report.failed += 1,
            }
            report.outcomes.push((key, outcome));
        }

        report
    }

    async fn register_one(
        &self,
        key: &ClosureKey,
        entry: &OutOfBandClosure,
    ) -> Result<(), ClosureError> {
        if self.store.get(key)?.is_some() {
            debug!(%key, "already registered, left unchanged");
            return Ok(());
        }

        let mut record = FechamentoRecord::new(
            entry.invoice_id.clone(),
            entry.sub_invoice_id.clone(),
            entry.client_name.clone(),
            entry.document_number.clone(),
        )
        .with_documents(None, None, Some(entry.boleto_id.clone()));
        if let Some(created_at) = entry.created_at {
            record = record.with_created_at(created_at);
        }

        // A remote miss is a warning, not a failure: the registration holds.
        self.store.put(&record).await?;
        Ok(())
    }
}

fn decode_or_discard(key: &ClosureKey, which: &str, payload: Option<&str>) -> Option<Vec<u8>> {
    match payload.map(pdf::decode_pdf) {
        Some(Ok(bytes)) => Some(bytes),
        Some(Err(e)) => {
            warn!(%key, document = which, error = %e, "discarding unreadable document payload");
            None
        }
        None => None,
    }
}

/// Replaces the empty request payload on a provider error with the payload
/// actually sent, for operator troubleshooting.
fn attach_request(err: ClosureError, payload: String) -> ClosureError {
    match err {
        ClosureError::Provider { call, message, .. } => ClosureError::Provider {
            call,
            message,
            request: payload,
        },
        other => other,
    }
}
