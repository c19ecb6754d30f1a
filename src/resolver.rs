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

//! Artifact recovery.
//!
//! When the fast tiers miss, the artifacts may still exist remotely or at
//! the banking provider. The resolver walks the fallback chain, stopping at
//! the first step that completes the record:
//!
//! 1. the partial record already has both PDFs
//! 2. the remote tier
//! 3. the provider's slip retrieval (by id, or by invoice code + payer
//!    document when the id is unknown)
//! 4. the invoice rendering backend, independently of the slip
//!
//! Whatever was recovered is persisted back through all tiers best-effort.
//! A record with only one of the two PDFs is a valid outcome; exhausting
//! steps 3 and 4 yields a soft error, never an `Err`.

use crate::base::BoletoId;
use crate::invoice::Invoice;
use crate::pdf;
use crate::provider::{InvoiceRenderer, SlipProvider, SlipQuery};
use crate::record::FechamentoRecord;
use crate::store::TieredStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a recovery attempt.
#[derive(Debug, Clone)]
pub struct Recovered {
    pub record: FechamentoRecord,
    /// Set when the provider steps failed and the record is still partial.
    /// The invoice PDF alone may still be useful to the caller.
    pub soft_error: Option<String>,
}

impl Recovered {
    fn clean(record: FechamentoRecord) -> Self {
        Self {
            record,
            soft_error: None,
        }
    }
}

/// Fallback chain for cache misses.
pub struct ArtifactRecoveryResolver {
    store: Arc<TieredStore>,
    slips: Arc<dyn SlipProvider>,
    renderer: Arc<dyn InvoiceRenderer>,
}

impl ArtifactRecoveryResolver {
    pub fn new(
        store: Arc<TieredStore>,
        slips: Arc<dyn SlipProvider>,
        renderer: Arc<dyn InvoiceRenderer>,
    ) -> Self {
        Self {
            store,
            slips,
            renderer,
        }
    }

    pub async fn resolve(
        &self,
        invoice: &Invoice,
        partial: Option<FechamentoRecord>,
    ) -> Result<Recovered, crate::error::ClosureError> {
        let key = invoice.closure_key();

        let partial = match partial {
            Some(record) if record.is_complete() => return Ok(Recovered::clean(record)),
            other => other,
        };

        // Remote read is part of recovery, not of the authoritative path: a
        // failure here falls through to the provider instead of aborting.
        let remote = match self.store.fetch_remote(&key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(%key, error = %e, "remote tier unavailable during recovery");
                None
            }
        };

        let mut record = match (partial, remote) {
            (Some(local), Some(shared)) => {
                let winner = TieredStore::reconcile(local.clone(), shared.clone());
                merge_missing(winner, if local.created_at >= shared.created_at {
                    shared
                } else {
                    local
                })
            }
            (None, Some(shared)) => shared,
            (Some(local), None) => local,
            (None, None) => FechamentoRecord::new(
                key.invoice_id.clone(),
                key.sub_invoice_id.clone(),
                invoice.client_name.clone(),
                invoice.document_number.clone().unwrap_or_default(),
            ),
        };

        if record.is_complete() {
            self.store.fill_local(&record)?;
            debug!(%key, "recovered from remote tier");
            return Ok(Recovered::clean(record));
        }

        let mut failures: Vec<String> = Vec::new();

        if record.boleto_pdf.is_none() {
            match self.slip_query(&record, invoice) {
                Some(query) => match self.slips.fetch_slip(&query).await {
                    Ok(doc) => match pdf::decode_pdf(&doc.pdf) {
                        Ok(bytes) => {
                            if record.boleto_id.is_none() {
                                record.boleto_id = Some(BoletoId(doc.nosso_numero));
                            }
                            record.boleto_pdf = Some(bytes);
                        }
                        Err(e) => failures.push(format!("slip payload unreadable: {e}")),
                    },
                    Err(e) => {
                        warn!(%key, error = %e, "slip retrieval failed");
                        failures.push(format!("could not recover boleto from provider: {e}"));
                    }
                },
                None => failures.push(
                    "no slip id or payer document available to look up the slip".to_string(),
                ),
            }
        }

        if record.invoice_pdf.is_none() {
            match self.renderer.render_invoice(&invoice.id, &invoice.code).await {
                Ok(bytes) => record.invoice_pdf = Some(bytes),
                Err(e) => {
                    warn!(%key, error = %e, "invoice rendering failed");
                    failures.push(format!("could not render invoice: {e}"));
                }
            }
        }

        // Persist whatever was recovered, best-effort: a tier failure must
        // not cost the caller the documents already in hand. A skeleton that
        // recovered nothing is not worth caching.
        let recovered_anything = record.invoice_pdf.is_some()
            || record.boleto_pdf.is_some()
            || record.boleto_id.is_some();
        if recovered_anything {
            if let Err(e) = self.store.put(&record).await {
                warn!(%key, error = %e, "failed to cache recovered record");
            }
        }

        let soft_error = if failures.is_empty() {
            None
        } else {
            Some(failures.join("; "))
        };
        Ok(Recovered { record, soft_error })
    }

    /// Dual lookup: by slip id when known, else by invoice code + payer
    /// document. `None` when neither identity is available.
    fn slip_query(&self, record: &FechamentoRecord, invoice: &Invoice) -> Option<SlipQuery> {
        if let Some(id) = &record.boleto_id {
            return Some(SlipQuery::by_id(id.clone()));
        }
        let document = if !record.document_number.is_empty() {
            Some(record.document_number.clone())
        } else {
            invoice.document_number.clone()
        }?;
        Some(SlipQuery::by_identity(invoice.code.clone(), document))
    }
}

/// Fills the winner's missing documents from the loser. Both records claim
/// the same key; a PDF is immutable once written, so copying it across is
/// safe.
fn merge_missing(mut winner: FechamentoRecord, loser: FechamentoRecord) -> FechamentoRecord {
    if winner.invoice_pdf.is_none() {
        winner.invoice_pdf = loser.invoice_pdf;
    }
    if winner.boleto_id.is_none() {
        winner.boleto_id = loser.boleto_id.clone();
    }
    // A slip PDF only transfers alongside its own id.
    if winner.boleto_pdf.is_none() && winner.boleto_id == loser.boleto_id {
        winner.boleto_pdf = loser.boleto_pdf;
    }
    winner
}
