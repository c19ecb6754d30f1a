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

//! Closure artifact records.
//!
//! A closure follows a state machine:
//! - `None` → `Issuing` (close requested)
//! - `Issuing` → `Issued` (slip issued, no documents returned) or `Cached`
//! - `Issued` → `Cached` (documents recovered later)
//! - any → `Canceled` (slip canceled, record removed everywhere)

use crate::base::{BoletoId, ClosureKey, InvoiceId, SubInvoiceId};
use crate::error::ClosureError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Which tier a record was read from. Diagnostics only; never drives
/// precedence decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourceTier {
    #[default]
    Memory,
    Durable,
    Remote,
}

/// Lifecycle state of a closure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClosureState {
    /// No closure exists for the key.
    None,
    /// An issuance call is in flight.
    Issuing,
    /// The slip was issued but the provider returned no documents.
    Issued,
    /// Rendered documents are cached.
    Cached,
    /// The slip was canceled and the record removed.
    Canceled,
}

/// The closure artifact bundle for one invoice or one sub-invoice.
///
/// PDF payloads are immutable once written to any tier: updates replace the
/// whole record rather than mutating fields in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FechamentoRecord {
    pub invoice_id: InvoiceId,
    #[serde(default)]
    pub sub_invoice_id: Option<SubInvoiceId>,
    #[serde(with = "crate::pdf::base64_opt", default)]
    pub invoice_pdf: Option<Vec<u8>>,
    #[serde(with = "crate::pdf::base64_opt", default)]
    pub boleto_pdf: Option<Vec<u8>>,
    #[serde(default)]
    pub boleto_id: Option<BoletoId>,
    pub client_name: String,
    #[serde(default)]
    pub document_number: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub source_tier: SourceTier,
}

impl FechamentoRecord {
    /// Creates an empty record for a key, with no documents and no slip id.
    pub fn new(
        invoice_id: InvoiceId,
        sub_invoice_id: Option<SubInvoiceId>,
        client_name: impl Into<String>,
        document_number: impl Into<String>,
    ) -> Self {
        Self {
            invoice_id,
            sub_invoice_id,
            invoice_pdf: None,
            boleto_pdf: None,
            boleto_id: None,
            client_name: client_name.into(),
            document_number: document_number.into(),
            created_at: Utc::now(),
            source_tier: SourceTier::Memory,
        }
    }

    /// Attaches documents and the slip id, enforcing the invariant that a
    /// slip PDF is only kept when its id is known. A slip we could never
    /// cancel or re-fetch is an operational liability, so an id-less PDF is
    /// discarded with a warning.
    pub fn with_documents(
        mut self,
        invoice_pdf: Option<Vec<u8>>,
        boleto_pdf: Option<Vec<u8>>,
        boleto_id: Option<BoletoId>,
    ) -> Self {
        self.invoice_pdf = invoice_pdf;
        if boleto_pdf.is_some() && boleto_id.is_none() {
            warn!(
                invoice = %self.invoice_id,
                "discarding slip pdf issued without a nosso número"
            );
            self.boleto_pdf = None;
        } else {
            self.boleto_pdf = boleto_pdf;
        }
        self.boleto_id = boleto_id;
        self.assert_invariants();
        self
    }

    /// Overrides the creation timestamp (bulk registration of closures made
    /// in another environment keeps their original timestamps).
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn key(&self) -> ClosureKey {
        ClosureKey {
            invoice_id: self.invoice_id.clone(),
            sub_invoice_id: self.sub_invoice_id.clone(),
        }
    }

    /// State derived from the documents present.
    pub fn state(&self) -> ClosureState {
        if self.boleto_pdf.is_some() {
            ClosureState::Cached
        } else {
            ClosureState::Issued
        }
    }

    /// Both documents present; nothing left to recover.
    pub fn is_complete(&self) -> bool {
        self.invoice_pdf.is_some() && self.boleto_pdf.is_some()
    }

    /// Invoice and slip merged into one document for delivery, invoice
    /// first. A record holding a single document is delivered as-is.
    ///
    /// # Errors
    ///
    /// Returns [`ClosureError::PdfMalformed`] when the record holds no
    /// documents, or when a held payload is not a parseable PDF.
    pub fn delivery_document(&self) -> Result<Vec<u8>, ClosureError> {
        let documents: Vec<&[u8]> = [self.invoice_pdf.as_deref(), self.boleto_pdf.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        crate::pdf::merge_pdfs(&documents)
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.boleto_pdf.is_none() || self.boleto_id.is_some(),
            "Invariant violated: slip pdf present without a slip id for {}",
            self.invoice_id
        );
    }
}
