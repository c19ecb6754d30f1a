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

//! Core identifier types for invoices, sub-invoices, and bank slips.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for an invoice.
///
/// For a sub-invoice record this is the parent invoice id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct InvoiceId(pub String);

impl fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InvoiceId {
    fn from(s: &str) -> Self {
        InvoiceId(s.to_string())
    }
}

/// Identifier for a consolidated child invoice under a parent invoice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SubInvoiceId(pub String);

impl fmt::Display for SubInvoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SubInvoiceId {
    fn from(s: &str) -> Self {
        SubInvoiceId(s.to_string())
    }
}

/// The banking provider's slip identifier ("nosso número").
///
/// Required to cancel or re-fetch a slip; assigned by the provider at
/// issuance time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct BoletoId(pub String);

impl fmt::Display for BoletoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BoletoId {
    fn from(s: &str) -> Self {
        BoletoId(s.to_string())
    }
}

/// Logical key of a closure record.
///
/// A parent invoice is keyed by `(invoice_id, None)`; a consolidated child
/// invoice by `(invoice_id, Some(sub_invoice_id))`. At most one authoritative
/// record exists per key across all storage tiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ClosureKey {
    pub invoice_id: InvoiceId,
    pub sub_invoice_id: Option<SubInvoiceId>,
}

impl ClosureKey {
    /// Key for a parent invoice closure.
    pub fn parent(invoice_id: InvoiceId) -> Self {
        Self {
            invoice_id,
            sub_invoice_id: None,
        }
    }

    /// Key for a sub-invoice closure under a parent invoice.
    pub fn child(invoice_id: InvoiceId, sub_invoice_id: SubInvoiceId) -> Self {
        Self {
            invoice_id,
            sub_invoice_id: Some(sub_invoice_id),
        }
    }

    /// String form used as the durable-tier key, one entry per logical key.
    pub fn storage_key(&self) -> String {
        match &self.sub_invoice_id {
            Some(sub) => format!("fechamento:{}:{}", self.invoice_id, sub),
            None => format!("fechamento:{}", self.invoice_id),
        }
    }
}

impl fmt::Display for ClosureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sub_invoice_id {
            Some(sub) => write!(f, "{}/{}", self.invoice_id, sub),
            None => write!(f, "{}", self.invoice_id),
        }
    }
}
