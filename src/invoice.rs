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

//! Invoice input model.
//!
//! The dashboard owns invoice computation (totals, taxes, due dates); this
//! crate only consumes the fields needed to close, view, and cancel a
//! closure. Payment status transitions arrive through the realtime feed:
//! - `Pending`/`PartiallyPaid` → closable
//! - `Closed`/`PartiallyPaid`/`Paid` → a slip is believed to exist

use crate::base::{InvoiceId, SubInvoiceId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Payment status of an invoice as known to the dashboard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Open, never closed for collection.
    Pending,
    /// Closed for collection, slip issued, awaiting payment.
    Closed,
    /// Partially settled; still collectable for the remainder.
    PartiallyPaid,
    /// Fully settled.
    Paid,
    /// Voided; no further collection.
    Canceled,
}

impl InvoiceStatus {
    /// Whether `close_invoice` may issue a slip for this invoice.
    pub fn can_close(&self) -> bool {
        matches!(self, Self::Pending | Self::PartiallyPaid)
    }

    /// Whether the status implies a slip was issued at some point, so a
    /// missing record should be recovered rather than re-issued.
    pub fn implies_closure(&self) -> bool {
        matches!(self, Self::Closed | Self::PartiallyPaid | Self::Paid)
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Closed => "closed",
            Self::PartiallyPaid => "partially paid",
            Self::Paid => "paid",
            Self::Canceled => "canceled",
        };
        write!(f, "{name}")
    }
}

/// Invoice fields consumed by the closure engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invoice {
    pub id: InvoiceId,
    /// Human-facing invoice code, used by the provider's fallback lookup.
    pub code: String,
    pub client_name: String,
    pub phone: Option<String>,
    /// Payer document number (CPF/CNPJ), used by the provider's fallback
    /// lookup when the slip id is unknown.
    pub document_number: Option<String>,
    pub status: InvoiceStatus,
    pub amount: Decimal,
    /// Set when this invoice is a consolidated child of a parent invoice.
    pub parent_id: Option<InvoiceId>,
    pub sub_invoice_id: Option<SubInvoiceId>,
    /// Amount of the child portion, when closing a sub-invoice.
    pub sub_invoice_amount: Option<Decimal>,
}

impl Invoice {
    /// The logical closure key for this invoice.
    ///
    /// A sub-invoice is keyed under its parent id; a plain invoice under its
    /// own id with no child component.
    pub fn closure_key(&self) -> crate::base::ClosureKey {
        match (&self.parent_id, &self.sub_invoice_id) {
            (Some(parent), Some(sub)) => {
                crate::base::ClosureKey::child(parent.clone(), sub.clone())
            }
            (None, Some(sub)) => crate::base::ClosureKey::child(self.id.clone(), sub.clone()),
            _ => crate::base::ClosureKey::parent(self.id.clone()),
        }
    }
}
