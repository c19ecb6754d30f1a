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

//! Error types for closure processing.
//!
//! Errors on the authoritative path (validation, provider calls, memory and
//! durable tier writes) propagate to the caller. Best-effort paths (remote
//! tier writes, header patching) never produce an `Err`; they surface as
//! [`CacheWarning`] values or log entries instead.

use std::fmt;
use thiserror::Error;

/// Which external call a provider error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderCall {
    /// Closure/boleto issuance endpoint.
    Issuance,
    /// Slip cancellation endpoint.
    Cancellation,
    /// Slip PDF retrieval endpoint.
    SlipRetrieval,
    /// Invoice PDF rendering endpoint.
    InvoiceRender,
    /// Remote row store.
    RemoteStore,
}

impl fmt::Display for ProviderCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Issuance => "issuance",
            Self::Cancellation => "cancellation",
            Self::SlipRetrieval => "slip retrieval",
            Self::InvoiceRender => "invoice rendering",
            Self::RemoteStore => "remote store",
        };
        write!(f, "{name}")
    }
}

/// Closure processing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClosureError {
    /// Cancellation or slip re-fetch requested without a slip identifier
    #[error("missing boleto id (nosso número) for this closure")]
    MissingBoletoId,

    /// Invoice status does not admit closing
    #[error("invoice is {status}, closure requires pending or partially paid")]
    NotCollectable { status: String },

    /// Nothing to view or recover: the invoice was never closed
    #[error("invoice has no closure on record")]
    NotClosed,

    /// Another issuance for the same key has not completed yet
    #[error("an issuance for this invoice is already in flight")]
    IssuanceInFlight,

    /// An external call failed; the raw provider message is preserved so the
    /// operator can reconcile with the bank. `request` holds the serialized
    /// payload that was sent, for troubleshooting.
    #[error("{call} call failed: {message}")]
    Provider {
        call: ProviderCall,
        message: String,
        request: String,
    },

    /// Durable tier read or write failed (authoritative path)
    #[error("durable tier failure: {0}")]
    DurableTier(String),

    /// Record could not be serialized or deserialized
    #[error("record serialization failed: {0}")]
    Serialization(String),

    /// A provider payload was not valid base64 / not a PDF
    #[error("invalid pdf payload: {0}")]
    PdfDecode(String),

    /// A PDF byte stream could not be parsed
    #[error("malformed pdf: {0}")]
    PdfMalformed(String),
}

impl ClosureError {
    /// Shorthand for a provider error without a recorded request payload.
    pub fn provider(call: ProviderCall, message: impl Into<String>) -> Self {
        Self::Provider {
            call,
            message: message.into(),
            request: String::new(),
        }
    }
}

/// A non-authoritative tier failed to persist.
///
/// The overall operation still succeeded: the artifacts are safely cached in
/// the fast tiers. Callers show this as a warning, not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheWarning {
    /// Display form of the affected closure key.
    pub key: String,
    /// What went wrong on the best-effort path.
    pub detail: String,
}

impl fmt::Display for CacheWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote tier skipped for {}: {}", self.key, self.detail)
    }
}
