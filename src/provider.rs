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

//! External provider interfaces.
//!
//! The dashboard's request layer implements these traits against the real
//! issuance API, the banking provider, and the rendering backend. This crate
//! ships the contracts and the wire types only; tests provide in-memory
//! implementations.
//!
//! Every method is an async boundary capable of indefinite delay.
//! Implementations should bound validation-style calls (cancellation, slip
//! lookup) at around ten seconds, and leave document generation unbounded
//! but cancelable: rendering is observed to be slow, and an issuance cannot
//! be safely aborted mid-flight.

use crate::base::{BoletoId, InvoiceId, SubInvoiceId};
use crate::error::ClosureError;
use crate::invoice::Invoice;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Fixed reason code sent with every cancellation ("canceled on operator
/// request" in the provider's reason table).
pub const CANCEL_REASON_OPERATOR_REQUEST: u8 = 5;

/// Issuance request payload.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuanceRequest {
    pub invoice_id: InvoiceId,
    pub code: String,
    pub client_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_invoice_id: Option<InvoiceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_invoice_id: Option<SubInvoiceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer_document: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_invoice_amount: Option<Decimal>,
}

impl IssuanceRequest {
    pub fn from_invoice(invoice: &Invoice) -> Self {
        Self {
            invoice_id: invoice.id.clone(),
            code: invoice.code.clone(),
            client_name: invoice.client_name.clone(),
            phone: invoice.phone.clone(),
            parent_invoice_id: invoice.parent_id.clone(),
            sub_invoice_id: invoice.sub_invoice_id.clone(),
            payer_document: invoice.document_number.clone(),
            sub_invoice_amount: invoice.sub_invoice_amount,
        }
    }

    /// Serialized payload carried inside provider errors for diagnostics.
    pub fn payload_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Slip metadata returned at issuance time.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BoletoInfo {
    pub nosso_numero: String,
    #[serde(default)]
    pub digitable_line: Option<String>,
}

/// The documented issuance response contract.
///
/// All fields are optional: the provider has been observed to report success
/// while returning no documents at all. Callers must tolerate an empty
/// response rather than treat it as an error.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuanceResponse {
    #[serde(default)]
    pub invoice_pdf: Option<String>,
    #[serde(default)]
    pub boleto_pdf: Option<String>,
    #[serde(default)]
    pub boleto_info: Option<BoletoInfo>,
}

impl IssuanceResponse {
    /// Normalizes the upstream's varying shapes into the one documented
    /// contract. Observed shapes: a bare object, a bare one-element array,
    /// an `{ "items": [...] }` wrapper, and an empty array (success with no
    /// documents). Anything else is a serialization error.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ClosureError> {
        use serde_json::Value;
        match value {
            Value::Array(items) => match items.into_iter().next() {
                Some(first) => Self::from_value(first),
                None => Ok(Self::default()),
            },
            Value::Object(ref map) if map.contains_key("items") => {
                let inner = map.get("items").cloned().unwrap_or(Value::Null);
                Self::from_value(inner)
            }
            Value::Object(_) => serde_json::from_value(value)
                .map_err(|e| ClosureError::Serialization(e.to_string())),
            Value::Null => Ok(Self::default()),
            other => Err(ClosureError::Serialization(format!(
                "unexpected issuance response shape: {other}"
            ))),
        }
    }

    pub fn nosso_numero(&self) -> Option<BoletoId> {
        self.boleto_info
            .as_ref()
            .map(|info| BoletoId(info.nosso_numero.clone()))
    }
}

/// Cancellation request payload.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CancellationRequest {
    pub nosso_numero: BoletoId,
    pub reason_code: u8,
}

impl CancellationRequest {
    pub fn new(nosso_numero: BoletoId) -> Self {
        Self {
            nosso_numero,
            reason_code: CANCEL_REASON_OPERATOR_REQUEST,
        }
    }

    pub fn payload_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Slip retrieval query.
///
/// The provider does not always echo back the id used at issuance, so the
/// lookup is dual: by `nosso_numero` when known, otherwise by the invoice
/// code and payer document.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlipQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nosso_numero: Option<BoletoId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer_document: Option<String>,
}

impl SlipQuery {
    pub fn by_id(nosso_numero: BoletoId) -> Self {
        Self {
            nosso_numero: Some(nosso_numero),
            ..Self::default()
        }
    }

    pub fn by_identity(invoice_code: impl Into<String>, payer_document: impl Into<String>) -> Self {
        Self {
            invoice_code: Some(invoice_code.into()),
            payer_document: Some(payer_document.into()),
            ..Self::default()
        }
    }

    pub fn payload_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// A retrieved slip document.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlipDocument {
    /// Base64 PDF payload.
    pub pdf: String,
    pub nosso_numero: String,
}

/// Closure/boleto issuance and cancellation endpoint.
#[async_trait]
pub trait IssuanceApi: Send + Sync {
    async fn issue(&self, request: &IssuanceRequest) -> Result<IssuanceResponse, ClosureError>;

    async fn cancel(&self, request: &CancellationRequest) -> Result<(), ClosureError>;
}

/// The banking provider's slip PDF retrieval endpoint.
#[async_trait]
pub trait SlipProvider: Send + Sync {
    async fn fetch_slip(&self, query: &SlipQuery) -> Result<SlipDocument, ClosureError>;
}

/// Invoice PDF rendering endpoint. Decoupled from slip rendering; the two
/// run against different backends and fail independently.
#[async_trait]
pub trait InvoiceRenderer: Send + Sync {
    async fn render_invoice(
        &self,
        invoice_id: &InvoiceId,
        code: &str,
    ) -> Result<Vec<u8>, ClosureError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn adapter_accepts_bare_object() {
        let response = IssuanceResponse::from_value(json!({
            "invoicePdf": "aW52",
            "boletoPdf": "Ym9s",
            "boletoInfo": { "nossoNumero": "12345" }
        }))
        .unwrap();
        assert_eq!(response.invoice_pdf.as_deref(), Some("aW52"));
        assert_eq!(response.nosso_numero(), Some(BoletoId::from("12345")));
    }

    #[test]
    fn adapter_accepts_one_element_array() {
        let response = IssuanceResponse::from_value(json!([
            { "boletoInfo": { "nossoNumero": "777" } }
        ]))
        .unwrap();
        assert_eq!(response.nosso_numero(), Some(BoletoId::from("777")));
    }

    #[test]
    fn adapter_accepts_items_wrapper() {
        let response = IssuanceResponse::from_value(json!({
            "items": [ { "boletoInfo": { "nossoNumero": "42" } } ]
        }))
        .unwrap();
        assert_eq!(response.nosso_numero(), Some(BoletoId::from("42")));
    }

    #[test]
    fn adapter_treats_empty_array_as_documentless_success() {
        let response = IssuanceResponse::from_value(json!([])).unwrap();
        assert_eq!(response, IssuanceResponse::default());
        assert!(response.nosso_numero().is_none());
    }

    #[test]
    fn adapter_rejects_scalar_shapes() {
        assert!(matches!(
            IssuanceResponse::from_value(json!("ok")),
            Err(ClosureError::Serialization(_))
        ));
        assert!(matches!(
            IssuanceResponse::from_value(json!(12)),
            Err(ClosureError::Serialization(_))
        ));
    }

    #[test]
    fn issuance_request_omits_absent_fields() {
        let request = IssuanceRequest {
            invoice_id: InvoiceId::from("INV-1"),
            code: "F001".to_string(),
            client_name: "Acme".to_string(),
            phone: None,
            parent_invoice_id: None,
            sub_invoice_id: None,
            payer_document: None,
            sub_invoice_amount: None,
        };
        let json = request.payload_json();
        assert!(json.contains("invoiceId"));
        assert!(!json.contains("subInvoiceId"));
        assert!(!json.contains("phone"));
    }

    #[test]
    fn cancellation_request_uses_fixed_reason_code() {
        let request = CancellationRequest::new(BoletoId::from("12345"));
        assert_eq!(request.reason_code, CANCEL_REASON_OPERATOR_REQUEST);
        assert!(request.payload_json().contains("nossoNumero"));
    }

    #[test]
    fn slip_query_constructors_set_one_lookup_path_each() {
        let by_id = SlipQuery::by_id(BoletoId::from("99"));
        assert!(by_id.nosso_numero.is_some());
        assert!(by_id.invoice_code.is_none());

        let by_identity = SlipQuery::by_identity("F001", "12345678901");
        assert!(by_identity.nosso_numero.is_none());
        assert_eq!(by_identity.invoice_code.as_deref(), Some("F001"));
        assert_eq!(by_identity.payer_document.as_deref(), Some("12345678901"));
    }
}
