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

//! Lifecycle public API integration tests.

use async_trait::async_trait;
use fechamento_rs::{
    BoletoId, BoletoLifecycle, CancelFlag, CancellationRequest, ClosureError, ClosureKey,
    ClosureState, DurableStore, FechamentoRecord, InMemoryDurableStore, InMemoryRemoteStore,
    Invoice, InvoiceId, InvoiceRenderer, InvoiceStatus, IssuanceApi, IssuanceRequest,
    IssuanceResponse, OutOfBandClosure, ProviderCall, RemoteStore, SlipDocument, SlipProvider,
    SlipQuery, TieredStore, encode_pdf,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const INVOICE_PDF: &[u8] = b"%PDF-1.4 invoice document";
const SLIP_PDF: &[u8] = b"%PDF-1.4 slip document";

fn make_invoice(id: &str, status: InvoiceStatus) -> Invoice {
    Invoice {
        id: InvoiceId::from(id),
        code: format!("F{id}"),
        client_name: "Acme".to_string(),
        phone: Some("11 99999-0000".to_string()),
        document_number: Some("12345678901".to_string()),
        status,
        amount: dec!(150.00),
        parent_id: None,
        sub_invoice_id: None,
        sub_invoice_amount: None,
    }
}

#[derive(Clone, Copy)]
enum IssueMode {
    Documents,
    Empty,
    Fail,
}

struct MockIssuance {
    mode: IssueMode,
    fail_cancel: bool,
    issues: AtomicUsize,
    cancels: AtomicUsize,
}

impl MockIssuance {
    fn new(mode: IssueMode) -> Self {
        Self {
            mode,
            fail_cancel: false,
            issues: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl IssuanceApi for MockIssuance {
    async fn issue(&self, _request: &IssuanceRequest) -> Result<IssuanceResponse, ClosureError> {
        self.issues.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            IssueMode::Documents => Ok(IssuanceResponse::from_value(serde_json::json!({
                "invoicePdf": encode_pdf(INVOICE_PDF),
                "boletoPdf": encode_pdf(SLIP_PDF),
                "boletoInfo": { "nossoNumero": "99001" }
            }))
            .unwrap()),
            IssueMode::Empty => Ok(IssuanceResponse::default()),
            IssueMode::Fail => Err(ClosureError::provider(
                ProviderCall::Issuance,
                "issuer rejected the request",
            )),
        }
    }

    async fn cancel(&self, _request: &CancellationRequest) -> Result<(), ClosureError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if self.fail_cancel {
            Err(ClosureError::provider(
                ProviderCall::Cancellation,
                "slip already settled",
            ))
        } else {
            Ok(())
        }
    }
}

/// Recovery backends that must stay silent during these tests.
struct CountingRecovery {
    slip_fetches: AtomicUsize,
    renders: AtomicUsize,
}

impl CountingRecovery {
    fn new() -> Self {
        Self {
            slip_fetches: AtomicUsize::new(0),
            renders: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SlipProvider for CountingRecovery {
    async fn fetch_slip(&self, _query: &SlipQuery) -> Result<SlipDocument, ClosureError> {
        self.slip_fetches.fetch_add(1, Ordering::SeqCst);
        Err(ClosureError::provider(
            ProviderCall::SlipRetrieval,
            "not available",
        ))
    }
}

#[async_trait]
impl InvoiceRenderer for CountingRecovery {
    async fn render_invoice(
        &self,
        _invoice_id: &InvoiceId,
        _code: &str,
    ) -> Result<Vec<u8>, ClosureError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        Err(ClosureError::provider(
            ProviderCall::InvoiceRender,
            "not available",
        ))
    }
}

/// Remote tier that refuses every operation, simulating a partition.
struct PartitionedRemote;

#[async_trait]
impl RemoteStore for PartitionedRemote {
    async fn upsert(&self, _record: &FechamentoRecord) -> Result<(), ClosureError> {
        Err(ClosureError::provider(ProviderCall::RemoteStore, "partition"))
    }

    async fn fetch(&self, _key: &ClosureKey) -> Result<Option<FechamentoRecord>, ClosureError> {
        Err(ClosureError::provider(ProviderCall::RemoteStore, "partition"))
    }

    async fn fetch_by_invoice_ids(
        &self,
        _ids: &[InvoiceId],
    ) -> Result<Vec<FechamentoRecord>, ClosureError> {
        Err(ClosureError::provider(ProviderCall::RemoteStore, "partition"))
    }

    async fn remove(&self, _key: &ClosureKey) -> Result<(), ClosureError> {
        Err(ClosureError::provider(ProviderCall::RemoteStore, "partition"))
    }
}

struct Harness {
    lifecycle: BoletoLifecycle,
    issuance: Arc<MockIssuance>,
    recovery: Arc<CountingRecovery>,
    store: Arc<TieredStore>,
    durable: Arc<InMemoryDurableStore>,
}

fn harness(mode: IssueMode) -> Harness {
    harness_with_remote(mode, Arc::new(InMemoryRemoteStore::new()))
}

fn harness_with_remote(mode: IssueMode, remote: Arc<dyn RemoteStore>) -> Harness {
    let durable = Arc::new(InMemoryDurableStore::new());
    let store = Arc::new(TieredStore::new(durable.clone(), remote));
    let issuance = Arc::new(MockIssuance::new(mode));
    let recovery = Arc::new(CountingRecovery::new());
    let lifecycle = BoletoLifecycle::new(
        store.clone(),
        issuance.clone(),
        recovery.clone(),
        recovery.clone(),
    );
    Harness {
        lifecycle,
        issuance,
        recovery,
        store,
        durable,
    }
}

// === Scenario A: close, then view without a second provider call ===

#[tokio::test]
async fn close_then_view_returns_identical_bytes_without_reissuing() {
    let h = harness(IssueMode::Documents);
    let invoice = make_invoice("INV-1", InvoiceStatus::Pending);

    let closed = h.lifecycle.close_invoice(&invoice).await.unwrap();
    assert_eq!(closed.record.boleto_id, Some(BoletoId::from("99001")));
    assert_eq!(closed.record.invoice_pdf.as_deref(), Some(INVOICE_PDF));
    assert_eq!(closed.record.boleto_pdf.as_deref(), Some(SLIP_PDF));
    assert!(closed.warning.is_none());

    let viewed = h.lifecycle.view_closure(&invoice).await.unwrap();
    assert!(viewed.soft_error.is_none());
    assert_eq!(viewed.record.invoice_pdf.as_deref(), Some(INVOICE_PDF));
    assert_eq!(viewed.record.boleto_pdf.as_deref(), Some(SLIP_PDF));

    assert_eq!(h.issuance.issues.load(Ordering::SeqCst), 1);
    assert_eq!(h.recovery.slip_fetches.load(Ordering::SeqCst), 0);
    assert_eq!(h.recovery.renders.load(Ordering::SeqCst), 0);
}

// === Idempotency ===

#[tokio::test]
async fn closing_twice_issues_exactly_once() {
    let h = harness(IssueMode::Documents);
    let invoice = make_invoice("INV-1", InvoiceStatus::Pending);

    let first = h.lifecycle.close_invoice(&invoice).await.unwrap();
    let second = h.lifecycle.close_invoice(&invoice).await.unwrap();

    assert_eq!(first.record.boleto_id, second.record.boleto_id);
    assert_eq!(h.issuance.issues.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn close_rejects_non_collectable_statuses() {
    let h = harness(IssueMode::Documents);

    for status in [InvoiceStatus::Paid, InvoiceStatus::Closed, InvoiceStatus::Canceled] {
        let result = h
            .lifecycle
            .close_invoice(&make_invoice("INV-1", status))
            .await;
        assert!(matches!(result, Err(ClosureError::NotCollectable { .. })));
    }
    assert_eq!(h.issuance.issues.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn partially_paid_invoices_can_still_be_closed() {
    let h = harness(IssueMode::Documents);
    let invoice = make_invoice("INV-1", InvoiceStatus::PartiallyPaid);
    assert!(h.lifecycle.close_invoice(&invoice).await.is_ok());
}

// === Provider inconsistency: success with no documents ===

#[tokio::test]
async fn documentless_issuance_is_tolerated() {
    let h = harness(IssueMode::Empty);
    let invoice = make_invoice("INV-1", InvoiceStatus::Pending);

    let closed = h.lifecycle.close_invoice(&invoice).await.unwrap();
    assert!(closed.record.invoice_pdf.is_none());
    assert!(closed.record.boleto_pdf.is_none());
    assert_eq!(closed.record.state(), ClosureState::Issued);

    // The closure is on record; a second close does not re-issue.
    h.lifecycle.close_invoice(&invoice).await.unwrap();
    assert_eq!(h.issuance.issues.load(Ordering::SeqCst), 1);
}

// === Issuance failure ===

#[tokio::test]
async fn failed_issuance_surfaces_the_request_payload_and_leaves_no_record() {
    let h = harness(IssueMode::Fail);
    let invoice = make_invoice("INV-1", InvoiceStatus::Pending);

    let err = h.lifecycle.close_invoice(&invoice).await.unwrap_err();
    match &err {
        ClosureError::Provider { call, request, .. } => {
            assert_eq!(*call, ProviderCall::Issuance);
            assert!(request.contains("INV-1"), "payload missing: {request}");
            assert!(request.contains("Acme"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert!(h.store.get(&invoice.closure_key()).unwrap().is_none());
    assert_eq!(h.lifecycle.state(&invoice).unwrap(), ClosureState::None);

    // The in-flight reservation was released; a retry reaches the provider.
    let _ = h.lifecycle.close_invoice(&invoice).await;
    assert_eq!(h.issuance.issues.load(Ordering::SeqCst), 2);
}

// === Scenario C: cancellation preconditions ===

#[tokio::test]
async fn cancel_without_a_slip_id_fails_before_any_network_call() {
    let h = harness(IssueMode::Documents);
    let invoice = make_invoice("INV-1", InvoiceStatus::Closed);

    let result = h.lifecycle.cancel_closure(&invoice).await;
    assert_eq!(result, Err(ClosureError::MissingBoletoId));
    assert_eq!(h.issuance.cancels.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancel_removes_the_record_everywhere() {
    let h = harness(IssueMode::Documents);
    let invoice = make_invoice("INV-1", InvoiceStatus::Pending);
    h.lifecycle.close_invoice(&invoice).await.unwrap();

    h.lifecycle.cancel_closure(&invoice).await.unwrap();
    assert_eq!(h.issuance.cancels.load(Ordering::SeqCst), 1);
    assert!(h.store.get(&invoice.closure_key()).unwrap().is_none());
    assert!(h.durable.is_empty());
}

#[tokio::test]
async fn cancel_clears_fast_tiers_even_when_the_remote_delete_fails() {
    // Close writes locally (remote write warns), cancel must still clear
    // the fast tiers despite the partitioned remote.
    let h = harness_with_remote(IssueMode::Documents, Arc::new(PartitionedRemote));
    let invoice = make_invoice("INV-1", InvoiceStatus::Pending);

    let closed = h.lifecycle.close_invoice(&invoice).await.unwrap();
    assert!(closed.warning.is_some());

    h.lifecycle.cancel_closure(&invoice).await.unwrap();
    assert!(h.store.get(&invoice.closure_key()).unwrap().is_none());
    assert!(h.durable.is_empty());
}

#[tokio::test]
async fn rejected_cancellation_keeps_the_record_for_retry() {
    let durable = Arc::new(InMemoryDurableStore::new());
    let store = Arc::new(TieredStore::new(
        durable.clone(),
        Arc::new(InMemoryRemoteStore::new()),
    ));
    let issuance = Arc::new(MockIssuance {
        mode: IssueMode::Documents,
        fail_cancel: true,
        issues: AtomicUsize::new(0),
        cancels: AtomicUsize::new(0),
    });
    let recovery = Arc::new(CountingRecovery::new());
    let lifecycle =
        BoletoLifecycle::new(store.clone(), issuance.clone(), recovery.clone(), recovery);

    let invoice = make_invoice("INV-1", InvoiceStatus::Pending);
    lifecycle.close_invoice(&invoice).await.unwrap();

    let err = lifecycle.cancel_closure(&invoice).await.unwrap_err();
    assert!(err.to_string().contains("slip already settled"));

    // Still cancelable later.
    assert!(store.get(&invoice.closure_key()).unwrap().is_some());
}

// === Scenario D: remote partition between two close calls ===

#[tokio::test]
async fn second_close_survives_a_remote_partition_via_the_durable_tier() {
    let durable = Arc::new(InMemoryDurableStore::new());
    let healthy_remote = Arc::new(InMemoryRemoteStore::new());

    // First session: close with a healthy remote.
    let store = Arc::new(TieredStore::new(durable.clone(), healthy_remote));
    let issuance = Arc::new(MockIssuance::new(IssueMode::Documents));
    let recovery = Arc::new(CountingRecovery::new());
    let lifecycle = BoletoLifecycle::new(store, issuance.clone(), recovery.clone(), recovery);
    let invoice = make_invoice("INV-1", InvoiceStatus::Pending);
    let first = lifecycle.close_invoice(&invoice).await.unwrap();

    // Second session on the same device: remote partitioned, memory cold.
    let store = Arc::new(TieredStore::new(durable, Arc::new(PartitionedRemote)));
    let issuance2 = Arc::new(MockIssuance::new(IssueMode::Documents));
    let recovery2 = Arc::new(CountingRecovery::new());
    let lifecycle2 =
        BoletoLifecycle::new(store, issuance2.clone(), recovery2.clone(), recovery2);

    let second = lifecycle2.close_invoice(&invoice).await.unwrap();
    assert_eq!(second.record.boleto_id, first.record.boleto_id);
    assert_eq!(second.record.boleto_pdf, first.record.boleto_pdf);
    assert_eq!(issuance2.issues.load(Ordering::SeqCst), 0);
}

// === Viewing ===

#[tokio::test]
async fn view_on_a_never_closed_invoice_is_a_validation_error() {
    let h = harness(IssueMode::Documents);
    let invoice = make_invoice("INV-1", InvoiceStatus::Pending);

    let result = h.lifecycle.view_closure(&invoice).await;
    assert!(matches!(result, Err(ClosureError::NotClosed)));
    assert_eq!(h.issuance.issues.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn view_never_issues_even_when_recovery_comes_up_empty() {
    let h = harness(IssueMode::Documents);
    // Status says a slip exists, but no tier has a record and recovery
    // backends are down: a partial record comes back, never a new slip.
    let invoice = make_invoice("INV-1", InvoiceStatus::Closed);

    let viewed = h.lifecycle.view_closure(&invoice).await.unwrap();
    assert!(viewed.soft_error.is_some());
    assert!(viewed.record.boleto_pdf.is_none());
    assert_eq!(h.issuance.issues.load(Ordering::SeqCst), 0);
}

// === State reporting ===

#[tokio::test]
async fn state_follows_the_record() {
    let h = harness(IssueMode::Documents);
    let invoice = make_invoice("INV-1", InvoiceStatus::Pending);

    assert_eq!(h.lifecycle.state(&invoice).unwrap(), ClosureState::None);
    h.lifecycle.close_invoice(&invoice).await.unwrap();
    assert_eq!(h.lifecycle.state(&invoice).unwrap(), ClosureState::Cached);

    let canceled = make_invoice("INV-2", InvoiceStatus::Canceled);
    assert_eq!(h.lifecycle.state(&canceled).unwrap(), ClosureState::Canceled);
}

// === Bulk registration ===

fn bulk_entry(invoice: &str, boleto: &str) -> OutOfBandClosure {
    OutOfBandClosure {
        invoice_id: InvoiceId::from(invoice),
        sub_invoice_id: None,
        client_name: "Acme".to_string(),
        document_number: "12345678901".to_string(),
        boleto_id: BoletoId::from(boleto),
        created_at: None,
    }
}

#[tokio::test]
async fn register_bulk_creates_documentless_records() {
    let h = harness(IssueMode::Documents);
    let entries = vec![bulk_entry("INV-1", "99001"), bulk_entry("INV-2", "99002")];

    let report = h.lifecycle.register_bulk(&entries, &CancelFlag::new()).await;
    assert_eq!(report.registered, 2);
    assert_eq!(report.failed, 0);
    assert!(!report.canceled);

    let record = h
        .store
        .get(&ClosureKey::parent(InvoiceId::from("INV-1")))
        .unwrap()
        .unwrap();
    assert_eq!(record.boleto_id, Some(BoletoId::from("99001")));
    assert!(record.boleto_pdf.is_none());
    assert_eq!(record.state(), ClosureState::Issued);
}

#[tokio::test]
async fn register_bulk_reports_per_item_failures_without_aborting() {
    /// Durable tier that refuses one specific invoice.
    struct GrudgingDurable {
        inner: InMemoryDurableStore,
    }
    impl DurableStore for GrudgingDurable {
        fn read(&self, key: &str) -> Result<Option<String>, ClosureError> {
            self.inner.read(key)
        }
        fn write(&self, key: &str, value: &str) -> Result<(), ClosureError> {
            if key.contains("INV-BAD") {
                return Err(ClosureError::DurableTier("quota exceeded".to_string()));
            }
            self.inner.write(key, value)
        }
        fn remove(&self, key: &str) -> Result<(), ClosureError> {
            self.inner.remove(key)
        }
    }

    let store = Arc::new(TieredStore::new(
        Arc::new(GrudgingDurable {
            inner: InMemoryDurableStore::new(),
        }),
        Arc::new(InMemoryRemoteStore::new()),
    ));
    let issuance = Arc::new(MockIssuance::new(IssueMode::Documents));
    let recovery = Arc::new(CountingRecovery::new());
    let lifecycle = BoletoLifecycle::new(store, issuance, recovery.clone(), recovery);

    let entries = vec![
        bulk_entry("INV-1", "99001"),
        bulk_entry("INV-BAD", "99002"),
        bulk_entry("INV-3", "99003"),
    ];
    let report = lifecycle.register_bulk(&entries, &CancelFlag::new()).await;

    assert_eq!(report.registered, 2);
    assert_eq!(report.failed, 1);
    let failed: Vec<_> = report
        .outcomes
        .iter()
        .filter(|(_, outcome)| outcome.is_err())
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0.invoice_id, InvoiceId::from("INV-BAD"));
}

#[tokio::test]
async fn register_bulk_stops_at_the_cancel_flag() {
    let h = harness(IssueMode::Documents);
    let cancel = CancelFlag::new();
    cancel.cancel();

    let entries = vec![bulk_entry("INV-1", "99001"), bulk_entry("INV-2", "99002")];
    let report = h.lifecycle.register_bulk(&entries, &cancel).await;

    assert!(report.canceled);
    assert_eq!(report.registered, 0);
    assert!(report.outcomes.is_empty());
}

#[tokio::test]
async fn register_bulk_leaves_existing_records_unchanged() {
    let h = harness(IssueMode::Documents);
    let invoice = make_invoice("INV-1", InvoiceStatus::Pending);
    let closed = h.lifecycle.close_invoice(&invoice).await.unwrap();

    let report = h
        .lifecycle
        .register_bulk(&[bulk_entry("INV-1", "DIFFERENT")], &CancelFlag::new())
        .await;
    assert_eq!(report.registered, 1);

    let record = h.store.get(&invoice.closure_key()).unwrap().unwrap();
    assert_eq!(record.boleto_id, closed.record.boleto_id);
    assert_eq!(record.boleto_pdf, closed.record.boleto_pdf);
}
