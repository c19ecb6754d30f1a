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

//! Realtime payment event propagation.
//!
//! The change feed delivers two logical streams: settlement updates on
//! invoices and recorded credit transactions. Each stream lands in its own
//! lock-free queue, so ordering holds within a stream and is deliberately
//! not guaranteed across the two. `dispatch_pending` runs on the session
//! worker and invokes every observer synchronously, one callback per event.
//!
//! The listener never touches the record store: a settlement changes the
//! invoice's payment status, not the validity of an already-cached closure
//! document.

use crate::base::InvoiceId;
use crate::invoice::InvoiceStatus;
use crossbeam::queue::SegQueue;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// One change-feed subscription: table + event type + column predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedFilter {
    pub table: &'static str,
    pub event: &'static str,
    pub column: &'static str,
    pub value: &'static str,
}

/// Rows updated to paid on the invoices table.
pub const SETTLEMENT_FILTER: FeedFilter = FeedFilter {
    table: "invoices",
    event: "UPDATE",
    column: "status",
    value: "paid",
};

/// Rows inserted on the credit transactions table.
pub const CREDIT_FILTER: FeedFilter = FeedFilter {
    table: "credit_transactions",
    event: "INSERT",
    column: "kind",
    value: "credit",
};

/// Changed invoice row delivered by the feed.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InvoiceRow {
    pub invoice_id: InvoiceId,
    pub status: InvoiceStatus,
    pub amount: Decimal,
}

/// Recorded credit transaction delivered by the feed.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CreditRow {
    #[serde(default)]
    pub invoice_id: Option<InvoiceId>,
    pub amount: Decimal,
}

/// A payload from either stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    PaymentSettled(InvoiceRow),
    CreditRecorded(CreditRow),
}

/// Domain notification emitted to observers on settlement.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementNotice {
    pub invoice_id: InvoiceId,
    pub new_status: InvoiceStatus,
}

/// List-level query results the dashboard holds; invalidated on settlement
/// so the next render refetches.
pub trait QueryCache: Send + Sync {
    fn invalidate_invoice_lists(&self);
}

type SettlementObserver = Box<dyn Fn(&SettlementNotice) + Send + Sync>;
type CreditObserver = Box<dyn Fn(&CreditRow) + Send + Sync>;

/// Buffers feed events and fans them out to registered observers.
#[derive(Default)]
pub struct PaymentEventListener {
    settlements: SegQueue<InvoiceRow>,
    credits: SegQueue<CreditRow>,
    settlement_observers: RwLock<Vec<SettlementObserver>>,
    credit_observers: RwLock<Vec<CreditObserver>>,
    query_cache: Option<Arc<dyn QueryCache>>,
}

impl PaymentEventListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query_cache(query_cache: Arc<dyn QueryCache>) -> Self {
        Self {
            query_cache: Some(query_cache),
            ..Self::default()
        }
    }

    /// The two subscriptions the feed driver must register.
    pub fn filters() -> [FeedFilter; 2] {
        [SETTLEMENT_FILTER, CREDIT_FILTER]
    }

    /// Registers a settlement observer. Observers run synchronously on the
    /// dispatching thread, one call per event; keep them short (toast,
    /// audio cue).
    pub fn observe_settlements(
        &self,
        observer: impl Fn(&SettlementNotice) + Send + Sync + 'static,
    ) {
        self.settlement_observers.write().push(Box::new(observer));
    }

    pub fn observe_credits(&self, observer: impl Fn(&CreditRow) + Send + Sync + 'static) {
        self.credit_observers.write().push(Box::new(observer));
    }

    /// Enqueues a feed payload. Lock-free; safe to call from the feed's
    /// delivery thread while the session worker dispatches.
    pub fn push(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::PaymentSettled(row) => self.settlements.push(row),
            ChangeEvent::CreditRecorded(row) => self.credits.push(row),
        }
    }

    /// Drains both stream buffers, invoking observers synchronously per
    /// event. Returns the number of events dispatched.
    pub fn dispatch_pending(&self) -> usize {
        let mut dispatched = 0;

        while let Some(row) = self.settlements.pop() {
            dispatched += 1;
            debug!(invoice = %row.invoice_id, "payment settled");

            if let Some(cache) = &self.query_cache {
                cache.invalidate_invoice_lists();
            }

            let notice = SettlementNotice {
                invoice_id: row.invoice_id.clone(),
                new_status: InvoiceStatus::Paid,
            };
            for observer in self.settlement_observers.read().iter() {
                observer(&notice);
            }
        }

        while let Some(row) = self.credits.pop() {
            dispatched += 1;
            for observer in self.credit_observers.read().iter() {
                observer(&row);
            }
        }

        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settled(invoice: &str) -> ChangeEvent {
        ChangeEvent::PaymentSettled(InvoiceRow {
            invoice_id: InvoiceId::from(invoice),
            status: InvoiceStatus::Paid,
            amount: dec!(100.00),
        })
    }

    #[test]
    fn settlement_reaches_observers_with_paid_status() {
        let listener = PaymentEventListener::new();
        let seen: Arc<Mutex<Vec<SettlementNotice>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        listener.observe_settlements(move |notice| sink.lock().unwrap().push(notice.clone()));

        listener.push(settled("INV-1"));
        listener.push(settled("INV-2"));
        assert_eq!(listener.dispatch_pending(), 2);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].invoice_id, InvoiceId::from("INV-1"));
        assert_eq!(seen[0].new_status, InvoiceStatus::Paid);
        assert_eq!(seen[1].invoice_id, InvoiceId::from("INV-2"));
    }

    #[test]
    fn settlement_invalidates_query_cache_once_per_event() {
        struct CountingCache(AtomicUsize);
        impl QueryCache for CountingCache {
            fn invalidate_invoice_lists(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let cache = Arc::new(CountingCache(AtomicUsize::new(0)));
        let listener = PaymentEventListener::with_query_cache(cache.clone());

        listener.push(settled("INV-1"));
        listener.push(settled("INV-2"));
        listener.dispatch_pending();

        assert_eq!(cache.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn credit_events_go_to_credit_observers_only() {
        let listener = PaymentEventListener::new();
        let settlements = Arc::new(AtomicUsize::new(0));
        let credits = Arc::new(AtomicUsize::new(0));

        let s = settlements.clone();
        listener.observe_settlements(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let c = credits.clone();
        listener.observe_credits(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        listener.push(ChangeEvent::CreditRecorded(CreditRow {
            invoice_id: None,
            amount: dec!(25.00),
        }));
        assert_eq!(listener.dispatch_pending(), 1);

        assert_eq!(settlements.load(Ordering::SeqCst), 0);
        assert_eq!(credits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_with_no_pending_events_is_a_no_op() {
        let listener = PaymentEventListener::new();
        assert_eq!(listener.dispatch_pending(), 0);
    }

    #[test]
    fn pushes_from_another_thread_are_dispatched() {
        let listener = Arc::new(PaymentEventListener::new());
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        listener.observe_settlements(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let feed = listener.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..10 {
                feed.push(settled(&format!("INV-{i}")));
            }
        });
        handle.join().unwrap();

        assert_eq!(listener.dispatch_pending(), 10);
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn filters_cover_both_streams() {
        let [settlement, credit] = PaymentEventListener::filters();
        assert_eq!(settlement.table, "invoices");
        assert_eq!(settlement.value, "paid");
        assert_eq!(credit.table, "credit_transactions");
        assert_eq!(credit.event, "INSERT");
    }
}
