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

use async_trait::async_trait;
use chrono::DateTime;
use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use fechamento_rs::{
    BoletoId, BoletoLifecycle, BulkReport, CancelFlag, CancellationRequest, ClosureError,
    InMemoryDurableStore, InMemoryRemoteStore, InvoiceId, InvoiceRenderer, IssuanceApi,
    IssuanceRequest, IssuanceResponse, OutOfBandClosure, ProviderCall, SlipDocument, SlipProvider,
    SlipQuery, SubInvoiceId, TieredStore,
};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// Closure Registration - Register out-of-band closures from a CSV file
///
/// Reads closures issued in another environment and registers them in the
/// local tiers, slip ids known, documents to be recovered lazily. Writes a
/// per-item report to stdout.
#[derive(Parser, Debug)]
#[command(name = "fechamento-rs")]
#[command(about = "Registers out-of-band invoice closures from a CSV", long_about = None)]
struct Args {
    /// Path to CSV file with closures
    ///
    /// Expected format: invoice,sub_invoice,client,document,boleto_id,closed_at
    /// Example: cargo run -- closures.csv > report.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let entries = match read_closures(BufReader::new(file)) {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("Error reading closures: {}", e);
            process::exit(1);
        }
    };

    let lifecycle = offline_lifecycle();
    let cancel = CancelFlag::new();
    let report = lifecycle.register_bulk(&entries, &cancel).await;

    if let Err(e) = write_report(&report, std::io::stdout()) {
        eprintln!("Error writing report: {}", e);
        process::exit(1);
    }
    eprintln!(
        "registered {}, failed {}",
        report.registered, report.failed
    );
}

/// Registration runs against local tiers only; provider calls fail fast.
struct OfflineProvider;

#[async_trait]
impl IssuanceApi for OfflineProvider {
    async fn issue(&self, _request: &IssuanceRequest) -> Result<IssuanceResponse, ClosureError> {
        Err(ClosureError::provider(
            ProviderCall::Issuance,
            "issuance is not available in offline registration mode",
        ))
    }

    async fn cancel(&self, _request: &CancellationRequest) -> Result<(), ClosureError> {
        Err(ClosureError::provider(
            ProviderCall::Cancellation,
            "cancellation is not available in offline registration mode",
        ))
    }
}

#[async_trait]
impl SlipProvider for OfflineProvider {
    async fn fetch_slip(&self, _query: &SlipQuery) -> Result<SlipDocument, ClosureError> {
        Err(ClosureError::provider(
            ProviderCall::SlipRetrieval,
            "slip retrieval is not available in offline registration mode",
        ))
    }
}

#[async_trait]
impl InvoiceRenderer for OfflineProvider {
    async fn render_invoice(
        &self,
        _invoice_id: &InvoiceId,
        _code: &str,
    ) -> Result<Vec<u8>, ClosureError> {
        Err(ClosureError::provider(
            ProviderCall::InvoiceRender,
            "invoice rendering is not available in offline registration mode",
        ))
    }
}

fn offline_lifecycle() -> BoletoLifecycle {
    let store = Arc::new(TieredStore::new(
        Arc::new(InMemoryDurableStore::new()),
        Arc::new(InMemoryRemoteStore::new()),
    ));
    let provider = Arc::new(OfflineProvider);
    BoletoLifecycle::new(store, provider.clone(), provider.clone(), provider)
}

/// Raw CSV record matching the input format.
///
/// Fields: `invoice, sub_invoice, client, document, boleto_id, closed_at`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    invoice: String,
    #[serde(default)]
    sub_invoice: Option<String>,
    client: String,
    #[serde(default)]
    document: Option<String>,
    boleto_id: String,
    #[serde(default)]
    closed_at: Option<String>,
}

impl CsvRecord {
    /// Converts a CSV record to an out-of-band closure.
    ///
    /// Returns `None` when the invoice or slip id is missing; a closure
    /// without a slip id cannot be recovered later and is not registrable.
    fn into_entry(self) -> Option<OutOfBandClosure> {
        if self.invoice.is_empty() || self.boleto_id.is_empty() {
            return None;
        }
        let created_at = self
            .closed_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.to_utc());
        Some(OutOfBandClosure {
            invoice_id: InvoiceId(self.invoice),
            sub_invoice_id: self
                .sub_invoice
                .filter(|s| !s.is_empty())
                .map(SubInvoiceId),
            client_name: self.client,
            document_number: self.document.unwrap_or_default(),
            boleto_id: BoletoId(self.boleto_id),
            created_at,
        })
    }
}

/// Reads closures from a CSV reader.
///
/// Streaming parse; malformed rows and rows without a slip id are skipped
/// silently, matching how the transaction importer treats bad input.
///
/// # Errors
///
/// Returns a CSV error if the reader fails or the CSV structure is invalid.
fn read_closures<R: Read>(reader: R) -> Result<Vec<OutOfBandClosure>, csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    let mut entries = Vec::new();
    for result in rdr.deserialize::<CsvRecord>() {
        match result {
            Ok(record) => {
                let Some(entry) = record.into_entry() else {
                    #[cfg(debug_assertions)]
                    eprintln!("Skipping closure row without invoice or slip id");
                    continue;
                };
                entries.push(entry);
            }
            Err(e) => {
                #[cfg(debug_assertions)]
                eprintln!("Skipping malformed row: {}", e);
                continue;
            }
        }
    }

    Ok(entries)
}

/// Writes the per-item report as CSV.
///
/// # CSV Format
///
/// Columns: `invoice, sub_invoice, status, detail`
fn write_report<W: Write>(report: &BulkReport, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    wtr.write_record(["invoice", "sub_invoice", "status", "detail"])?;

    for (key, outcome) in &report.outcomes {
        let sub = key
            .sub_invoice_id
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_default();
        match outcome {
            Ok(()) => wtr.write_record([key.invoice_id.0.as_str(), &sub, "registered", ""])?,
            Err(e) => {
                wtr.write_record([key.invoice_id.0.as_str(), &sub, "failed", &e.to_string()])?
            }
        }
    }

    wtr.flush()?;
    Ok(())
}
