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

//! Manifest header patching.
//!
//! The carrier manifest is generated by an external service that does not
//! know the final sender identity or the per-run totals. This module stamps
//! them in after the fact: an opaque rectangle erases the generated header
//! region on the first page, then the corrected fields are drawn over it.
//!
//! The patch is an incremental PDF update in the same style the slip
//! documents are produced upstream: existing bytes are never rewritten,
//! new objects and a cross-reference section are appended. On any parse or
//! render failure the original bytes are returned unchanged; a manifest
//! with the generated header is still printable, and patching must never
//! block the surrounding action.

use crate::error::ClosureError;
use crate::pdf::{
    self, ObjSpan, dict_value_span, find, is_page_object, last_startxref, next_object_number,
    parse_ref, scan_objects, trailer_root,
};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Header fields computed after manifest generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestHeader {
    pub sender_name: String,
    pub sender_document: String,
    pub address_line: String,
    pub manifest_id: String,
    pub generated_at: DateTime<Utc>,
    pub total_items: u32,
    /// Item counts per service type, drawn right-aligned in the header band.
    pub totals_by_service: Vec<(String, u32)>,
}

const MARGIN: f64 = 36.0;
const BOX_TOP_GAP: f64 = 18.0;
const BOX_HEIGHT: f64 = 118.0;
const LEADING: f64 = 12.0;
const NAME_SIZE: f64 = 10.0;
const TEXT_SIZE: f64 = 9.0;
/// Fixed wrap width for the address, in characters per line.
const ADDRESS_WRAP_COLS: usize = 48;
const FONT_REGULAR: &str = "Fmh";
const FONT_BOLD: &str = "FmhB";
const A4: [f64; 4] = [0.0, 0.0, 595.28, 841.89];

/// Stamps the header onto the first page of a manifest document.
///
/// Infallible by contract: any failure degrades to the original bytes and
/// is logged only.
pub fn patch_manifest_header(data: &[u8], header: &ManifestHeader) -> Vec<u8> {
    match try_patch(data, header) {
        Ok(patched) => patched,
        Err(e) => {
            warn!(manifest = %header.manifest_id, error = %e, "header patch failed, keeping manifest as generated");
            data.to_vec()
        }
    }
}

fn try_patch(data: &[u8], header: &ManifestHeader) -> Result<Vec<u8>, ClosureError> {
    if !data.starts_with(b"%PDF-") {
        return Err(ClosureError::PdfMalformed("missing %PDF header".into()));
    }
    let objects = scan_objects(data);
    let page_number = objects
        .iter()
        .find(|o| is_page_object(&data[o.body.clone()]))
        .map(|o| o.number)
        .ok_or_else(|| ClosureError::PdfMalformed("no page object".into()))?;
    // A previously patched manifest carries revisions of the page object;
    // the newest one is authoritative and already references the earlier
    // header streams.
    let page = objects
        .iter()
        .rfind(|o| o.number == page_number)
        .ok_or_else(|| ClosureError::PdfMalformed("no page object".into()))?;
    let prev_startxref = last_startxref(data)
        .ok_or_else(|| ClosureError::PdfMalformed("no startxref".into()))?;
    let root = trailer_root(data)
        .ok_or_else(|| ClosureError::PdfMalformed("no /Root in trailer".into()))?;

    let next = next_object_number(&objects);
    let stream_obj = next;
    let font_obj = next + 1;
    let bold_obj = next + 2;

    let media = media_box(data, &objects, page);
    let content = render_header_stream(header, &media);

    // Revised first page: our stream appended to /Contents, our fonts
    // spliced into /Resources.
    let page_body = &data[page.body.clone()];
    let with_contents = set_contents(page_body, stream_obj)?;
    let (revised_page, resources_revision) =
        set_resources(data, &with_contents, &objects, font_obj, bold_obj)?;

    let mut out = data.to_vec();
    if out.last() != Some(&b'\n') {
        out.push(b'\n');
    }

    let mut entries: Vec<(usize, usize)> = Vec::new();

    entries.push((page.number, out.len()));
    out.extend_from_slice(format!("{} 0 obj", page.number).as_bytes());
    out.extend_from_slice(&revised_page);
    out.extend_from_slice(b"endobj\n");

    if let Some((number, body)) = resources_revision {
        entries.push((number, out.len()));
        out.extend_from_slice(format!("{number} 0 obj").as_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(b"endobj\n");
    }

    entries.push((stream_obj, out.len()));
    out.extend_from_slice(
        format!("{} 0 obj\n<< /Length {} >>\nstream\n", stream_obj, content.len()).as_bytes(),
    );
    out.extend_from_slice(&content);
    out.extend_from_slice(b"\nendstream\nendobj\n");

    entries.push((font_obj, out.len()));
    out.extend_from_slice(
        format!(
            "{font_obj} 0 obj\n<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>\nendobj\n"
        )
        .as_bytes(),
    );
    entries.push((bold_obj, out.len()));
    out.extend_from_slice(
        format!(
            "{bold_obj} 0 obj\n<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica-Bold /Encoding /WinAnsiEncoding >>\nendobj\n"
        )
        .as_bytes(),
    );

    // Cross-reference section for the update, one subsection per run of
    // consecutive object numbers.
    entries.sort_by_key(|(number, _)| *number);
    let xref_at = out.len();
    out.extend_from_slice(b"xref\n");
    let mut i = 0;
    while i < entries.len() {
        let mut j = i;
        while j + 1 < entries.len() && entries[j + 1].0 == entries[j].0 + 1 {
            j += 1;
        }
        out.extend_from_slice(format!("{} {}\n", entries[i].0, j - i + 1).as_bytes());
        for (_, offset) in &entries[i..=j] {
            out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
        }
        i = j + 1;
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root {} 0 R /Prev {} >>\nstartxref\n{}\n%%EOF\n",
            bold_obj + 1,
            root,
            prev_startxref,
            xref_at
        )
        .as_bytes(),
    );

    debug!(manifest = %header.manifest_id, bytes = out.len(), "manifest header patched");
    Ok(out)
}

/// Appends the new content stream to the page's `/Contents`.
fn set_contents(page_body: &[u8], stream_obj: usize) -> Result<Vec<u8>, ClosureError> {
    let addition = format!("{stream_obj} 0 R");
    match dict_value_span(page_body, b"/Contents") {
        Some(span) => {
            let value = &page_body[span.clone()];
            let replacement = if value.starts_with(b"[") {
                let inner = String::from_utf8_lossy(&value[1..value.len() - 1]);
                format!("[{} {addition}]", inner.trim())
            } else if parse_ref(value).is_some() {
                format!("[{} {addition}]", String::from_utf8_lossy(value))
            } else {
                return Err(ClosureError::PdfMalformed(
                    "unsupported /Contents value".into(),
                ));
            };
            Ok(splice(page_body, span, replacement.as_bytes()))
        }
        None => insert_after_dict_open(page_body, format!("/Contents [{addition}] ").as_bytes()),
    }
}

/// Splices the header fonts into the page's `/Resources`, revising the
/// resources object itself when it is indirect.
fn set_resources(
    data: &[u8],
    page_body: &[u8],
    objects: &[ObjSpan],
    font_obj: usize,
    bold_obj: usize,
) -> Result<(Vec<u8>, Option<(usize, Vec<u8>)>), ClosureError> {
    let font_entries = format!("/{FONT_REGULAR} {font_obj} 0 R /{FONT_BOLD} {bold_obj} 0 R");
    match dict_value_span(page_body, b"/Resources") {
        None => {
            let patched = insert_after_dict_open(
                page_body,
                format!("/Resources << /Font << {font_entries} >> >> ").as_bytes(),
            )?;
            Ok((patched, None))
        }
        Some(span) => {
            let value = &page_body[span.clone()];
            if value.starts_with(b"<<") {
                let augmented = augment_fonts(value, &font_entries)?;
                Ok((splice(page_body, span, &augmented), None))
            } else if let Some((number, _)) = parse_ref(value) {
                // Indirect resources: the page body stays as-is and the
                // resources object gets a revision of its own.
                let target = objects
                    .iter()
                    .find(|o| o.number == number)
                    .ok_or_else(|| {
                        ClosureError::PdfMalformed(format!("resources object {number} not found"))
                    })?;
                let augmented = augment_fonts(&data[target.body.clone()], &font_entries)?;
                Ok((page_body.to_vec(), Some((number, augmented))))
            } else {
                Err(ClosureError::PdfMalformed(
                    "unsupported /Resources value".into(),
                ))
            }
        }
    }
}

/// Adds the header font entries to a resources dictionary.
fn augment_fonts(dict: &[u8], font_entries: &str) -> Result<Vec<u8>, ClosureError> {
    match dict_value_span(dict, b"/Font") {
        Some(span) => {
            let value = &dict[span.clone()];
            if value.starts_with(b"<<") {
                let mut augmented = value[..2].to_vec();
                augmented.extend_from_slice(format!(" {font_entries}").as_bytes());
                augmented.extend_from_slice(&value[2..]);
                Ok(splice(dict, span, &augmented))
            } else {
                // An indirect font dictionary would need yet another object
                // revision; bail out and keep the original manifest.
                Err(ClosureError::PdfMalformed(
                    "font dictionary is indirect".into(),
                ))
            }
        }
        None => insert_after_dict_open(dict, format!("/Font << {font_entries} >> ").as_bytes()),
    }
}

fn splice(body: &[u8], span: std::ops::Range<usize>, replacement: &[u8]) -> Vec<u8> {
    let mut out = body[..span.start].to_vec();
    out.extend_from_slice(replacement);
    out.extend_from_slice(&body[span.end..]);
    out
}

fn insert_after_dict_open(body: &[u8], insertion: &[u8]) -> Result<Vec<u8>, ClosureError> {
    let open = find(body, b"<<")
        .ok_or_else(|| ClosureError::PdfMalformed("page object is not a dictionary".into()))?;
    let mut out = body[..open + 2].to_vec();
    out.push(b' ');
    out.extend_from_slice(insertion);
    out.extend_from_slice(&body[open + 2..]);
    Ok(out)
}

/// `/MediaBox` of the page, walking the `/Parent` chain when inherited.
fn media_box(data: &[u8], objects: &[ObjSpan], page: &ObjSpan) -> [f64; 4] {
    let mut body = &data[page.body.clone()];
    for _ in 0..8 {
        if let Some(value) = pdf::dict_raw_value(body, b"/MediaBox") {
            if let Some(parsed) = parse_media_array(value) {
                return parsed;
            }
        }
        let Some(parent_value) = pdf::dict_raw_value(body, b"/Parent") else {
            break;
        };
        let Some((parent_number, _)) = parse_ref(parent_value) else {
            break;
        };
        let Some(parent) = objects.iter().find(|o| o.number == parent_number) else {
            break;
        };
        body = &data[parent.body.clone()];
    }
    A4
}

fn parse_media_array(value: &[u8]) -> Option<[f64; 4]> {
    let text = std::str::from_utf8(value).ok()?;
    let numbers: Vec<f64> = text
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split_ascii_whitespace()
        .filter_map(|t| t.parse().ok())
        .collect();
    match numbers.as_slice() {
        [a, b, c, d] => Some([*a, *b, *c, *d]),
        _ => None,
    }
}

/// Draws the erase rectangle and the header text lines.
///
/// Left column: bold sender name and document, then the address wrapped at
/// a fixed character width, then the manifest id and timestamp. Lines past
/// the box's vertical budget are dropped. Right column: numeric totals,
/// right-aligned in the same band.
fn render_header_stream(header: &ManifestHeader, media: &[f64; 4]) -> Vec<u8> {
    let left = media[0] + MARGIN;
    let right = media[2] - MARGIN;
    let box_top = media[3] - BOX_TOP_GAP;
    let box_bottom = box_top - BOX_HEIGHT;

    let mut ops = Vec::new();
    ops.extend_from_slice(b"q\n1 1 1 rg\n");
    ops.extend_from_slice(
        format!(
            "{:.2} {:.2} {:.2} {:.2} re\nf\nQ\n",
            left - 4.0,
            box_bottom,
            right - left + 8.0,
            BOX_HEIGHT
        )
        .as_bytes(),
    );

    let mut left_lines: Vec<(&str, f64, String)> = vec![
        (FONT_BOLD, NAME_SIZE, header.sender_name.clone()),
        (FONT_BOLD, TEXT_SIZE, header.sender_document.clone()),
    ];
    for line in wrap_fixed(&header.address_line, ADDRESS_WRAP_COLS) {
        left_lines.push((FONT_REGULAR, TEXT_SIZE, line));
    }
    left_lines.push((
        FONT_REGULAR,
        TEXT_SIZE,
        format!(
            "Manifesto {} de {}",
            header.manifest_id,
            header.generated_at.format("%d/%m/%Y %H:%M")
        ),
    ));

    let mut y = box_top - LEADING;
    let mut dropped = 0usize;
    for (font, size, text) in &left_lines {
        if y < box_bottom + 4.0 {
            dropped += 1;
            continue;
        }
        draw_text(&mut ops, font, *size, left, y, text);
        y -= LEADING;
    }
    if dropped > 0 {
        debug!(dropped, "header lines beyond the box budget were dropped");
    }

    let mut totals: Vec<String> = vec![format!("Total de itens: {}", header.total_items)];
    for (service, count) in &header.totals_by_service {
        totals.push(format!("{service}: {count}"));
    }

    let mut y = box_top - LEADING;
    for text in &totals {
        if y < box_bottom + 4.0 {
            break;
        }
        let x = right - approx_width(text, TEXT_SIZE);
        draw_text(&mut ops, FONT_REGULAR, TEXT_SIZE, x, y, text);
        y -= LEADING;
    }

    ops
}

fn draw_text(ops: &mut Vec<u8>, font: &str, size: f64, x: f64, y: f64, text: &str) {
    ops.extend_from_slice(
        format!("BT /{font} {size:.1} Tf 1 0 0 1 {x:.2} {y:.2} Tm (").as_bytes(),
    );
    ops.extend_from_slice(&escape_text(text));
    ops.extend_from_slice(b") Tj ET\n");
}

/// Approximate Helvetica line width; half the font size per character is
/// close enough for right-aligning short numeric lines.
fn approx_width(text: &str, size: f64) -> f64 {
    text.chars().count() as f64 * size * 0.5
}

/// Word-wraps to a fixed column width. A single word longer than the width
/// gets a line of its own.
fn wrap_fixed(text: &str, cols: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if current.is_empty() {
            current = word.to_string();
        } else if current.chars().count() + 1 + word.chars().count() <= cols {
            current.push(' ');
            current.push_str(word);
        } else {
            lines.push(std::mem::take(&mut current));
            current = word.to_string();
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Escapes a text line as a WinAnsi PDF string literal. Characters outside
/// Latin-1 are replaced.
fn escape_text(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '(' | ')' | '\\' => {
                out.push(b'\\');
                out.push(c as u8);
            }
            c if (c as u32) < 256 => out.push(c as u8),
            _ => out.push(b'?'),
        }
    }
    out
}
