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

//! PDF byte transport and merging.
//!
//! Providers exchange PDF payloads as base64 strings; this module decodes
//! and encodes them, and merges several documents into one for delivery
//! (invoice + slip in a single download). Documents are handled at the byte
//! level: objects are located by scanning for `N 0 obj` markers, the same
//! way the slip PDFs themselves are produced upstream.

use crate::error::ClosureError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

/// Encodes raw PDF bytes as a base64 string for transport.
pub fn encode_pdf(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decodes a base64 PDF payload.
///
/// Tolerates the `data:application/pdf;base64,` URI prefix and embedded
/// whitespace, both observed in provider responses.
pub fn decode_pdf(text: &str) -> Result<Vec<u8>, ClosureError> {
    let body = match text.split_once("base64,") {
        Some((_, rest)) => rest,
        None => text,
    };
    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| ClosureError::PdfDecode(e.to_string()))
}

/// Serde adapter for optional PDF byte fields, stored as base64 strings.
///
/// Used by the durable tier, whose values are JSON documents.
pub mod base64_opt {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text: Option<String> = Option::deserialize(deserializer)?;
        text.map(|s| STANDARD.decode(s.as_bytes()))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Byte-level document model
// ============================================================================

/// Span of one indirect object in a PDF byte buffer.
#[derive(Debug, Clone)]
pub(crate) struct ObjSpan {
    /// Object number (generation is always 0 in the documents we handle).
    pub number: usize,
    /// Byte range of the object body, between `N 0 obj` and `endobj`.
    pub body: std::ops::Range<usize>,
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Locates a `stream` keyword that is not the tail of `endstream`.
fn find_stream_start(data: &[u8], from: usize, until: usize) -> Option<usize> {
    let mut pos = from;
    while pos < until {
        let rel = find(&data[pos..until], b"stream")?;
        let at = pos + rel;
        if at < 3 || &data[at - 3..at] != b"end" {
            return Some(at);
        }
        pos = at + b"stream".len();
    }
    None
}

/// Scans a buffer for all `N 0 obj ... endobj` spans.
///
/// Stream payloads are skipped so that binary data containing `endobj`
/// does not truncate an object.
pub(crate) fn scan_objects(data: &[u8]) -> Vec<ObjSpan> {
    let marker = b" 0 obj";
    let mut spans = Vec::new();
    let mut pos = 0;

    while let Some(rel) = find(&data[pos..], marker) {
        let at = pos + rel;
        pos = at + marker.len();

        // Backtrack over the object number digits.
        let mut num_start = at;
        while num_start > 0 && data[num_start - 1].is_ascii_digit() {
            num_start -= 1;
        }
        if num_start == at {
            continue;
        }
        if num_start > 0 && !data[num_start - 1].is_ascii_whitespace() {
            continue;
        }
        let Ok(number) = std::str::from_utf8(&data[num_start..at])
            .unwrap_or("")
            .parse::<usize>()
        else {
            continue;
        };

        let body_start = at + marker.len();
        let mut cursor = body_start;
        let body_end = loop {
            let Some(endobj_rel) = find(&data[cursor..], b"endobj") else {
                break None;
            };
            let endobj_at = cursor + endobj_rel;
            match find_stream_start(data, cursor, endobj_at) {
                Some(stream_at) => {
                    let Some(endstream_rel) = find(&data[stream_at..], b"endstream") else {
                        break None;
                    };
                    cursor = stream_at + endstream_rel + b"endstream".len();
                }
                None => break Some(endobj_at),
            }
        };
        let Some(body_end) = body_end else { continue };

        spans.push(ObjSpan {
            number,
            body: body_start..body_end,
        });
        pos = body_end + b"endobj".len();
    }

    spans
}

/// Next free object number, one past the highest seen (the same rule the
/// upstream slip generator applies when appending incremental updates).
pub(crate) fn next_object_number(objects: &[ObjSpan]) -> usize {
    objects.iter().map(|o| o.number).max().unwrap_or(0) + 1
}

/// True when a name token occurs with a proper delimiter boundary, so
/// `/Page` does not match `/Pages`.
pub(crate) fn has_name(body: &[u8], name: &[u8]) -> bool {
    let mut pos = 0;
    while let Some(rel) = find(&body[pos..], name) {
        let at = pos + rel;
        let end = at + name.len();
        let bounded = end >= body.len()
            || body[end].is_ascii_whitespace()
            || matches!(body[end], b'/' | b'>' | b'[' | b']' | b'(' | b'<');
        if bounded {
            return true;
        }
        pos = end;
    }
    false
}

/// True for a `/Type /Page` dictionary (and not `/Type /Pages`).
pub(crate) fn is_page_object(body: &[u8]) -> bool {
    has_name(body, b"/Type") && has_name(body, b"/Page") && {
        // `/Page` and `/Pages` both pass `has_name(/Page)` scans only when
        // bounded, so a Pages node is already excluded; but a page may also
        // carry `/Pages` as a parent key. Require the exact `/Type /Page`
        // pairing somewhere in the dict.
        let mut pos = 0;
        loop {
            let Some(rel) = find(&body[pos..], b"/Type") else {
                return false;
            };
            let mut cursor = pos + rel + b"/Type".len();
            while cursor < body.len() && body[cursor].is_ascii_whitespace() {
                cursor += 1;
            }
            if body[cursor..].starts_with(b"/Page") {
                let end = cursor + b"/Page".len();
                let bounded = end >= body.len()
                    || body[end].is_ascii_whitespace()
                    || matches!(body[end], b'/' | b'>' | b'[' | b']');
                if bounded {
                    return true;
                }
            }
            pos = pos + rel + b"/Type".len();
        }
    }
}

/// Parses the last `startxref` offset in the buffer.
pub(crate) fn last_startxref(data: &[u8]) -> Option<usize> {
    let tail_start = data.len().saturating_sub(2048);
    let tail = &data[tail_start..];
    let mut pos = 0;
    let mut last = None;
    while let Some(rel) = find(&tail[pos..], b"startxref") {
        last = Some(pos + rel);
        pos += rel + b"startxref".len();
    }
    let at = tail_start + last?;
    let after = &data[at + b"startxref".len()..];
    let digits: Vec<u8> = after
        .iter()
        .copied()
        .skip_while(|b| b.is_ascii_whitespace())
        .take_while(|b| b.is_ascii_digit())
        .collect();
    std::str::from_utf8(&digits).ok()?.parse().ok()
}

/// Parses the catalog object number from the last `/Root N 0 R` entry.
pub(crate) fn trailer_root(data: &[u8]) -> Option<usize> {
    let mut pos = 0;
    let mut last = None;
    while let Some(rel) = find(&data[pos..], b"/Root") {
        last = Some(pos + rel);
        pos += rel + b"/Root".len();
    }
    let at = last? + b"/Root".len();
    parse_ref(&data[at..]).map(|(num, _)| num)
}

/// Parses `N G R` starting at the head of `data` (leading whitespace ok).
pub(crate) fn parse_ref(data: &[u8]) -> Option<(usize, usize)> {
    let mut pos = 0;
    while pos < data.len() && data[pos].is_ascii_whitespace() {
        pos += 1;
    }
    let num_start = pos;
    while pos < data.len() && data[pos].is_ascii_digit() {
        pos += 1;
    }
    if pos == num_start {
        return None;
    }
    let number: usize = std::str::from_utf8(&data[num_start..pos]).ok()?.parse().ok()?;
    while pos < data.len() && data[pos].is_ascii_whitespace() {
        pos += 1;
    }
    let gen_start = pos;
    while pos < data.len() && data[pos].is_ascii_digit() {
        pos += 1;
    }
    if pos == gen_start {
        return None;
    }
    while pos < data.len() && data[pos].is_ascii_whitespace() {
        pos += 1;
    }
    if pos < data.len() && data[pos] == b'R' {
        Some((number, pos + 1))
    } else {
        None
    }
}

/// Byte range of a dictionary key's value: an indirect reference, an array,
/// or an inline dictionary.
pub(crate) fn dict_value_span(body: &[u8], key: &[u8]) -> Option<std::ops::Range<usize>> {
    let mut pos = 0;
    let at = loop {
        let rel = find(&body[pos..], key)?;
        let at = pos + rel;
        let end = at + key.len();
        let bounded = end >= body.len()
            || body[end].is_ascii_whitespace()
            || matches!(body[end], b'[' | b'<' | b'/' | b'(');
        if bounded {
            break at;
        }
        pos = end;
    };
    let mut start = at + key.len();
    while start < body.len() && body[start].is_ascii_whitespace() {
        start += 1;
    }
    match body.get(start)? {
        b'[' => {
            let mut depth = 0usize;
            for (i, b) in body[start..].iter().enumerate() {
                match b {
                    b'[' => depth += 1,
                    b']' => {
                        depth -= 1;
                        if depth == 0 {
                            return Some(start..start + i + 1);
                        }
                    }
                    _ => {}
                }
            }
            None
        }
        b'<' if body.get(start + 1) == Some(&b'<') => {
            let mut depth = 0usize;
            let mut i = start;
            while i + 1 < body.len() {
                if &body[i..i + 2] == b"<<" {
                    depth += 1;
                    i += 2;
                } else if &body[i..i + 2] == b">>" {
                    depth -= 1;
                    i += 2;
                    if depth == 0 {
                        return Some(start..i);
                    }
                } else {
                    i += 1;
                }
            }
            None
        }
        _ => {
            let (_, consumed) = parse_ref(&body[start..])?;
            Some(start..start + consumed)
        }
    }
}

/// Extracts the raw value bytes of a dictionary key.
pub(crate) fn dict_raw_value<'a>(body: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
    dict_value_span(body, key).map(|span| &body[span])
}

/// Rewrites every `N G R` reference through `map`, leaving unmapped numbers
/// untouched. Stream payloads must not be passed through here.
fn rewrite_refs(body: &[u8], map: &std::collections::HashMap<usize, usize>) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        let at_boundary = i == 0
            || body[i - 1].is_ascii_whitespace()
            || matches!(body[i - 1], b'[' | b']' | b'(' | b'<' | b'>' | b'/');
        if b.is_ascii_digit() && at_boundary {
            if let Some((number, consumed)) = parse_ref(&body[i..]) {
                let mapped = map.get(&number).copied().unwrap_or(number);
                out.extend_from_slice(format!("{mapped} 0 R").as_bytes());
                i += consumed;
                continue;
            }
        }
        out.push(b);
        i += 1;
    }
    out
}

// ============================================================================
// Merge
// ============================================================================

const PDF_HEADER: &[u8] = b"%PDF-1.4\n%\xb5\xb5\xb5\xb5\n";

/// Counts `/Type /Page` objects in a document. Distinct object numbers
/// only: an incremental update re-emits a page object under its original
/// number without adding a page.
pub fn count_pages(data: &[u8]) -> Result<usize, ClosureError> {
    if !data.starts_with(b"%PDF-") {
        return Err(ClosureError::PdfMalformed("missing %PDF header".into()));
    }
    let pages: std::collections::BTreeSet<usize> = scan_objects(data)
        .iter()
        .filter(|o| is_page_object(&data[o.body.clone()]))
        .map(|o| o.number)
        .collect();
    Ok(pages.len())
}

/// Merges several PDF documents into one, in input order.
///
/// Every object of every input is imported and renumbered; page objects are
/// reparented under a fresh page tree. Original catalogs and page-tree nodes
/// are dropped. A single input is returned unchanged.
pub fn merge_pdfs(inputs: &[&[u8]]) -> Result<Vec<u8>, ClosureError> {
    if inputs.is_empty() {
        return Err(ClosureError::PdfMalformed("no documents to merge".into()));
    }
    if inputs.len() == 1 {
        return Ok(inputs[0].to_vec());
    }

    // First pass: scan every input, assign compact new numbers to the
    // objects we keep (everything except catalogs and page-tree nodes).
    let mut kept: Vec<(usize, Vec<u8>, bool)> = Vec::new(); // (new number, body, is_page)
    let mut next = 1usize;
    let mut page_numbers = Vec::new();

    for (index, data) in inputs.iter().enumerate() {
        if !data.starts_with(b"%PDF-") {
            return Err(ClosureError::PdfMalformed(format!(
                "document {index} has no %PDF header"
            )));
        }
        let objects = scan_objects(data);
        if objects.is_empty() {
            return Err(ClosureError::PdfMalformed(format!(
                "document {index} has no objects"
            )));
        }

        let mut map = std::collections::HashMap::new();
        let mut bodies = Vec::new();
        for obj in &objects {
            let body = &data[obj.body.clone()];
            let is_catalog = has_name(body, b"/Catalog");
            let is_tree_node = has_name(body, b"/Pages") && has_name(body, b"/Kids");
            if is_catalog || is_tree_node {
                continue;
            }
            map.insert(obj.number, next);
            bodies.push((next, obj.clone(), is_page_object(body)));
            next += 1;
        }

        for (new_number, obj, is_page) in bodies {
            let body = &data[obj.body.clone()];
            // References are rewritten outside stream payloads only.
            let rewritten = match find_stream_start(body, 0, body.len()) {
                Some(stream_at) => {
                    let endstream = find(&body[stream_at..], b"endstream").map(|r| stream_at + r);
                    match endstream {
                        Some(end) => {
                            let mut merged = rewrite_refs(&body[..stream_at], &map);
                            merged.extend_from_slice(&body[stream_at..end + b"endstream".len()]);
                            merged.extend(rewrite_refs(&body[end + b"endstream".len()..], &map));
                            merged
                        }
                        None => rewrite_refs(body, &map),
                    }
                }
                None => rewrite_refs(body, &map),
            };
            if is_page {
                page_numbers.push(new_number);
            }
            kept.push((new_number, rewritten, is_page));
        }
    }

    if page_numbers.is_empty() {
        return Err(ClosureError::PdfMalformed("merged inputs have no pages".into()));
    }

    let pages_number = next;
    let catalog_number = next + 1;

    // Reparent every page under the fresh tree.
    let parent_entry = format!("/Parent {pages_number} 0 R");
    for (_, body, is_page) in kept.iter_mut() {
        if !*is_page {
            continue;
        }
        let spliced = match find(body, b"/Parent") {
            Some(key_at) => {
                let value_at = key_at + b"/Parent".len();
                match parse_ref(&body[value_at..]) {
                    Some((_, consumed)) => {
                        let mut patched = body[..key_at].to_vec();
                        patched.extend_from_slice(parent_entry.as_bytes());
                        patched.extend_from_slice(&body[value_at + consumed..]);
                        Some(patched)
                    }
                    None => None,
                }
            }
            None => find(body, b"<<").map(|pos| {
                let mut patched = body[..pos + 2].to_vec();
                patched.extend_from_slice(format!(" {parent_entry} ").as_bytes());
                patched.extend_from_slice(&body[pos + 2..]);
                patched
            }),
        };
        if let Some(patched) = spliced {
            *body = patched;
        }
    }

    // Second pass: serialize with a fresh xref table and trailer.
    let mut out = PDF_HEADER.to_vec();
    let mut offsets = vec![0usize; catalog_number + 1];

    for (number, body, _) in &kept {
        offsets[*number] = out.len();
        out.extend_from_slice(format!("{number} 0 obj").as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"endobj\n");
    }

    offsets[pages_number] = out.len();
    let kids: Vec<String> = page_numbers.iter().map(|n| format!("{n} 0 R")).collect();
    out.extend_from_slice(
        format!(
            "{} 0 obj\n<< /Type /Pages /Count {} /Kids [{}] /MediaBox [0 0 595.28 841.89] >>\nendobj\n",
            pages_number,
            page_numbers.len(),
            kids.join(" ")
        )
        .as_bytes(),
    );

    offsets[catalog_number] = out.len();
    out.extend_from_slice(
        format!("{catalog_number} 0 obj\n<< /Type /Catalog /Pages {pages_number} 0 R >>\nendobj\n")
            .as_bytes(),
    );

    let xref_at = out.len();
    let size = catalog_number + 1;
    out.extend_from_slice(format!("xref\n0 {size}\n").as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for offset in offsets.iter().take(size).skip(1) {
        out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }
    out.extend_from_slice(
        format!("trailer\n<< /Size {size} /Root {catalog_number} 0 R >>\nstartxref\n{xref_at}\n%%EOF\n")
            .as_bytes(),
    );

    Ok(out)
}

/// Minimal well-formed single-page document for tests across the crate.
#[cfg(test)]
pub(crate) fn tiny_pdf(label: &str) -> Vec<u8> {
    let content = format!("BT /F1 12 Tf 50 700 Td ({label}) Tj ET");
    let mut out = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::new();

    let objects = [
        "1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n".to_string(),
        "2 0 obj\n<< /Type /Pages /Count 1 /Kids [3 0 R] /MediaBox [0 0 595 842] >>\nendobj\n"
            .to_string(),
        "3 0 obj\n<< /Type /Page /Parent 2 0 R /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >>\nendobj\n"
            .to_string(),
        format!(
            "4 0 obj\n<< /Length {} >>\nstream\n{}\nendstream\nendobj\n",
            content.len(),
            content
        ),
        "5 0 obj\n<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>\nendobj\n".to_string(),
    ];
    for obj in &objects {
        offsets.push(out.len());
        out.extend_from_slice(obj.as_bytes());
    }

    let xref_at = out.len();
    out.extend_from_slice(b"xref\n0 6\n0000000000 65535 f \n");
    for offset in &offsets {
        out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }
    out.extend_from_slice(
        format!("trailer\n<< /Size 6 /Root 1 0 R >>\nstartxref\n{xref_at}\n%%EOF\n").as_bytes(),
    );
    out
}
