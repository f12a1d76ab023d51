// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Multipart codec for complete-document fetches and uploads.
//!
//! A document fetched with `open_revs` arrives as `multipart/mixed`. Each
//! top-level part is either the document JSON directly (no attachments
//! changed on that revision) or a nested `multipart/related` body whose
//! JSON part is the document and whose `Content-Disposition: attachment`
//! parts are the attachment bytes with their original headers.
//!
//! ```text
//! multipart/mixed; boundary="A"
//! ├── application/json                      → document body
//! └── multipart/related; boundary="B"
//!     ├── (no Content-Disposition)          → document body
//!     ├── Content-Disposition: attachment; filename="a.bin"
//!     └── Content-Disposition: attachment; filename="b.txt"
//! ```
//!
//! Any other top-level content type is a decoding error.
//!
//! # Size Accounting
//!
//! The decoder tallies every raw byte passed through it; that tally is the
//! document's reported size and drives the big-document routing decision.
//!
//! # Upload Framing
//!
//! The encoder produces the inverse `multipart/related` body for a
//! single-document PUT: a fresh boundary, the document JSON first, then
//! one part per attachment carrying the attachment's original headers and
//! raw bytes. The body is materialized into a sized buffer because the
//! peer requires a Content-Length.

use crate::error::{ReplicationError, Result};
use serde_json::{Map, Value};

/// One multipart body part: its headers and raw bytes.
///
/// For attachment parts the headers carry at least a
/// `Content-Disposition: attachment; filename="…"` and usually a
/// `Content-Type` and `Content-Length`; all of them are preserved
/// verbatim for re-upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPart {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl AttachmentPart {
    /// Look up a header by name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The attachment filename from the `Content-Disposition` header.
    pub fn filename(&self) -> Option<&str> {
        let disposition = self.header("Content-Disposition")?;
        for param in disposition.split(';').skip(1) {
            if let Some((name, value)) = param.split_once('=') {
                if name.trim().eq_ignore_ascii_case("filename") {
                    return Some(value.trim().trim_matches('"'));
                }
            }
        }
        None
    }
}

/// A decoded complete-document response.
#[derive(Debug, Clone)]
pub struct DecodedDoc {
    /// The parsed document body, possibly including an `_attachments` map.
    pub body: Map<String, Value>,
    /// Attachment parts in wire order.
    pub attachments: Vec<AttachmentPart>,
    /// Raw bytes consumed while decoding.
    pub size: u64,
}

/// Extract the boundary parameter from a content type of the given kind
/// (e.g. `multipart/mixed; boundary="abc"`).
pub fn boundary_param(content_type: &str, kind: &str) -> Option<String> {
    let mut segments = content_type.split(';');
    let mime = segments.next()?.trim();
    if !mime.eq_ignore_ascii_case(kind) {
        return None;
    }
    for param in segments {
        if let Some((name, value)) = param.split_once('=') {
            if name.trim().eq_ignore_ascii_case("boundary") {
                let value = value.trim().trim_matches('"');
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Decode a `multipart/mixed` complete-document response.
pub fn decode_document(content_type: &str, payload: &[u8]) -> Result<DecodedDoc> {
    let boundary = boundary_param(content_type, "multipart/mixed").ok_or_else(|| {
        ReplicationError::Decode(format!(
            "expected multipart/mixed response, got {content_type:?}"
        ))
    })?;

    let mut body: Option<Map<String, Value>> = None;
    let mut attachments = Vec::new();

    for part in split_parts(payload, &boundary)? {
        let part_type = part.header("Content-Type").unwrap_or("").to_string();
        let mime = part_type.split(';').next().unwrap_or("").trim();

        if mime.eq_ignore_ascii_case("application/json") {
            body = Some(parse_json_object(&part.body)?);
        } else if let Some(nested) = boundary_param(&part_type, "multipart/related") {
            for inner in split_parts(&part.body, &nested)? {
                if inner.header("Content-Disposition").is_some() {
                    attachments.push(inner);
                } else {
                    body = Some(parse_json_object(&inner.body)?);
                }
            }
        } else {
            return Err(ReplicationError::Decode(format!(
                "unsupported document part content type {part_type:?}"
            )));
        }
    }

    let body = body.ok_or_else(|| {
        ReplicationError::Decode("multipart response carried no document part".to_string())
    })?;

    Ok(DecodedDoc {
        body,
        attachments,
        size: payload.len() as u64,
    })
}

/// Encode a document plus attachments as a `multipart/related` body with
/// a fresh boundary. Returns `(boundary, body)`.
pub fn encode_related(
    body: &Map<String, Value>,
    attachments: &[AttachmentPart],
) -> Result<(String, Vec<u8>)> {
    let boundary = uuid::Uuid::new_v4().simple().to_string();
    let mut out = Vec::new();

    out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    out.extend_from_slice(b"Content-Type: application/json\r\n\r\n");
    out.extend_from_slice(&serde_json::to_vec(body)?);

    for attachment in attachments {
        out.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
        for (name, value) in &attachment.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&attachment.body);
    }

    out.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    Ok((boundary, out))
}

fn parse_json_object(bytes: &[u8]) -> Result<Map<String, Value>> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(map) => Ok(map),
        other => Err(ReplicationError::Decode(format!(
            "document part is not a JSON object: {other}"
        ))),
    }
}

/// Split a multipart body into its parts.
fn split_parts(data: &[u8], boundary: &str) -> Result<Vec<AttachmentPart>> {
    let delimiter = format!("--{boundary}");
    let mut pos = find(data, delimiter.as_bytes(), 0).ok_or_else(|| {
        ReplicationError::Decode(format!("multipart boundary {boundary:?} not found in body"))
    })? + delimiter.len();

    let mut parts = Vec::new();
    loop {
        if data[pos..].starts_with(b"--") {
            break; // closing delimiter
        }
        if data[pos..].starts_with(b"\r\n") {
            pos += 2;
        } else {
            return Err(ReplicationError::Decode(
                "malformed multipart delimiter line".to_string(),
            ));
        }

        let mut headers = Vec::new();
        loop {
            let line_end = find(data, b"\r\n", pos).ok_or_else(|| {
                ReplicationError::Decode("unterminated part header block".to_string())
            })?;
            if line_end == pos {
                pos += 2;
                break;
            }
            let line = std::str::from_utf8(&data[pos..line_end]).map_err(|_| {
                ReplicationError::Decode("part header is not valid UTF-8".to_string())
            })?;
            let (name, value) = line.split_once(':').ok_or_else(|| {
                ReplicationError::Decode(format!("malformed part header {line:?}"))
            })?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
            pos = line_end + 2;
        }

        let marker = format!("\r\n--{boundary}");
        let body_end = find(data, marker.as_bytes(), pos).ok_or_else(|| {
            ReplicationError::Decode("unterminated multipart part body".to_string())
        })?;
        parts.push(AttachmentPart {
            headers,
            body: data[pos..body_end].to_vec(),
        });
        pos = body_end + marker.len();
    }

    Ok(parts)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|i| i + from)
}
