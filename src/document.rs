//! Complete documents fetched from the source.
//!
//! A [`CompleteDoc`] holds the parsed JSON body of one document, the
//! attachment parts that arrived alongside it, and the raw byte size
//! observed while decoding. The size drives the routing decision between
//! the direct multipart upload and the bulk stack.
//!
//! # Attachment Inlining
//!
//! Documents headed for `_bulk_docs` must be self-contained JSON.
//! [`CompleteDoc::inline_attachments()`] folds each attachment part into
//! the body's `_attachments` entry: gzip-marked bytes are decompressed,
//! the payload becomes base64 `data`, and the stub bookkeeping fields
//! (`stub`, `digest`, `length`, `follows`) are dropped.

use crate::error::{ReplicationError, Result};
use crate::multipart::{AttachmentPart, DecodedDoc};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use serde_json::{Map, Value};
use std::io::Read;

/// An in-memory complete document: body, attachments, observed size.
#[derive(Debug, Clone)]
pub struct CompleteDoc {
    /// Document id.
    pub id: String,
    /// Parsed document body; may include an `_attachments` submap.
    pub body: Map<String, Value>,
    /// Attachment parts still pending inlining or direct upload.
    pub attachments: Vec<AttachmentPart>,
    size: u64,
}

impl CompleteDoc {
    /// Build a complete document from a decoded multipart response.
    pub fn from_decoded(id: impl Into<String>, decoded: DecodedDoc) -> Self {
        Self {
            id: id.into(),
            body: decoded.body,
            attachments: decoded.attachments,
            size: decoded.size,
        }
    }

    /// Raw bytes observed while decoding this document.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The document revision, if the body carries one.
    pub fn rev(&self) -> Option<&str> {
        self.body.get("_rev").and_then(Value::as_str)
    }

    /// Whether this revision arrived with changed attachments.
    pub fn has_changed_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Fold every attachment part into the body's `_attachments` map so
    /// the document can travel in a JSON-only bulk body.
    ///
    /// Gzip-encoded attachments are decompressed and their `encoding` /
    /// `encoded_length` markers removed; the raw bytes become base64
    /// `data` and the stub fields are dropped.
    pub fn inline_attachments(&mut self) -> Result<()> {
        for part in std::mem::take(&mut self.attachments) {
            let filename = part
                .filename()
                .ok_or_else(|| {
                    ReplicationError::Decode(
                        "attachment part has no filename in Content-Disposition".to_string(),
                    )
                })?
                .to_string();

            let entry = self
                .body
                .get_mut("_attachments")
                .and_then(Value::as_object_mut)
                .and_then(|atts| atts.get_mut(&filename))
                .and_then(Value::as_object_mut)
                .ok_or_else(|| {
                    ReplicationError::Decode(format!(
                        "attachment {filename:?} has no _attachments entry"
                    ))
                })?;

            let gzipped = entry.get("encoding").and_then(Value::as_str) == Some("gzip");
            let bytes = if gzipped {
                let mut plain = Vec::new();
                GzDecoder::new(part.body.as_slice())
                    .read_to_end(&mut plain)
                    .map_err(|e| {
                        ReplicationError::Decode(format!(
                            "gzip decode of attachment {filename:?} failed: {e}"
                        ))
                    })?;
                entry.remove("encoding");
                entry.remove("encoded_length");
                plain
            } else {
                part.body
            };

            entry.insert("data".to_string(), Value::String(BASE64.encode(&bytes)));
            for stub_field in ["stub", "digest", "length", "follows"] {
                entry.remove(stub_field);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn attachment_part(filename: &str, body: Vec<u8>) -> AttachmentPart {
        AttachmentPart {
            headers: vec![(
                "Content-Disposition".to_string(),
                format!("attachment; filename=\"{filename}\""),
            )],
            body,
        }
    }

    fn doc_with_attachment(entry_json: &str, part: AttachmentPart) -> CompleteDoc {
        let body: Map<String, Value> = serde_json::from_str(&format!(
            r#"{{"_id": "d", "_rev": "1-a", "_attachments": {{"{}": {}}}}}"#,
            part.filename().unwrap(),
            entry_json
        ))
        .unwrap();
        CompleteDoc {
            id: "d".to_string(),
            body,
            attachments: vec![part],
            size: 100,
        }
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_inline_plain_attachment() {
        let part = attachment_part("a.txt", b"hello".to_vec());
        let mut doc = doc_with_attachment(
            r#"{"stub": true, "digest": "md5-x", "length": 5, "content_type": "text/plain"}"#,
            part,
        );

        doc.inline_attachments().unwrap();

        assert!(!doc.has_changed_attachments());
        let entry = &doc.body["_attachments"]["a.txt"];
        assert_eq!(entry["data"], BASE64.encode(b"hello"));
        assert_eq!(entry["content_type"], "text/plain");
        assert!(entry.get("stub").is_none());
        assert!(entry.get("digest").is_none());
        assert!(entry.get("length").is_none());
    }

    #[test]
    fn test_inline_gzip_attachment_round_trip() {
        let original = b"compressible compressible compressible".to_vec();
        let part = attachment_part("z.txt", gzip(&original));
        let mut doc = doc_with_attachment(
            r#"{"follows": true, "encoding": "gzip", "encoded_length": 30, "length": 39}"#,
            part,
        );

        doc.inline_attachments().unwrap();

        let entry = &doc.body["_attachments"]["z.txt"];
        let decoded = BASE64
            .decode(entry["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, original);
        assert!(entry.get("encoding").is_none());
        assert!(entry.get("encoded_length").is_none());
        assert!(entry.get("follows").is_none());
    }

    #[test]
    fn test_inline_fails_without_filename() {
        let part = AttachmentPart {
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            body: b"x".to_vec(),
        };
        let mut doc = CompleteDoc {
            id: "d".to_string(),
            body: Map::new(),
            attachments: vec![part],
            size: 1,
        };
        let err = doc.inline_attachments().unwrap_err();
        assert!(err.to_string().contains("no filename"));
    }

    #[test]
    fn test_inline_fails_without_attachments_entry() {
        let part = attachment_part("missing.bin", b"x".to_vec());
        let mut doc = CompleteDoc {
            id: "d".to_string(),
            body: serde_json::from_str(r#"{"_id": "d"}"#).unwrap(),
            attachments: vec![part],
            size: 1,
        };
        let err = doc.inline_attachments().unwrap_err();
        assert!(err.to_string().contains("missing.bin"));
    }

    #[test]
    fn test_inline_corrupt_gzip_is_decode_error() {
        let part = attachment_part("bad.gz", b"not gzip at all".to_vec());
        let mut doc = doc_with_attachment(r#"{"encoding": "gzip"}"#, part);
        let err = doc.inline_attachments().unwrap_err();
        assert!(matches!(err, ReplicationError::Decode(_)));
    }

    #[test]
    fn test_rev_accessor() {
        let doc = CompleteDoc {
            id: "d".to_string(),
            body: serde_json::from_str(r#"{"_rev": "3-abc"}"#).unwrap(),
            attachments: Vec::new(),
            size: 0,
        };
        assert_eq!(doc.rev(), Some("3-abc"));
        assert!(!doc.has_changed_attachments());
    }
}
