//! Bulk upload stack.
//!
//! Collects inlined documents and flushes them to the target in one
//! `_bulk_docs` call to amortize round-trips while bounding peak memory.
//!
//! ```text
//! fetched docs ──┬──▶ DocumentStack ──▶ size > 10 MiB ──▶ _bulk_docs
//!                │    (append-only,                       + commit fence
//!                │     byte-accounted)
//!                └──▶ residual flush at end of run
//! ```
//!
//! Documents pushed here must already have their attachments inlined so
//! the serialized bulk body is self-contained JSON.

use crate::document::CompleteDoc;
use crate::error::Result;
use serde::Serialize;
use serde_json::{Map, Value};

/// Byte threshold for both the direct-upload routing decision and the
/// stack flush trigger.
pub const BIG_DOC_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Wire shape of a `_bulk_docs` request.
#[derive(Serialize)]
struct BulkDocsBody<'a> {
    docs: Vec<&'a Map<String, Value>>,
    new_edits: bool,
}

/// An ordered, append-only buffer of documents awaiting bulk upload.
#[derive(Debug, Default)]
pub struct DocumentStack {
    docs: Vec<CompleteDoc>,
    bytes: u64,
}

impl DocumentStack {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a document. O(1); the running byte total grows by the
    /// document's observed size.
    pub fn push(&mut self, doc: CompleteDoc) {
        self.bytes += doc.size();
        self.docs.push(doc);
    }

    /// Total size of the contained documents in bytes.
    pub fn size(&self) -> u64 {
        self.bytes
    }

    /// Number of documents in the stack.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Check if the stack is empty.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Whether the byte total has crossed the flush threshold.
    pub fn should_flush(&self) -> bool {
        self.bytes > BIG_DOC_THRESHOLD
    }

    /// Serialize the stack as a `_bulk_docs` body:
    /// `{"docs": […], "new_edits": false}`.
    pub fn bulk_body(&self) -> Result<Vec<u8>> {
        let body = BulkDocsBody {
            docs: self.docs.iter().map(|d| &d.body).collect(),
            new_edits: false,
        };
        Ok(serde_json::to_vec(&body)?)
    }

    /// Empty the stack after a successful flush.
    pub fn clear(&mut self) {
        self.docs.clear();
        self.bytes = 0;
    }
}
