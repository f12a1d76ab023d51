//! Peer database client.
//!
//! A [`Peer`] is a typed wrapper over one database endpoint, speaking the
//! HTTP surface of the replication protocol. The endpoint's configured
//! headers are silently attached to every request, every operation checks
//! the run's cancellation signal, and per-operation latency is recorded.
//!
//! # Status Classification
//!
//! | Operation | OK | Not found | Otherwise |
//! |-----------|----|-----------|-----------|
//! | `exists` (HEAD /) | 200 | 404 | transport error |
//! | `create` (PUT /) | 2xx + `{ok:true}` | — | transport error |
//! | `info` (GET /) | 200 | 404 | transport error |
//! | `replication_log` (GET `_local/<id>`) | 200 | 404 | transport error |
//! | `changes`, `rev_diff`, `get_document_complete` | 200 | — | transport error |
//! | `upload_document_with_attachments`, `bulk_docs`, checkpoints | 200/201 | — | transport error |
//! | `ensure_full_commit` | 200/201 + `{ok:true}` | — | transport error |
//! | `remove_replication_checkpoint` | 2xx or 404 | — | transport error |

use crate::batch::DocumentStack;
use crate::checkpoint::ReplicationLog;
use crate::config::Endpoint;
use crate::document::CompleteDoc;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::multipart;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Database info snapshot, read before a run for diagnostics.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DbInfo {
    #[serde(default)]
    pub committed_update_seq: i64,
    #[serde(default)]
    pub compact_running: bool,
    #[serde(default)]
    pub db_name: String,
    #[serde(default)]
    pub disk_format_version: i64,
    #[serde(default)]
    pub doc_count: i64,
    #[serde(default)]
    pub doc_del_count: i64,
    #[serde(default)]
    pub instance_start_time: String,
    #[serde(default)]
    pub purge_seq: String,
    #[serde(default)]
    pub sizes: Sizes,
    #[serde(default)]
    pub update_seq: String,
}

/// Byte sizes reported by a database.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Sizes {
    #[serde(default)]
    pub active: i64,
    #[serde(default)]
    pub disk: i64,
    #[serde(default)]
    pub external: i64,
}

/// One batch from the changes feed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangesResponse {
    #[serde(default)]
    pub results: Vec<ChangeRow>,
    #[serde(default)]
    pub last_seq: String,
}

/// One changed document: its sequence token and candidate revisions.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRow {
    pub seq: String,
    pub id: String,
    #[serde(default)]
    pub changes: Vec<ChangeRev>,
    #[serde(default)]
    pub deleted: bool,
}

/// One candidate revision inside a change row.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRev {
    pub rev: String,
}

/// Request body for `_revs_diff`: document id → candidate revisions.
pub type RevDiffRequest = BTreeMap<String, Vec<String>>;

/// Response from `_revs_diff`: only ids with missing revisions appear.
pub type DiffResponse = HashMap<String, Diff>;

/// Missing revisions for one document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Diff {
    #[serde(default)]
    pub missing: Vec<String>,
    #[serde(default)]
    pub possible_ancestors: Option<Vec<String>>,
}

/// `{ok, error, reason}` body returned by database-level writes.
#[derive(Debug, Default, Deserialize)]
struct StatusBody {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Resolves when the cancellation signal flips to `true`. Never resolves
/// if the sender goes away without cancelling.
pub(crate) async fn cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A typed client for one database endpoint.
#[derive(Debug)]
pub struct Peer {
    role: String,
    base: String,
    headers: HeaderMap,
    client: reqwest::Client,
    cancel: watch::Receiver<bool>,
}

impl Peer {
    /// Create a client for an endpoint. `role` labels the peer in logs
    /// and metrics ("source" / "target").
    pub fn new(
        role: impl Into<String>,
        endpoint: &Endpoint,
        cancel: watch::Receiver<bool>,
    ) -> Result<Self> {
        let base = endpoint.url.trim_end_matches('/').to_string();
        reqwest::Url::parse(&base)
            .map_err(|e| ReplicationError::Config(format!("invalid endpoint URL {base:?}: {e}")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &endpoint.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ReplicationError::Config(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ReplicationError::Config(format!("invalid value for header {name}: {e}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("couch-replicator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ReplicationError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            role: role.into(),
            base,
            headers,
            client,
            cancel,
        })
    }

    /// The peer's role label.
    pub fn role(&self) -> &str {
        &self.role
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    /// Send one request with the endpoint headers attached, racing the
    /// cancellation signal.
    async fn execute(&self, operation: &'static str, request: RequestBuilder) -> Result<Response> {
        if *self.cancel.borrow() {
            return Err(ReplicationError::Aborted);
        }

        let started = Instant::now();
        let request = request.headers(self.headers.clone());

        let result = tokio::select! {
            _ = cancelled(self.cancel.clone()) => return Err(ReplicationError::Aborted),
            result = request.send() => result,
        };
        metrics::record_peer_request_latency(&self.role, operation, started.elapsed());

        match result {
            Ok(response) => {
                debug!(
                    peer = %self.role,
                    operation,
                    status = response.status().as_u16(),
                    "HTTP request"
                );
                metrics::record_peer_request(&self.role, operation, response.status().is_success());
                Ok(response)
            }
            Err(e) => {
                debug!(peer = %self.role, operation, error = %e, "HTTP request failed");
                metrics::record_peer_request(&self.role, operation, false);
                Err(ReplicationError::transport(operation, e))
            }
        }
    }

    /// Probe database existence with a HEAD on the root.
    pub async fn exists(&self) -> Result<()> {
        let response = self.execute("exists", self.client.head(&self.base)).await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(ReplicationError::not_found(&self.base)),
            status => Err(ReplicationError::transport_status("exists", status.as_u16())),
        }
    }

    /// Create the database with a PUT on the root.
    pub async fn create(&self) -> Result<()> {
        let response = self.execute("create", self.client.put(&self.base)).await?;
        let status = response.status();
        let body: StatusBody = response
            .json()
            .await
            .map_err(|e| ReplicationError::Decode(format!("create response: {e}")))?;

        if !status.is_success() || !body.ok {
            return Err(ReplicationError::transport_msg(
                "create",
                format!(
                    "status {}: {} {}",
                    status.as_u16(),
                    body.error.unwrap_or_default(),
                    body.reason.unwrap_or_default()
                ),
            ));
        }
        Ok(())
    }

    /// Read the database info snapshot.
    pub async fn info(&self) -> Result<DbInfo> {
        let response = self.execute("info", self.client.get(&self.base)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ReplicationError::not_found(&self.base)),
            StatusCode::OK => response
                .json()
                .await
                .map_err(|e| ReplicationError::Decode(format!("info response: {e}"))),
            status => Err(ReplicationError::transport_status("info", status.as_u16())),
        }
    }

    /// Fetch the replication log stored under `_local/<id>`.
    pub async fn replication_log(&self, id: &str) -> Result<ReplicationLog> {
        let url = self.url(&format!("_local/{id}"));
        let response = self.execute("replication_log", self.client.get(&url)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ReplicationError::not_found(format!("_local/{id}"))),
            StatusCode::OK => response
                .json()
                .await
                .map_err(|e| ReplicationError::Decode(format!("replication log: {e}"))),
            status => Err(ReplicationError::transport_status(
                "replication_log",
                status.as_u16(),
            )),
        }
    }

    /// Read one normal-feed changes batch since the given sequence.
    pub async fn changes(&self, since: &str, heartbeat: Duration) -> Result<ChangesResponse> {
        let url = format!(
            "{}/_changes?feed=normal&style=all_docs&heartbeat={}&since={}",
            self.base,
            heartbeat.as_millis(),
            since
        );
        let response = self.execute("changes", self.client.get(&url)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ReplicationError::not_found(format!("{}/_changes", self.base))),
            StatusCode::OK => {
                let changes: ChangesResponse = response
                    .json()
                    .await
                    .map_err(|e| ReplicationError::Decode(format!("changes response: {e}")))?;
                metrics::record_changes_rows(&self.role, changes.results.len());
                Ok(changes)
            }
            status => Err(ReplicationError::transport_status("changes", status.as_u16())),
        }
    }

    /// Ask the database which of the candidate revisions it is missing.
    pub async fn rev_diff(&self, request: &RevDiffRequest) -> Result<DiffResponse> {
        let response = self
            .execute(
                "rev_diff",
                self.client
                    .post(self.url("_revs_diff"))
                    .header(ACCEPT, "application/json")
                    .json(request),
            )
            .await?;
        match response.status() {
            StatusCode::OK => response
                .json()
                .await
                .map_err(|e| ReplicationError::Decode(format!("revs diff response: {e}"))),
            status => Err(ReplicationError::transport_status("rev_diff", status.as_u16())),
        }
    }

    /// Fetch the complete document for the given missing revisions,
    /// attachments included, via multipart framing.
    pub async fn get_document_complete(
        &self,
        doc_id: &str,
        missing: &[String],
    ) -> Result<CompleteDoc> {
        let url = format!(
            "{}/{}?revs=true&latest=true&open_revs=[{}]",
            self.base,
            doc_id,
            quoted_rev_list(missing)
        );
        let response = self
            .execute(
                "get_document",
                self.client.get(&url).header(ACCEPT, "multipart/mixed"),
            )
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ReplicationError::transport_status(
                "get_document",
                status.as_u16(),
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let payload = response
            .bytes()
            .await
            .map_err(|e| ReplicationError::transport("get_document", e))?;

        let decoded = multipart::decode_document(&content_type, &payload)?;
        Ok(CompleteDoc::from_decoded(doc_id, decoded))
    }

    /// Upload one document with its attachments as `multipart/related`.
    ///
    /// The body is materialized up front: the server requires a
    /// Content-Length for multipart PUTs.
    pub async fn upload_document_with_attachments(&self, doc: &CompleteDoc) -> Result<()> {
        let (boundary, body) = multipart::encode_related(&doc.body, &doc.attachments)?;
        let url = format!("{}/{}?new_edits=false", self.base, doc.id);
        let content_type = format!("multipart/related; boundary=\"{boundary}\"");

        let response = self
            .execute(
                "upload_document",
                self.client
                    .put(&url)
                    .header(CONTENT_TYPE, content_type)
                    .body(body),
            )
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            status => Err(ReplicationError::transport_status(
                "upload_document",
                status.as_u16(),
            )),
        }
    }

    /// Upload a stack of inlined documents via `_bulk_docs`.
    pub async fn bulk_docs(&self, stack: &DocumentStack) -> Result<()> {
        let body = stack.bulk_body()?;
        let response = self
            .execute(
                "bulk_docs",
                self.client
                    .post(self.url("_bulk_docs"))
                    .header(CONTENT_TYPE, "application/json")
                    .header("X-Couch-Full-Commit", "false")
                    .body(body),
            )
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            status => Err(ReplicationError::transport_status(
                "bulk_docs",
                status.as_u16(),
            )),
        }
    }

    /// Force the database to flush its write buffers. Durability barrier
    /// before a checkpoint is trusted; older servers answer 201, newer
    /// ones 200.
    pub async fn ensure_full_commit(&self) -> Result<()> {
        let response = self
            .execute(
                "ensure_full_commit",
                self.client
                    .post(self.url("_ensure_full_commit"))
                    .header(CONTENT_TYPE, "application/json")
                    .body("{}"),
            )
            .await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            return Err(ReplicationError::transport_status(
                "ensure_full_commit",
                status.as_u16(),
            ));
        }

        let body: StatusBody = response
            .json()
            .await
            .map_err(|e| ReplicationError::Decode(format!("full commit response: {e}")))?;
        if !body.ok {
            return Err(ReplicationError::transport_msg(
                "ensure_full_commit",
                "response did not confirm ok",
            ));
        }
        Ok(())
    }

    /// Persist the replication log under `_local/<id>`.
    pub async fn record_replication_checkpoint(
        &self,
        log: &ReplicationLog,
        id: &str,
    ) -> Result<()> {
        let url = self.url(&format!("_local/{id}"));
        let response = self
            .execute("record_checkpoint", self.client.put(&url).json(log))
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                metrics::record_checkpoint(&self.role);
                Ok(())
            }
            status => Err(ReplicationError::transport_status(
                "record_checkpoint",
                status.as_u16(),
            )),
        }
    }

    /// Delete the replication log under `_local/<id>`. Idempotent: an
    /// already-absent log counts as success.
    pub async fn remove_replication_checkpoint(&self, id: &str) -> Result<()> {
        let url = self.url(&format!("_local/{id}"));
        let response = self
            .execute("remove_checkpoint", self.client.delete(&url))
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(ReplicationError::transport_status(
                "remove_checkpoint",
                status.as_u16(),
            ))
        }
    }
}

/// Render the `open_revs` list: each revision individually wrapped in
/// URL-encoded double quotes, comma-joined.
fn quoted_rev_list(missing: &[String]) -> String {
    missing
        .iter()
        .map(|rev| format!("%22{rev}%22"))
        .collect::<Vec<_>>()
        .join(",")
}
