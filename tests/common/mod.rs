//! Shared helpers for integration tests.
//!
//! Builds mock CouchDB-protocol endpoints on a wiremock server. One
//! server hosts both databases (`/source` and `/target`); helpers mount
//! the protocol surface piece by piece so each scenario states exactly
//! the traffic it expects.

use couch_replicator::{Endpoint, ReplicationJob};
use serde_json::{json, Value};
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A job pointing at `/source` and `/target` on the mock server, with a
/// fast heartbeat so continuous tests stay quick.
pub fn job_for(server: &MockServer) -> ReplicationJob {
    ReplicationJob {
        source: Endpoint::new(format!("{}/source", server.uri())),
        target: Endpoint::new(format!("{}/target", server.uri())),
        heartbeat_ms: 50,
        ..Default::default()
    }
}

/// Mount a HEAD probe for a database root.
pub async fn mount_head(server: &MockServer, db: &str, status: u16) {
    Mock::given(method("HEAD"))
        .and(path(format!("/{db}")))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

/// Mount the database info snapshot.
pub async fn mount_info(server: &MockServer, db: &str, update_seq: &str, doc_count: i64) {
    Mock::given(method("GET"))
        .and(path(format!("/{db}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "committed_update_seq": 0,
            "compact_running": false,
            "db_name": db,
            "disk_format_version": 8,
            "doc_count": doc_count,
            "doc_del_count": 0,
            "instance_start_time": "0",
            "purge_seq": "0",
            "sizes": {"active": 1024, "disk": 4096, "external": 2048},
            "update_seq": update_seq,
        })))
        .mount(server)
        .await;
}

/// Mount a 404 for any `_local` checkpoint read on a database.
pub async fn mount_log_missing(server: &MockServer, db: &str) {
    Mock::given(method("GET"))
        .and(path_regex(format!("^/{db}/_local/.+$")))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": "not_found",
            "reason": "missing",
        })))
        .mount(server)
        .await;
}

/// Mount a stored replication log for any `_local` read on a database.
pub async fn mount_log(server: &MockServer, db: &str, log: Value) {
    Mock::given(method("GET"))
        .and(path_regex(format!("^/{db}/_local/.+$")))
        .respond_with(ResponseTemplate::new(200).set_body_json(log))
        .mount(server)
        .await;
}

/// Mount one changes batch for a given `since` cursor.
pub async fn mount_changes(server: &MockServer, db: &str, since: &str, body: Value) {
    Mock::given(method("GET"))
        .and(path(format!("/{db}/_changes")))
        .and(query_param("since", since))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Mount the `_revs_diff` response for a database.
pub async fn mount_revs_diff(server: &MockServer, db: &str, body: Value) {
    Mock::given(method("POST"))
        .and(path(format!("/{db}/_revs_diff")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Mount a complete-document fetch returning a prebuilt multipart body.
pub async fn mount_doc(
    server: &MockServer,
    db: &str,
    doc_id: &str,
    content_type: &str,
    body: Vec<u8>,
) {
    Mock::given(method("GET"))
        .and(path(format!("/{db}/{doc_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, content_type))
        .mount(server)
        .await;
}

/// Mount `_bulk_docs`, `_ensure_full_commit`, and checkpoint writes with
/// expected call counts.
pub async fn mount_write_side(
    server: &MockServer,
    bulk_calls: u64,
    commit_calls: u64,
    checkpoint_calls_per_db: u64,
) {
    Mock::given(method("POST"))
        .and(path("/target/_bulk_docs"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([])))
        .expect(bulk_calls)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/target/_ensure_full_commit"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ok": true})))
        .expect(commit_calls)
        .mount(server)
        .await;

    for db in ["source", "target"] {
        Mock::given(method("PUT"))
            .and(path_regex(format!("^/{db}/_local/.+$")))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "ok": true,
                "id": "_local/checkpoint",
                "rev": "0-1",
            })))
            .expect(checkpoint_calls_per_db)
            .mount(server)
            .await;
    }
}

/// A changes feed body with one row per `(id, rev)` pair.
pub fn changes_body(rows: &[(&str, &str)], last_seq: &str) -> Value {
    let results: Vec<Value> = rows
        .iter()
        .enumerate()
        .map(|(i, (id, rev))| {
            json!({
                "seq": format!("{}-seq", i + 1),
                "id": id,
                "changes": [{"rev": rev}],
            })
        })
        .collect();
    json!({"results": results, "last_seq": last_seq})
}

/// An empty changes feed at the given cursor.
pub fn empty_changes(last_seq: &str) -> Value {
    json!({"results": [], "last_seq": last_seq})
}

/// A `_revs_diff` response marking every `(id, rev)` pair missing.
pub fn all_missing(rows: &[(&str, &str)]) -> Value {
    let mut body = serde_json::Map::new();
    for (id, rev) in rows {
        body.insert(id.to_string(), json!({"missing": [rev]}));
    }
    Value::Object(body)
}

/// A `multipart/mixed` body carrying only the document JSON.
/// Returns `(content_type, body)`.
pub fn mixed_json(doc: &Value) -> (String, Vec<u8>) {
    let boundary = "7b1a88f6e9";
    let body = format!(
        "--{boundary}\r\nContent-Type: application/json\r\n\r\n{doc}\r\n--{boundary}--\r\n"
    )
    .into_bytes();
    (
        format!("multipart/mixed; boundary=\"{boundary}\""),
        body,
    )
}

/// A `multipart/mixed` body with a nested `multipart/related` part
/// carrying the document JSON and one attachment.
pub fn mixed_with_attachment(doc: &Value, filename: &str, bytes: &[u8]) -> (String, Vec<u8>) {
    let outer = "0aa31f2bd4";
    let inner = "5c9e07c311";
    let mut body = format!(
        "--{outer}\r\nContent-Type: multipart/related; boundary=\"{inner}\"\r\n\r\n\
         --{inner}\r\nContent-Type: application/json\r\n\r\n{doc}\r\n\
         --{inner}\r\nContent-Disposition: attachment; filename=\"{filename}\"\r\n\
         Content-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
        bytes.len()
    )
    .into_bytes();
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{inner}--\r\n--{outer}--\r\n").as_bytes());
    (
        format!("multipart/mixed; boundary=\"{outer}\""),
        body,
    )
}

/// Find the bodies of received requests matching a method and path
/// substring, parsed as JSON.
pub async fn received_json_bodies(
    server: &MockServer,
    http_method: &str,
    path_contains: &str,
) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| {
            r.method.to_string() == http_method && r.url.path().contains(path_contains)
        })
        .filter_map(|r| serde_json::from_slice(&r.body).ok())
        .collect()
}
