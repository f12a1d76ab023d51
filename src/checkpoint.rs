// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication log model and checkpoint comparison.
//!
//! Checkpoints are stored at both peers as a `_local` document keyed by
//! the replication identity. The log survives either peer restarting and
//! lets a later run resume from the last recorded source sequence.
//!
//! # Log Shape
//!
//! The log carries a per-session `history` list plus shortcut fields
//! (`session_id`, `source_last_seq`) mirroring the latest entry. History
//! is kept **newest-first**: new session records are prepended, and the
//! comparison scan walks the list in order.
//!
//! # Checkpoint Semantics
//!
//! The recorded sequence is the `last_seq` of the changes batch whose
//! documents were all durably written (the commit fence ran before the
//! checkpoint). On resume, the comparison rule picks the startup sequence:
//!
//! 1. Either log absent → full replication from `"0"`.
//! 2. Matching top-level `session_id` on both sides → the source's
//!    `source_last_seq`.
//! 3. Otherwise the newest source history entry whose `session_id`
//!    appears anywhere in the target history → that entry's
//!    `recorded_seq`.
//! 4. No common session → `"0"`.
//!
//! A one-sided checkpoint (source write succeeded, target write failed)
//! is tolerated: rule 2 requires both sides to agree, so the next run
//! falls back to the older common session or a full replication.

use serde::{Deserialize, Serialize};

/// Replication protocol version recorded in every log.
pub const REPLICATION_ID_VERSION: i64 = 3;

/// Startup sequence for a full replication (no usable common ancestor).
pub const FULL_REPLICATION_SEQ: &str = "0";

/// Persisted replication log, stored under `_local/<replication id>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationLog {
    /// Document id; equals the replication identity.
    #[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Revision of the `_local` document, when the server reports one.
    /// Carried through on rewrite so updates do not conflict.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    /// Per-session history records, newest first.
    #[serde(default)]
    pub history: Vec<History>,

    /// Replication protocol version (always 3).
    #[serde(default)]
    pub replication_id_version: i64,

    /// Shortcut to `history[0].session_id`.
    #[serde(default)]
    pub session_id: String,

    /// Shortcut to `history[0].recorded_seq`.
    #[serde(default)]
    pub source_last_seq: String,
}

/// One replication session: counters and boundary sequences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    /// Number of failed document writes.
    #[serde(default)]
    pub doc_write_failures: u64,

    /// Number of documents read from the source.
    #[serde(default)]
    pub docs_read: u64,

    /// Number of documents written to the target.
    #[serde(default)]
    pub docs_written: u64,

    /// Last processed update sequence.
    #[serde(default)]
    pub end_last_seq: String,

    /// Session completion timestamp, RFC 2822.
    #[serde(default)]
    pub end_time: String,

    /// Number of revisions the target reported missing.
    #[serde(default)]
    pub missing_checked: u64,

    /// Number of document ids offered to the target for diffing.
    #[serde(default)]
    pub missing_found: u64,

    /// Recorded checkpoint sequence.
    #[serde(default)]
    pub recorded_seq: String,

    /// Unique session id; equals the replication identity.
    #[serde(default)]
    pub session_id: String,

    /// Update sequence the session started from.
    #[serde(default)]
    pub start_last_seq: String,

    /// Session start timestamp, RFC 2822.
    #[serde(default)]
    pub start_time: String,
}

impl History {
    /// Open a new in-progress session record.
    pub fn begin(session_id: impl Into<String>, start_seq: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            start_last_seq: start_seq.into(),
            start_time: now_rfc2822(),
            ..Default::default()
        }
    }

    /// Close the record: stamp the end time and the final sequence.
    pub fn finish(&mut self, end_seq: impl Into<String>) {
        let end_seq = end_seq.into();
        self.recorded_seq = end_seq.clone();
        self.end_last_seq = end_seq;
        self.end_time = now_rfc2822();
    }
}

impl ReplicationLog {
    /// Append a finished session to this log, keeping the invariants:
    /// history stays newest-first and the shortcut fields mirror the
    /// latest entry.
    pub fn record_session(&mut self, session: History) {
        self.replication_id_version = REPLICATION_ID_VERSION;
        self.session_id = session.session_id.clone();
        self.source_last_seq = session.recorded_seq.clone();
        self.history.insert(0, session);
    }
}

/// Select the startup sequence from the two peers' logs.
///
/// `None` stands for a log the peer did not have. Total: every input pair
/// yields exactly one sequence.
pub fn compare_replication_logs(
    source: Option<&ReplicationLog>,
    target: Option<&ReplicationLog>,
) -> String {
    let (source, target) = match (source, target) {
        (Some(s), Some(t)) => (s, t),
        _ => return FULL_REPLICATION_SEQ.to_string(),
    };

    // Chronologically-last sessions agree: both sides share a valid
    // history, resume from the source's recorded checkpoint.
    if source.session_id == target.session_id && !source.source_last_seq.is_empty() {
        return source.source_last_seq.clone();
    }

    // Mismatch: walk source history newest to oldest looking for the
    // latest session id the target has also seen.
    for source_entry in &source.history {
        for target_entry in &target.history {
            if source_entry.session_id == target_entry.session_id {
                return source_entry.recorded_seq.clone();
            }
        }
    }

    FULL_REPLICATION_SEQ.to_string()
}

fn now_rfc2822() -> String {
    chrono::Utc::now().to_rfc2822()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(session_id: &str, recorded_seq: &str) -> History {
        History {
            session_id: session_id.to_string(),
            recorded_seq: recorded_seq.to_string(),
            ..Default::default()
        }
    }

    fn log(session_id: &str, source_last_seq: &str, history: Vec<History>) -> ReplicationLog {
        ReplicationLog {
            session_id: session_id.to_string(),
            source_last_seq: source_last_seq.to_string(),
            history,
            ..Default::default()
        }
    }

    #[test]
    fn test_compare_absent_logs() {
        assert_eq!(compare_replication_logs(None, None), "0");

        let some = log("s1", "10", vec![entry("s1", "10")]);
        assert_eq!(compare_replication_logs(Some(&some), None), "0");
        assert_eq!(compare_replication_logs(None, Some(&some)), "0");
    }

    #[test]
    fn test_compare_matching_sessions() {
        let source = log("sess1", "42", vec![entry("sess1", "42")]);
        let target = log("sess1", "42", vec![entry("sess1", "42")]);
        assert_eq!(
            compare_replication_logs(Some(&source), Some(&target)),
            "42"
        );
    }

    #[test]
    fn test_compare_matching_sessions_empty_seq_falls_through() {
        // Matching ids but an empty source_last_seq cannot be resumed from.
        let source = log("sess1", "", vec![]);
        let target = log("sess1", "9", vec![]);
        assert_eq!(compare_replication_logs(Some(&source), Some(&target)), "0");
    }

    #[test]
    fn test_compare_scans_history_for_common_ancestor() {
        // Source history [s3, s2, s1], target history [t9, s2, t0]:
        // the newest common session is s2.
        let source = log(
            "s3",
            "30",
            vec![entry("s3", "30"), entry("s2", "20"), entry("s1", "10")],
        );
        let target = log(
            "t9",
            "90",
            vec![entry("t9", "90"), entry("s2", "21"), entry("t0", "1")],
        );
        assert_eq!(
            compare_replication_logs(Some(&source), Some(&target)),
            "20"
        );
    }

    #[test]
    fn test_compare_prefers_newest_common_session() {
        let source = log(
            "s3",
            "30",
            vec![entry("s2", "20"), entry("s1", "10")],
        );
        let target = log(
            "t9",
            "90",
            vec![entry("s1", "11"), entry("s2", "22")],
        );
        // s2 is newer on the source side and also known to the target.
        assert_eq!(
            compare_replication_logs(Some(&source), Some(&target)),
            "20"
        );
    }

    #[test]
    fn test_compare_no_common_ancestry() {
        let source = log("s2", "20", vec![entry("s2", "20"), entry("s1", "10")]);
        let target = log("t2", "99", vec![entry("t2", "99"), entry("t1", "90")]);
        assert_eq!(compare_replication_logs(Some(&source), Some(&target)), "0");
    }

    #[test]
    fn test_record_session_prepends_and_mirrors() {
        let mut log = log("old", "5", vec![entry("old", "5")]);

        let mut session = History::begin("new-session", "5");
        session.docs_written = 3;
        session.finish("12");
        log.record_session(session);

        assert_eq!(log.history.len(), 2);
        assert_eq!(log.history[0].session_id, "new-session");
        assert_eq!(log.history[1].session_id, "old");
        assert_eq!(log.session_id, "new-session");
        assert_eq!(log.source_last_seq, "12");
        assert_eq!(log.replication_id_version, REPLICATION_ID_VERSION);
    }

    #[test]
    fn test_history_begin_finish_stamps() {
        let mut h = History::begin("sess", "7");
        assert_eq!(h.start_last_seq, "7");
        assert!(!h.start_time.is_empty());
        assert!(h.end_time.is_empty());

        h.finish("19");
        assert_eq!(h.end_last_seq, "19");
        assert_eq!(h.recorded_seq, "19");
        // RFC 2822 round-trips through chrono.
        assert!(chrono::DateTime::parse_from_rfc2822(&h.start_time).is_ok());
        assert!(chrono::DateTime::parse_from_rfc2822(&h.end_time).is_ok());
    }

    #[test]
    fn test_log_serializes_without_empty_id_and_rev() {
        let log = ReplicationLog {
            session_id: "s".to_string(),
            source_last_seq: "1".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&log).unwrap();
        assert!(!json.contains("_id"));
        assert!(!json.contains("_rev"));

        let with_rev = ReplicationLog {
            id: "abc".to_string(),
            rev: Some("0-1".to_string()),
            ..log
        };
        let json = serde_json::to_string(&with_rev).unwrap();
        assert!(json.contains("\"_id\":\"abc\""));
        assert!(json.contains("\"_rev\":\"0-1\""));
    }

    #[test]
    fn test_log_deserializes_sparse_json() {
        // A log written by an older peer may omit counters entirely.
        let log: ReplicationLog = serde_json::from_str(
            r#"{"_id": "x", "session_id": "s1", "source_last_seq": "4",
                "history": [{"session_id": "s1", "recorded_seq": "4"}]}"#,
        )
        .unwrap();
        assert_eq!(log.history[0].docs_written, 0);
        assert_eq!(log.source_last_seq, "4");
    }
}
