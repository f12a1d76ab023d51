// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication controller.
//!
//! The [`Replicator`] drives one run of the replication protocol:
//!
//! 1. **Verify peers**: the source must exist; a missing target is
//!    created when the job asks for it.
//! 2. **Get peers information**: advisory info snapshots from both sides.
//! 3. **Find common ancestry**: derive the replication identity, fetch
//!    the `_local` logs from both peers, and compare them to pick the
//!    startup sequence.
//! 4. **Locate changed documents**: poll `_changes` and diff the
//!    candidate revisions against the target until something is missing
//!    (or the feed drains).
//! 5. **Replicate changes**: fetch each missing document, route big
//!    attachment-carrying documents to a direct multipart PUT and
//!    everything else through the bulk stack, fence with
//!    `_ensure_full_commit`, then record the checkpoint on both peers.
//!
//! The controller owns the run's mutable bookkeeping: the in-progress
//! history record collects the forensic counters (`docs_read`,
//! `docs_written`, `doc_write_failures`, `missing_checked`,
//! `missing_found`) whether or not the run succeeds.
//!
//! # Cancellation
//!
//! Every I/O call races the cancellation signal. An observed cancellation
//! aborts the run immediately; no checkpoint is written.
//!
//! # Checkpoint Ordering
//!
//! Checkpoints are persisted only after the commit fence succeeded, so a
//! recorded checkpoint implies durability of every write since the prior
//! one. The source log is written first; if the target write then fails,
//! the run reports the failure but the one-sided source checkpoint is
//! harmless — the log comparison rule requires matching session ids on
//! both sides.

use crate::batch::{DocumentStack, BIG_DOC_THRESHOLD};
use crate::checkpoint::{compare_replication_logs, History, ReplicationLog};
use crate::config::ReplicationJob;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::peer::{cancelled, DbInfo, Peer, RevDiffRequest};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Outcome of one replication run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// The replication identity of the job.
    pub replication_id: String,
    /// Sequence the run started from.
    pub start_seq: String,
    /// Sequence recorded at the end, if the run got that far.
    pub end_seq: Option<String>,
    pub docs_read: u64,
    pub docs_written: u64,
    pub doc_write_failures: u64,
    pub missing_checked: u64,
    pub missing_found: u64,
}

/// Drives one-way replication from a source peer to a target peer.
pub struct Replicator {
    /// Runner name folded into the replication identity (commonly the
    /// hostname).
    name: String,
    job: ReplicationJob,
    replication_id: String,

    source: Peer,
    target: Peer,

    source_info: Option<DbInfo>,
    target_info: Option<DbInfo>,

    source_log: ReplicationLog,
    target_log: ReplicationLog,

    /// In-progress history record for the current session.
    session: History,
    /// Startup sequence selected by the log comparison.
    startup_seq: String,

    cancel: watch::Receiver<bool>,
}

impl Replicator {
    /// Create a replicator for a job. The cancellation receiver flips to
    /// `true` to abort the run.
    pub fn new(
        name: impl Into<String>,
        job: ReplicationJob,
        cancel: watch::Receiver<bool>,
    ) -> Result<Self> {
        let name = name.into();
        let replication_id = job.replication_id(&name);
        let source = Peer::new("source", &job.source, cancel.clone())?;
        let target = Peer::new("target", &job.target, cancel.clone())?;

        Ok(Self {
            name,
            job,
            replication_id,
            source,
            target,
            source_info: None,
            target_info: None,
            source_log: ReplicationLog::default(),
            target_log: ReplicationLog::default(),
            session: History::default(),
            startup_seq: String::new(),
            cancel,
        })
    }

    /// The replication identity derived from the job and runner name.
    pub fn replication_id(&self) -> &str {
        &self.replication_id
    }

    /// Counters of the current (or last) session. Populated even when a
    /// run fails, as the forensic trail.
    pub fn session_stats(&self) -> &History {
        &self.session
    }

    /// Source info snapshot read in phase 2, once available.
    pub fn source_info(&self) -> Option<&DbInfo> {
        self.source_info.as_ref()
    }

    /// Target info snapshot read in phase 2, once available.
    pub fn target_info(&self) -> Option<&DbInfo> {
        self.target_info.as_ref()
    }

    /// Execute one replication run.
    ///
    /// A non-continuous run that finds nothing to do terminates normally
    /// with zero counters. Continuous runs block on the changes feed
    /// heartbeat until changes arrive or the run is cancelled.
    pub async fn run(&mut self) -> Result<RunSummary> {
        debug!(replication_id = %self.replication_id, name = %self.name, "verify peers");
        self.verify_peers().await?;

        debug!("get peers information");
        self.get_peers_information().await?;

        debug!("find common ancestry");
        self.find_common_ancestry().await?;
        info!(since = %self.startup_seq, "replication will start");

        debug!("locate changed documents");
        let (diff, last_seq) = match self.locate_changed_documents().await {
            Ok(found) => found,
            Err(e) if e.is_completed() => {
                info!("replication completed, nothing to transfer");
                return Ok(self.summarize(None));
            }
            Err(e) => return Err(e),
        };

        debug!(last_seq = %last_seq, missing = diff.len(), "replicate changes");
        self.replicate_changes(diff, &last_seq).await?;

        Ok(self.summarize(Some(last_seq)))
    }

    /// Delete the replication checkpoint from both peers. Idempotent.
    pub async fn reset(&self) -> Result<()> {
        self.source
            .remove_replication_checkpoint(&self.replication_id)
            .await?;
        self.target
            .remove_replication_checkpoint(&self.replication_id)
            .await?;
        info!(replication_id = %self.replication_id, "replication checkpoint removed");
        Ok(())
    }

    /// Phase 1: probe both peers, creating the target on demand.
    async fn verify_peers(&self) -> Result<()> {
        self.source.exists().await?;

        match self.target.exists().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() && self.job.create_target => {
                info!("target missing, creating");
                self.target.create().await
            }
            Err(e) => Err(e),
        }
    }

    /// Phase 2: read advisory info from both peers.
    async fn get_peers_information(&mut self) -> Result<()> {
        let source_info = self.source.info().await?;
        debug!(
            db = %source_info.db_name,
            update_seq = %source_info.update_seq,
            doc_count = source_info.doc_count,
            "source info"
        );
        self.source_info = Some(source_info);

        let target_info = self.target.info().await?;
        debug!(
            db = %target_info.db_name,
            update_seq = %target_info.update_seq,
            doc_count = target_info.doc_count,
            "target info"
        );
        self.target_info = Some(target_info);
        Ok(())
    }

    /// Phase 3: fetch both replication logs and derive the startup
    /// sequence. A missing log on either side is not an error.
    async fn find_common_ancestry(&mut self) -> Result<()> {
        let id = self.replication_id.clone();

        let source_log = match self.source.replication_log(&id).await {
            Ok(log) => Some(log),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let target_log = match self.target.replication_log(&id).await {
            Ok(log) => Some(log),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        self.startup_seq = compare_replication_logs(source_log.as_ref(), target_log.as_ref());
        self.source_log = source_log.unwrap_or_default();
        self.target_log = target_log.unwrap_or_default();
        self.session = History::begin(id, self.startup_seq.clone());
        Ok(())
    }

    /// Phase 4: poll the changes feed and diff against the target until
    /// missing revisions turn up.
    ///
    /// Returns the diff map and the batch's `last_seq`. In one-shot mode
    /// an empty feed (or a feed the target already has) terminates with
    /// `Completed`; in continuous mode the loop sleeps one heartbeat and
    /// re-enters with the same cursor.
    async fn locate_changed_documents(
        &mut self,
    ) -> Result<(Vec<(String, Vec<String>)>, String)> {
        let since = self.startup_seq.clone();
        let heartbeat = self.job.heartbeat();

        loop {
            self.ensure_active()?;

            let changes = self.source.changes(&since, heartbeat).await?;
            debug!(count = changes.results.len(), "changes batch");

            if changes.results.is_empty() {
                if self.job.continuous {
                    self.sleep_heartbeat(heartbeat).await?;
                    continue;
                }
                return Err(ReplicationError::Completed);
            }

            let mut diff_request = RevDiffRequest::new();
            for row in &changes.results {
                let revs = diff_request.entry(row.id.clone()).or_default();
                for change in &row.changes {
                    revs.push(change.rev.clone());
                }
            }
            self.session.missing_found += diff_request.len() as u64;

            let diff = self.target.rev_diff(&diff_request).await?;
            self.session.missing_checked += diff.len() as u64;
            debug!(differences = diff.len(), "revision diff");

            if diff.is_empty() {
                // Target already has every candidate revision.
                if self.job.continuous {
                    self.sleep_heartbeat(heartbeat).await?;
                    continue;
                }
                return Err(ReplicationError::Completed);
            }

            let diff = diff
                .into_iter()
                .map(|(id, entry)| (id, entry.missing))
                .collect();
            return Ok((diff, changes.last_seq));
        }
    }

    /// Phase 5: transfer every missing revision, flush the stack, and
    /// record the checkpoint when anything was written.
    async fn replicate_changes(
        &mut self,
        diff: Vec<(String, Vec<String>)>,
        last_seq: &str,
    ) -> Result<()> {
        let mut stack = DocumentStack::new();

        for (doc_id, missing) in diff {
            self.ensure_active()?;

            let mut doc = self.source.get_document_complete(&doc_id, &missing).await?;
            self.session.docs_read += 1;
            metrics::record_docs_read(1);
            debug!(
                doc = %doc_id,
                size = doc.size(),
                attachments = doc.has_changed_attachments(),
                rev = doc.rev().unwrap_or(""),
                "fetched document"
            );

            if !doc.has_changed_attachments() {
                stack.push(doc);
            } else if doc.size() > BIG_DOC_THRESHOLD {
                // Too big to buffer in a bulk body; PUT it directly with
                // its attachments.
                match self.target.upload_document_with_attachments(&doc).await {
                    Ok(()) => {
                        self.session.docs_written += 1;
                        metrics::record_docs_written(1);
                    }
                    Err(e) => {
                        self.session.doc_write_failures += 1;
                        metrics::record_doc_write_failures(1);
                        warn!(doc = %doc_id, error = %e, "document upload failed");
                        return Err(e);
                    }
                }
            } else {
                doc.inline_attachments()?;
                stack.push(doc);
            }

            if stack.should_flush() {
                self.flush_stack(&mut stack).await?;
            }
        }

        if !stack.is_empty() {
            self.flush_stack(&mut stack).await?;
        }

        self.session.session_id = self.replication_id.clone();
        self.session.finish(last_seq);

        if self.session.docs_written > 0 {
            self.record_checkpoints().await?;
        }
        Ok(())
    }

    /// Bulk-upload the stack and fence the writes.
    async fn flush_stack(&mut self, stack: &mut DocumentStack) -> Result<()> {
        let count = stack.len() as u64;
        debug!(docs = count, bytes = stack.size(), "flushing stack");

        if let Err(e) = self.target.bulk_docs(stack).await {
            self.session.doc_write_failures += count;
            metrics::record_doc_write_failures(count);
            warn!(docs = count, error = %e, "bulk upload failed");
            return Err(e);
        }
        self.session.docs_written += count;
        metrics::record_docs_written(count);

        self.target.ensure_full_commit().await?;
        stack.clear();
        Ok(())
    }

    /// Record the finished session on both peers, each log extended from
    /// its own previous history.
    async fn record_checkpoints(&mut self) -> Result<()> {
        let mut source_log = self.source_log.clone();
        source_log.id = self.replication_id.clone();
        source_log.record_session(self.session.clone());
        self.source
            .record_replication_checkpoint(&source_log, &self.replication_id)
            .await?;
        self.source_log = source_log;

        let mut target_log = self.target_log.clone();
        target_log.id = self.replication_id.clone();
        target_log.record_session(self.session.clone());
        self.target
            .record_replication_checkpoint(&target_log, &self.replication_id)
            .await?;
        self.target_log = target_log;

        info!(
            recorded_seq = %self.session.recorded_seq,
            docs_written = self.session.docs_written,
            "checkpoint recorded on both peers"
        );
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        if *self.cancel.borrow() {
            Err(ReplicationError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Sleep one heartbeat, racing cancellation.
    async fn sleep_heartbeat(&self, heartbeat: std::time::Duration) -> Result<()> {
        tokio::select! {
            _ = cancelled(self.cancel.clone()) => Err(ReplicationError::Aborted),
            _ = tokio::time::sleep(heartbeat) => Ok(()),
        }
    }

    fn summarize(&self, end_seq: Option<String>) -> RunSummary {
        RunSummary {
            replication_id: self.replication_id.clone(),
            start_seq: self.startup_seq.clone(),
            end_seq,
            docs_read: self.session.docs_read,
            docs_written: self.session.docs_written,
            doc_write_failures: self.session.doc_write_failures,
            missing_checked: self.session.missing_checked,
            missing_found: self.session.missing_found,
        }
    }
}
