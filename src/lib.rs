//! # Couch Replicator
//!
//! A one-way document replicator speaking the CouchDB replication
//! protocol (v3): <https://docs.couchdb.org/en/stable/replication/protocol.html>
//!
//! ## Architecture
//!
//! A run moves changed documents from a source database to a target
//! database over HTTP, resuming from a checkpoint persisted at both peers:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           couch-replicator                           │
//! │                                                                      │
//! │  ┌────────────┐   ┌───────────────┐   ┌───────────────────────────┐  │
//! │  │ Replicator │──►│ Peer (source) │──►│ _changes / doc fetch      │  │
//! │  │ (5 phases) │   │ Peer (target) │──►│ _revs_diff / _bulk_docs   │  │
//! │  └────────────┘   └───────────────┘   └───────────────────────────┘  │
//! │        │                  │                                          │
//! │        ▼                  ▼                                          │
//! │  ┌───────────────┐   ┌──────────────────────────┐                    │
//! │  │ DocumentStack │   │ ReplicationLog (_local/) │                    │
//! │  │ (bulk buffer) │   │ checkpoint on both peers │                    │
//! │  └───────────────┘   └──────────────────────────┘                    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Phases
//!
//! 1. **Verify peers**: source must exist; target is created on demand.
//! 2. **Get peers information**: advisory database info snapshots.
//! 3. **Find common ancestry**: replication identity + log comparison
//!    select the startup sequence.
//! 4. **Locate changed documents**: `_changes` since the checkpoint,
//!    diffed against the target via `_revs_diff`.
//! 5. **Replicate changes**: fetch complete documents (multipart with
//!    attachments), route big documents to a direct multipart PUT and
//!    everything else through a bulk stack, then fence with
//!    `_ensure_full_commit` and record the checkpoint on both peers.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use couch_replicator::{Endpoint, ReplicationJob, Replicator};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let job = ReplicationJob {
//!         source: Endpoint::new("http://localhost:5984/source"),
//!         target: Endpoint::new("http://localhost:5984/target"),
//!         create_target: true,
//!         ..Default::default()
//!     };
//!
//!     let (_cancel_tx, cancel_rx) = watch::channel(false);
//!     let mut replicator = Replicator::new("example-host", job, cancel_rx).unwrap();
//!     let summary = replicator.run().await.expect("replication failed");
//!     println!("wrote {} documents", summary.docs_written);
//! }
//! ```

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod document;
pub mod error;
pub mod metrics;
pub mod multipart;
pub mod peer;
pub mod replicator;

// Re-exports for convenience
pub use batch::{DocumentStack, BIG_DOC_THRESHOLD};
pub use checkpoint::{History, ReplicationLog};
pub use config::{Endpoint, ReplicationJob, UserCtx};
pub use document::CompleteDoc;
pub use error::{ReplicationError, Result};
pub use peer::Peer;
pub use replicator::{Replicator, RunSummary};
