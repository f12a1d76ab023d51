//! Configuration for replication jobs.
//!
//! A [`ReplicationJob`] is the declarative record consumed by
//! [`Replicator`](crate::Replicator): where to read, where to write, and
//! how to behave. Jobs can be constructed programmatically or deserialized
//! from JSON/YAML.
//!
//! # Quick Start
//!
//! ```rust
//! use couch_replicator::config::{Endpoint, ReplicationJob};
//!
//! let job = ReplicationJob {
//!     source: Endpoint::new("http://localhost:5984/source"),
//!     target: Endpoint::new("http://localhost:5984/target"),
//!     create_target: true,
//!     ..Default::default()
//! };
//! ```
//!
//! # Replication Identity
//!
//! [`ReplicationJob::replication_id()`] derives the hex SHA-256 digest that
//! keys a (job, runner) pair. The digest covers the runner name, both
//! endpoint signatures (URL plus headers in sorted key order), and the
//! create-target / continuous flags. Two runners with the same name and job
//! therefore resume each other's checkpoints, and any change to a URL,
//! header, or flag reroutes to a fresh checkpoint.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

/// One database endpoint: a URL plus the headers sent with every request.
///
/// Headers are kept in a sorted map so the identity derivation and request
/// building are deterministic regardless of construction order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Base URL of the database, e.g. `http://localhost:5984/db`.
    pub url: String,

    /// Headers attached to every request (e.g. `Authorization`).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Endpoint {
    /// Create an endpoint with no extra headers.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }

    /// Add a header, returning the endpoint for chaining.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Write this endpoint's identity signature: `url|k1|v1|k2|v2|…` with
    /// keys in lexicographic byte order.
    fn write_signature(&self, out: &mut String) {
        out.push_str(&self.url);
        out.push('|');
        for (key, value) in &self.headers {
            out.push_str(key);
            out.push('|');
            out.push_str(value);
            out.push('|');
        }
    }
}

/// User context metadata carried on a job. Advisory; not interpreted by
/// the replication protocol itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCtx {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Declarative replication request. Immutable for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationJob {
    /// Endpoint to read changes from.
    pub source: Endpoint,

    /// Endpoint to write documents to.
    pub target: Endpoint,

    /// Create the target database if it does not exist.
    #[serde(default)]
    pub create_target: bool,

    /// Keep polling the changes feed instead of terminating when it
    /// drains. A continuous run never returns replication-completed.
    #[serde(default)]
    pub continuous: bool,

    /// Changes-feed heartbeat in milliseconds. Zero means the protocol
    /// default of 10 seconds.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Optional user context metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ctx: Option<UserCtx>,
}

fn default_heartbeat_ms() -> u64 {
    10_000
}

impl ReplicationJob {
    /// Create a minimal job for testing.
    pub fn for_testing(source_url: &str, target_url: &str) -> Self {
        Self {
            source: Endpoint::new(source_url),
            target: Endpoint::new(target_url),
            create_target: false,
            continuous: false,
            heartbeat_ms: default_heartbeat_ms(),
            user_ctx: None,
        }
    }

    /// The heartbeat interval, falling back to the recommended 10 seconds.
    pub fn heartbeat(&self) -> Duration {
        if self.heartbeat_ms == 0 {
            Duration::from_millis(default_heartbeat_ms())
        } else {
            Duration::from_millis(self.heartbeat_ms)
        }
    }

    /// Derive the replication identity for this job and runner name.
    ///
    /// `name` is commonly the hostname. The digest is
    /// `sha256_hex(name|src_sig|tgt_sig|TF)` where each endpoint signature
    /// is the URL followed by its headers in sorted key order, and the two
    /// trailing bytes encode the create-target and continuous flags.
    pub fn replication_id(&self, name: &str) -> String {
        let mut input = String::new();
        input.push_str(name);
        input.push('|');
        self.source.write_signature(&mut input);
        input.push('|');
        self.target.write_signature(&mut input);
        input.push('|');
        input.push(if self.create_target { 'T' } else { 'F' });
        input.push(if self.continuous { 'T' } else { 'F' });

        hex::encode(Sha256::digest(input.as_bytes()))
    }
}
