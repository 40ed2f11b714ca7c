use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::Result;

/// Precondition for a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The node must not exist yet.
    Absent,
    /// The node must exist and currently carry this version.
    Exact(i64),
}

/// Result of a conditional write. A `Conflict` is an expected outcome, not an
/// error: it means another actor wrote first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Written(i64),
    Conflict,
}

impl CasOutcome {
    pub fn version(&self) -> Option<i64> {
        match self {
            CasOutcome::Written(v) => Some(*v),
            CasOutcome::Conflict => None,
        }
    }

    pub fn is_written(&self) -> bool {
        matches!(self, CasOutcome::Written(_))
    }
}

/// Node payload together with the version that must be echoed back by any
/// write depending on it. Versions start at 1 and increase by one per write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub data: Vec<u8>,
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEventKind {
    Created,
    DataChanged,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    pub kind: NodeEventKind,
    pub path: String,
}

/// Events for every node under a watched prefix, in commit order.
///
/// The sender side is dropped when the underlying watch breaks; consumers must
/// treat a closed receiver as loss of contact with the coordination service.
pub type WatchReceiver = mpsc::UnboundedReceiver<NodeEvent>;

/// Operations the assignment core consumes from the coordination service.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Identifier of the session ephemeral nodes created by this client are
    /// bound to.
    fn session_id(&self) -> i64;

    /// Create or overwrite `path` if `expected` holds.
    async fn create_or_set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: ExpectedVersion,
    ) -> Result<CasOutcome>;

    /// Create a node that disappears when this client's session ends.
    async fn create_ephemeral(&self, path: &str, data: Vec<u8>) -> Result<CasOutcome>;

    async fn get_data(&self, path: &str) -> Result<Option<Versioned>>;

    /// Delete `path`, only if it carries `expected_version` when one is given.
    /// Returns `false` when the node is missing or the version did not match.
    async fn delete(&self, path: &str, expected_version: Option<i64>) -> Result<bool>;

    /// Names of the direct children of `path`.
    async fn list_children(&self, path: &str) -> Result<Vec<String>>;

    async fn watch(&self, prefix: &str) -> Result<WatchReceiver>;
}

// ── JSON helpers ─────────────────────────────────────────────

pub async fn read_json<T: DeserializeOwned>(
    client: &dyn CoordinationClient,
    path: &str,
) -> Result<Option<(T, i64)>> {
    match client.get_data(path).await? {
        Some(node) => Ok(Some((serde_json::from_slice(&node.data)?, node.version))),
        None => Ok(None),
    }
}

pub async fn write_json<T: Serialize>(
    client: &dyn CoordinationClient,
    path: &str,
    value: &T,
    expected: ExpectedVersion,
) -> Result<CasOutcome> {
    let data = serde_json::to_vec(value)?;
    client.create_or_set(path, data, expected).await
}

/// Join a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), child)
}

/// Last segment of a node path.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
