use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use region_coordination::client::node_name;
use region_coordination::{CoordinationClient, NodeEventKind, WatchReceiver};

use crate::assignment::AssignmentManager;
use crate::error::Result;
use crate::paths;

/// Feeds changes under `/unassigned` to the assignment engine.
pub struct TransitionWatcher {
    client: Arc<dyn CoordinationClient>,
    am: Arc<AssignmentManager>,
}

impl TransitionWatcher {
    pub fn new(client: Arc<dyn CoordinationClient>, am: Arc<AssignmentManager>) -> Self {
        Self { client, am }
    }

    /// Open the watch. Done before the master replays existing transition
    /// nodes so no update written during the replay is lost.
    pub async fn start(&self) -> Result<WatchReceiver> {
        Ok(self.client.watch(&paths::transition_prefix()).await?)
    }

    pub async fn run(&self, mut events: WatchReceiver, cancel: CancellationToken) -> Result<()> {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = events.recv() => event,
            };
            let Some(event) = event else {
                return Err(region_coordination::Error::WatchClosed(paths::transition_prefix()).into());
            };
            match event.kind {
                NodeEventKind::Created | NodeEventKind::DataChanged => {
                    self.am.submit_transition(node_name(&event.path).to_string());
                }
                // Deletions are the master's own doing or follow a region
                // going online, nothing to react to.
                NodeEventKind::Deleted => {
                    tracing::trace!(path = %event.path, "transition node deleted");
                }
            }
        }
    }
}
