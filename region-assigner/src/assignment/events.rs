//! Handling of transition node changes reported by the coordination
//! service.

use crate::error::{Error, Result};
use crate::metrics_consts::*;
use crate::paths;
use crate::transition::{self, TransitionNode};
use crate::types::{EventType, RegionInfo, RegionState, RegionStateRecord, ServerName};

use super::AssignmentManager;

const SPLIT_NODE_DELETE_ATTEMPTS: usize = 10;

impl AssignmentManager {
    /// Queue handling of the transition node of `encoded_name`. Events for
    /// one region are handled one at a time in arrival order.
    pub fn submit_transition(&self, encoded_name: String) {
        let Some(am) = self.this.upgrade() else {
            return;
        };
        self.dispatcher
            .submit(encoded_name.clone(), async move {
                am.handle_transition(&encoded_name).await
            });
    }

    /// Handle whatever the node holds now. Handlers read the node rather
    /// than trusting the notification, so a burst of changes collapses into
    /// the latest state.
    pub async fn handle_transition(&self, encoded_name: &str) {
        metrics::counter!(TRANSITION_EVENTS).increment(1);
        let result = async {
            let _lock = self.locker.acquire(encoded_name).await;
            let node = match transition::read(self.coordination.as_ref(), encoded_name).await {
                Ok(Some(node)) => node,
                Ok(None) => {
                    tracing::debug!(region = %encoded_name, "transition node gone before handling");
                    return Ok(());
                }
                Err(Error::MalformedTransition(path, e)) => {
                    metrics::counter!(MALFORMED_TRANSITIONS).increment(1);
                    tracing::error!(path = %path, error = %e, "dropping malformed transition node");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            self.handle_region_locked(node).await
        }
        .await;

        match result {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                self.abort(&format!("handling transition of {encoded_name}"), &e)
            }
            Err(e) => {
                tracing::warn!(region = %encoded_name, error = %e, "failed to handle transition")
            }
        }
    }

    async fn handle_region_locked(&self, node: TransitionNode) -> Result<()> {
        let TransitionNode {
            transition: rt,
            version,
        } = node;
        let region = &rt.region;
        let origin = &rt.origin;
        let current = self.region_states.region_in_transition(region);

        tracing::debug!(
            region = %region,
            event = %rt.event_type,
            origin = %origin,
            version,
            state = ?current.as_ref().map(|r| r.state),
            "handling transition"
        );

        match rt.event_type {
            // Our own writes coming back.
            EventType::MasterRegionOffline | EventType::MasterRegionClosing => {}

            EventType::RegionSplitting => {
                if !split_allowed(current.as_ref(), origin) {
                    return ignored(region, &rt.event_type, current.as_ref());
                }
                self.region_states.update_region_state(
                    region,
                    RegionState::Splitting,
                    Some(origin.clone()),
                );
            }

            EventType::RegionSplit => {
                if !split_allowed(current.as_ref(), origin) {
                    return ignored(region, &rt.event_type, current.as_ref());
                }
                let daughters = match rt.payload.as_deref() {
                    Some([a, b]) => (a.clone(), b.clone()),
                    _ => {
                        metrics::counter!(MALFORMED_TRANSITIONS).increment(1);
                        tracing::error!(region = %region, "split report without two daughters, dropping");
                        return Ok(());
                    }
                };
                if !self.server_manager.is_server_online(origin) {
                    tracing::error!(
                        region = %region,
                        server = %origin,
                        "split reported by a server that is not online, dropping"
                    );
                    return Ok(());
                }
                self.region_states.update_region_state(
                    region,
                    RegionState::Splitting,
                    Some(origin.clone()),
                );
                self.handle_split_report(origin, region, &daughters.0, &daughters.1)
                    .await;
                self.delete_split_node(region).await?;
            }

            EventType::RegionClosing => {
                if !closing(current.as_ref()) {
                    return ignored(region, &rt.event_type, current.as_ref());
                }
                self.region_states.update_region_state(
                    region,
                    RegionState::Closing,
                    Some(origin.clone()),
                );
            }

            EventType::RegionClosed => {
                if !closing(current.as_ref()) {
                    return ignored(region, &rt.event_type, current.as_ref());
                }
                self.region_states
                    .update_region_state(region, RegionState::Closed, None);
                self.spawn_complete_close(region.clone());
            }

            EventType::RegionFailedOpen => {
                let allowed = current.as_ref().is_some_and(|r| {
                    r.is_pending_open_or_opening_on(origin) || r.is_pending_close() || r.is_closing()
                });
                if !allowed {
                    return ignored(region, &rt.event_type, current.as_ref());
                }
                tracing::info!(region = %region, server = %origin, "region failed to open");
                self.region_states
                    .update_region_state(region, RegionState::Closed, None);
                // The reopen follows this plan, which avoids the failed server
                // whenever another one is available.
                if self.region_plan(region, Some(origin), true).is_none() {
                    self.plans.remove(region);
                }
                self.spawn_complete_close(region.clone());
            }

            EventType::RegionOpening => {
                if !opening_on(current.as_ref(), origin) {
                    return ignored(region, &rt.event_type, current.as_ref());
                }
                self.region_states.update_region_state(
                    region,
                    RegionState::Opening,
                    Some(origin.clone()),
                );
                if !self.server_manager.is_server_online(origin) {
                    tracing::warn!(
                        region = %region,
                        server = %origin,
                        "region opening on a server that is not online, escalating"
                    );
                    self.region_states.reset_timestamp(region);
                    self.timeout_wakeup.notify_one();
                }
            }

            EventType::RegionOpened => {
                if !opening_on(current.as_ref(), origin) {
                    return ignored(region, &rt.event_type, current.as_ref());
                }
                let deleted = transition::delete_node(
                    self.coordination.as_ref(),
                    &region.encoded_name(),
                    EventType::RegionOpened,
                    Some(version),
                )
                .await?;
                if !deleted {
                    // The server moved on, most likely into a split.
                    tracing::warn!(region = %region, "opened node changed before it could be deleted");
                    return Ok(());
                }
                self.mark_online(region, origin).await;
                tracing::info!(region = %region, server = %origin, "region online");
                if self.table_states.is_disabling_or_disabled(&region.table) {
                    tracing::info!(region = %region, table = %region.table, "opened region of a disabled table, closing it");
                    self.spawn_unassign(region.clone());
                }
            }
        }
        Ok(())
    }

    /// `server` split `parent` into `a` and `b`. The parent goes offline for
    /// good and both daughters are online where the parent was.
    pub async fn handle_split_report(
        &self,
        server: &ServerName,
        parent: &RegionInfo,
        a: &RegionInfo,
        b: &RegionInfo,
    ) {
        tracing::info!(
            parent = %parent,
            daughter_a = %a,
            daughter_b = %b,
            server = %server,
            "region split"
        );
        self.region_offline(&parent.as_split_parent());
        self.region_states.region_online(a, server.clone());
        self.region_states.region_online(b, server.clone());
        if let Err(e) = self.catalog.split_parent(parent, a, b, server).await {
            tracing::warn!(parent = %parent, error = %e, "failed to record split in catalog");
        }
        if self.table_states.is_disabling_or_disabled(&parent.table) {
            self.spawn_unassign(a.clone());
            self.spawn_unassign(b.clone());
        }
    }

    async fn delete_split_node(&self, parent: &RegionInfo) -> Result<()> {
        let encoded = parent.encoded_name();
        let path = paths::transition_node(&encoded);
        for _ in 0..SPLIT_NODE_DELETE_ATTEMPTS {
            let node = match transition::read(self.coordination.as_ref(), &encoded).await? {
                Some(node) => node,
                None => return Ok(()),
            };
            if node.transition.event_type != EventType::RegionSplit {
                tracing::warn!(
                    region = %parent,
                    event = %node.transition.event_type,
                    "split node replaced before it could be deleted"
                );
                return Ok(());
            }
            if self.coordination.delete(&path, Some(node.version)).await? {
                return Ok(());
            }
        }
        tracing::warn!(region = %parent, "gave up deleting split node");
        Ok(())
    }
}

/// A split may be reported for a region that is not in transition, one we
/// were about to close, or one whose OPENED node the server replaced with
/// the split before we handled it.
fn split_allowed(current: Option<&RegionStateRecord>, server: &ServerName) -> bool {
    match current {
        None => true,
        Some(r) => {
            r.is_splitting()
                || r.is_split()
                || r.is_pending_close()
                || r.is_pending_open_or_opening_on(server)
        }
    }
}

fn closing(current: Option<&RegionStateRecord>) -> bool {
    current.is_some_and(|r| r.is_pending_close() || r.is_closing())
}

fn opening_on(current: Option<&RegionStateRecord>, server: &ServerName) -> bool {
    current.is_some_and(|r| r.is_pending_open_or_opening_on(server))
}

fn ignored(
    region: &RegionInfo,
    event: &EventType,
    current: Option<&RegionStateRecord>,
) -> Result<()> {
    tracing::warn!(
        region = %region,
        event = %event,
        state = ?current.map(|r| r.state),
        "transition does not match region state, ignoring"
    );
    Ok(())
}
