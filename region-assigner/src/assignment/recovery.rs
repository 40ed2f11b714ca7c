//! Rebuilding the in-memory view when a master takes over.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::paths;
use crate::table_state::TableState;
use crate::transition::{self, TransitionNode};
use crate::types::{EventType, RegionInfo, RegionState, ServerName};

use super::AssignmentManager;

/// What [`AssignmentManager::join_cluster`] found.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JoinReport {
    /// Regions found open on a live server and adopted as they are.
    pub adopted: usize,
    /// Regions with an outstanding transition node that was replayed.
    pub replayed: usize,
    /// Regions sent through bulk assignment.
    pub assigned: usize,
}

impl AssignmentManager {
    /// Build the region state from the catalog and the transition nodes
    /// left by a previous master, then assign whatever is not served.
    ///
    /// Region servers must already be registered so regions on live
    /// servers are adopted instead of reassigned.
    pub async fn join_cluster(&self) -> Result<JoinReport> {
        self.table_states.load().await?;
        let rows = self.catalog.scan().await?;

        let mut report = JoinReport::default();
        let mut unassigned: HashMap<RegionInfo, Option<ServerName>> = HashMap::new();
        for row in rows {
            let region = row.region;
            if region.is_split_parent() {
                self.region_states.region_offline(&region);
                continue;
            }
            if self.table_states.is_disabled(&region.table) {
                self.region_states.region_offline(&region);
                continue;
            }
            match row.server {
                Some(server) if self.server_manager.is_server_online(&server) => {
                    self.region_states.region_online(&region, server);
                    report.adopted += 1;
                }
                previous => {
                    self.region_states.create_region_state(&region);
                    unassigned.insert(region, previous);
                }
            }
        }

        let replayed = self.process_regions_in_transition().await?;
        report.replayed = replayed.len();
        unassigned.retain(|region, _| {
            !replayed.contains(&region.encoded_name())
                && !self.region_states.is_region_in_transition(region)
                && !self.region_states.is_region_online(region)
        });

        self.recover_disabling_tables();

        tracing::info!(
            adopted = report.adopted,
            replayed = report.replayed,
            unassigned = unassigned.len(),
            "joined cluster"
        );

        // Catalog regions are opened on their own before anything else.
        let catalog: Vec<RegionInfo> = unassigned
            .keys()
            .filter(|r| r.is_catalog())
            .cloned()
            .collect();
        for region in catalog {
            unassigned.remove(&region);
            match self.assign(&region, true, true).await {
                Ok(()) => report.assigned += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!(region = %region, error = %e, "failed to assign catalog region"),
            }
        }

        report.assigned += unassigned.len();
        match self.assign_retaining(unassigned).await {
            Ok(()) => {}
            Err(Error::NoServersAvailable(what)) => {
                tracing::warn!(regions = %what, "no region servers yet, regions stay offline until one registers");
            }
            Err(e) => return Err(e),
        }
        Ok(report)
    }

    /// A previous master died half way through disabling a table: close
    /// whatever of it is still open.
    fn recover_disabling_tables(&self) {
        let mut tables = HashSet::new();
        for record in self.region_states.records() {
            if self.table_states.get_state(&record.region.table) == TableState::Disabling {
                tables.insert(record.region.table.clone());
            }
        }
        for table in tables {
            tracing::info!(table = %table, "resuming disable of table");
            for record in self.region_states.regions_of_table(&table) {
                if record.is_open() {
                    self.spawn_unassign(record.region);
                }
            }
        }
    }

    /// Replay every transition node left behind. Returns the encoded names
    /// of the regions handled.
    pub async fn process_regions_in_transition(&self) -> Result<HashSet<String>> {
        let mut handled = HashSet::new();
        for encoded in self
            .coordination
            .list_children(paths::UNASSIGNED_DIR)
            .await?
        {
            let _lock = self.locker.acquire(&encoded).await;
            let node = match transition::read(self.coordination.as_ref(), &encoded).await {
                Ok(Some(node)) => node,
                Ok(None) => continue,
                Err(Error::MalformedTransition(path, e)) => {
                    tracing::warn!(path = %path, error = %e, "skipping malformed transition node");
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.replay_transition_locked(node).await?;
            handled.insert(encoded);
        }
        Ok(handled)
    }

    async fn replay_transition_locked(&self, node: TransitionNode) -> Result<()> {
        let rt = &node.transition;
        let region = &rt.region;
        let origin = &rt.origin;
        let origin_online = self.server_manager.is_server_online(origin);
        tracing::info!(
            region = %region,
            event = %rt.event_type,
            origin = %origin,
            origin_online,
            "replaying transition left by previous master"
        );

        match rt.event_type {
            EventType::MasterRegionOffline => {
                self.region_states
                    .update_region_state(region, RegionState::Offline, None);
                self.spawn_assign(region.clone(), false);
            }

            EventType::MasterRegionClosing | EventType::RegionClosing => {
                let server = match rt.event_type {
                    EventType::RegionClosing => Some(origin.clone()),
                    _ => self.region_states.get_region_server(region),
                };
                match server {
                    Some(server) if self.server_manager.is_server_online(&server) => {
                        let state = if rt.event_type == EventType::RegionClosing {
                            RegionState::Closing
                        } else {
                            RegionState::PendingClose
                        };
                        // The server finishes the close, or the timeout
                        // monitor sends it again.
                        self.region_states
                            .update_region_state(region, state, Some(server));
                    }
                    _ => {
                        self.take_back(region, node.version).await?;
                    }
                }
            }

            EventType::RegionClosed | EventType::RegionFailedOpen => {
                self.region_states
                    .update_region_state(region, RegionState::Closed, None);
                self.spawn_complete_close(region.clone());
            }

            EventType::RegionOpening if origin_online => {
                self.region_states.update_region_state(
                    region,
                    RegionState::Opening,
                    Some(origin.clone()),
                );
            }

            EventType::RegionOpened if origin_online => {
                self.region_states.update_region_state(
                    region,
                    RegionState::Opening,
                    Some(origin.clone()),
                );
                self.submit_transition(region.encoded_name());
            }

            EventType::RegionOpening | EventType::RegionOpened => {
                self.take_back(region, node.version).await?;
            }

            EventType::RegionSplitting | EventType::RegionSplit if origin_online => {
                self.region_states.update_region_state(
                    region,
                    RegionState::Splitting,
                    Some(origin.clone()),
                );
                if rt.event_type == EventType::RegionSplit {
                    self.submit_transition(region.encoded_name());
                }
            }

            EventType::RegionSplit => {
                // The split finished before the server died: the daughters
                // need a new home, the parent is gone for good.
                if let Some([a, b]) = rt.payload.as_deref() {
                    self.handle_split_report(origin, region, a, b).await;
                    self.region_states.region_offline(a);
                    self.region_states.region_offline(b);
                    self.spawn_assign(a.clone(), true);
                    self.spawn_assign(b.clone(), true);
                }
                self.coordination
                    .delete(
                        &paths::transition_node(&region.encoded_name()),
                        Some(node.version),
                    )
                    .await?;
            }

            EventType::RegionSplitting => {
                // The split never finished; the parent is still the region.
                self.coordination
                    .delete(
                        &paths::transition_node(&region.encoded_name()),
                        Some(node.version),
                    )
                    .await?;
                self.region_states.region_offline(region);
                self.spawn_assign(region.clone(), true);
            }
        }
        Ok(())
    }

    /// Force the node of a region abandoned by a dead server back to
    /// OFFLINE and reassign it.
    async fn take_back(&self, region: &RegionInfo, version: i64) -> Result<()> {
        if transition::force_node_offline(
            self.coordination.as_ref(),
            region,
            &self.master,
            version,
        )
        .await?
        .is_none()
        {
            tracing::info!(region = %region, "transition node moved during recovery, leaving it to the event handler");
            return Ok(());
        }
        self.region_states
            .update_region_state(region, RegionState::Offline, None);
        self.spawn_assign(region.clone(), true);
        Ok(())
    }
}
