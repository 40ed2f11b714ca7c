use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use region_coordination::util::now_millis;

use crate::types::{RegionInfo, RegionState, RegionStateRecord, ServerName, TableName};

/// What a dead server left behind.
#[derive(Debug, Default)]
pub struct ServerOfflineOutcome {
    /// Settled regions the server was serving. They are now OFFLINE and need
    /// a new home.
    pub held: Vec<RegionInfo>,
    /// Regions that were in transition on the server.
    pub in_transition: Vec<RegionStateRecord>,
}

#[derive(Default)]
struct Inner {
    states: HashMap<String, RegionStateRecord>,
    in_transition: HashSet<String>,
    assignments: HashMap<String, ServerName>,
    holdings: HashMap<ServerName, HashMap<String, RegionInfo>>,
}

impl Inner {
    fn remove_assignment(&mut self, encoded: &str) {
        if let Some(server) = self.assignments.remove(encoded) {
            self.remove_holding(&server, encoded);
        }
    }

    fn remove_holding(&mut self, server: &ServerName, encoded: &str) {
        if let Some(held) = self.holdings.get_mut(server) {
            held.remove(encoded);
            if held.is_empty() {
                self.holdings.remove(server);
            }
        }
    }
}

/// In-memory state of every known region.
///
/// The state map, the in-transition set, the assignment map (region to
/// serving server) and its inverse, the holdings map, are only ever changed
/// together under one lock, so readers never see the assignment and
/// holdings maps disagree. Readers get clones.
#[derive(Default)]
pub struct RegionStates {
    inner: Mutex<Inner>,
    updated: Notify,
}

impl RegionStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an OFFLINE record unless one exists. Returns whichever record
    /// is current, so callers must not assume theirs won.
    pub fn create_region_state(&self, region: &RegionInfo) -> RegionStateRecord {
        let record = {
            let mut inner = self.inner.lock();
            inner
                .states
                .entry(region.encoded_name())
                .or_insert_with(|| RegionStateRecord {
                    region: region.clone(),
                    state: RegionState::Offline,
                    server: None,
                    stamp: now_millis(),
                })
                .clone()
        };
        self.updated.notify_waiters();
        record
    }

    /// Overwrite the region's record.
    ///
    /// OFFLINE and CLOSED records never carry a server. A PENDING_CLOSE or
    /// CLOSING update without a server is recorded but not counted as in
    /// transition, and neither is SPLITTING.
    pub fn update_region_state(
        &self,
        region: &RegionInfo,
        state: RegionState,
        server: Option<ServerName>,
    ) -> RegionStateRecord {
        let encoded = region.encoded_name();
        let record = {
            let mut inner = self.inner.lock();
            let server = if state.is_serverless() { None } else { server };

            let tracked = !(state == RegionState::Splitting
                || (matches!(state, RegionState::PendingClose | RegionState::Closing)
                    && server.is_none()));

            let record = RegionStateRecord {
                region: region.clone(),
                state,
                server,
                stamp: now_millis(),
            };
            inner.states.insert(encoded.clone(), record.clone());
            if tracked {
                inner.in_transition.insert(encoded);
            }
            record
        };
        self.updated.notify_waiters();
        record
    }

    /// Refresh the stamp of an in-transition region without changing its
    /// state. Used when a region server reports it is still working on it.
    pub fn update_timestamp(&self, region: &RegionInfo) -> Option<RegionStateRecord> {
        self.set_stamp(&region.encoded_name(), now_millis())
    }

    /// Zero the stamp so the timeout monitor acts on the region at its next
    /// sweep.
    pub fn reset_timestamp(&self, region: &RegionInfo) -> Option<RegionStateRecord> {
        self.set_stamp(&region.encoded_name(), 0)
    }

    fn set_stamp(&self, encoded: &str, stamp: i64) -> Option<RegionStateRecord> {
        let mut inner = self.inner.lock();
        if !inner.in_transition.contains(encoded) {
            return None;
        }
        let record = inner.states.get_mut(encoded)?;
        record.stamp = stamp;
        Some(record.clone())
    }

    /// The region is open on `server`.
    pub fn region_online(&self, region: &RegionInfo, server: ServerName) {
        let encoded = region.encoded_name();
        {
            let mut inner = self.inner.lock();
            inner.states.insert(
                encoded.clone(),
                RegionStateRecord {
                    region: region.clone(),
                    state: RegionState::Open,
                    server: Some(server.clone()),
                    stamp: now_millis(),
                },
            );
            inner.in_transition.remove(&encoded);
            if let Some(previous) = inner.assignments.insert(encoded.clone(), server.clone()) {
                if previous != server {
                    tracing::info!(
                        region = %region,
                        previous = %previous,
                        server = %server,
                        "region moved, clearing holding of previous server"
                    );
                    inner.remove_holding(&previous, &encoded);
                }
            }
            inner
                .holdings
                .entry(server)
                .or_default()
                .insert(encoded, region.clone());
        }
        self.updated.notify_waiters();
    }

    /// The region is not served anywhere and nothing is in progress for it.
    /// The stored record keeps `region`'s flags, so a split parent stays
    /// marked as one.
    pub fn region_offline(&self, region: &RegionInfo) {
        let encoded = region.encoded_name();
        {
            let mut inner = self.inner.lock();
            inner.states.insert(
                encoded.clone(),
                RegionStateRecord {
                    region: region.clone(),
                    state: RegionState::Offline,
                    server: None,
                    stamp: now_millis(),
                },
            );
            inner.in_transition.remove(&encoded);
            inner.remove_assignment(&encoded);
        }
        self.updated.notify_waiters();
    }

    /// Drop everything a dead server held; see [`ServerOfflineOutcome`].
    ///
    /// Regions that were opening on the server get a zero stamp so the
    /// timeout monitor retries them immediately.
    pub fn expire_server_regions(&self, server: &ServerName) -> ServerOfflineOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            let held_map = inner.holdings.remove(server).unwrap_or_default();
            let now = now_millis();

            let mut held = Vec::with_capacity(held_map.len());
            for (encoded, region) in held_map {
                inner.assignments.remove(&encoded);
                if inner.in_transition.contains(&encoded) {
                    continue;
                }
                inner.states.insert(
                    encoded,
                    RegionStateRecord {
                        region: region.clone(),
                        state: RegionState::Offline,
                        server: None,
                        stamp: now,
                    },
                );
                held.push(region);
            }

            let Inner {
                states,
                in_transition,
                ..
            } = &mut *inner;
            let mut affected = Vec::new();
            for encoded in in_transition.iter() {
                let Some(record) = states.get_mut(encoded) else {
                    continue;
                };
                if record.server.as_ref() != Some(server) {
                    continue;
                }
                if record.is_pending_open() || record.is_opening() {
                    record.stamp = 0;
                }
                affected.push(record.clone());
            }

            held.sort_by_key(|r| (!r.is_catalog(), r.encoded_name()));
            affected.sort_by_key(|r| (!r.region.is_catalog(), r.region.encoded_name()));
            ServerOfflineOutcome {
                held,
                in_transition: affected,
            }
        };
        self.updated.notify_waiters();
        outcome
    }

    /// Remove the dead server's holdings and return the in-transition records
    /// that referenced it.
    pub fn server_offline(&self, server: &ServerName) -> Vec<RegionStateRecord> {
        self.expire_server_regions(server).in_transition
    }

    /// Wait until the next mutation or `timeout`. Returns false on timeout.
    /// Notifications that fire before the call are missed, so callers
    /// re-check their condition in a loop.
    pub async fn wait_for_update(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.updated.notified())
            .await
            .is_ok()
    }

    // ── Snapshots ───────────────────────────────────────────────────

    pub fn get(&self, encoded_name: &str) -> Option<RegionStateRecord> {
        self.inner.lock().states.get(encoded_name).cloned()
    }

    pub fn get_region_state(&self, region: &RegionInfo) -> Option<RegionStateRecord> {
        self.get(&region.encoded_name())
    }

    /// The region's record if it is in transition.
    pub fn region_in_transition(&self, region: &RegionInfo) -> Option<RegionStateRecord> {
        let encoded = region.encoded_name();
        let inner = self.inner.lock();
        if !inner.in_transition.contains(&encoded) {
            return None;
        }
        inner.states.get(&encoded).cloned()
    }

    pub fn is_region_in_transition(&self, region: &RegionInfo) -> bool {
        self.inner
            .lock()
            .in_transition
            .contains(&region.encoded_name())
    }

    pub fn regions_in_transition(&self) -> Vec<RegionStateRecord> {
        let inner = self.inner.lock();
        let mut records: Vec<_> = inner
            .in_transition
            .iter()
            .filter_map(|encoded| inner.states.get(encoded).cloned())
            .collect();
        records.sort_by_key(|r| r.stamp);
        records
    }

    pub fn has_regions_in_transition(&self) -> bool {
        !self.inner.lock().in_transition.is_empty()
    }

    pub fn get_region_server(&self, region: &RegionInfo) -> Option<ServerName> {
        self.inner
            .lock()
            .assignments
            .get(&region.encoded_name())
            .cloned()
    }

    pub fn is_region_online(&self, region: &RegionInfo) -> bool {
        self.get_region_server(region).is_some()
    }

    pub fn server_holdings(&self, server: &ServerName) -> Vec<RegionInfo> {
        let inner = self.inner.lock();
        let mut regions: Vec<_> = inner
            .holdings
            .get(server)
            .map(|held| held.values().cloned().collect())
            .unwrap_or_default();
        regions.sort_by_key(RegionInfo::encoded_name);
        regions
    }

    /// Regions per server, for load accounting.
    pub fn assignments_by_server(&self) -> HashMap<ServerName, Vec<RegionInfo>> {
        self.inner
            .lock()
            .holdings
            .iter()
            .map(|(server, held)| (server.clone(), held.values().cloned().collect()))
            .collect()
    }

    pub fn region_assignments(&self) -> HashMap<RegionInfo, ServerName> {
        let inner = self.inner.lock();
        inner
            .assignments
            .iter()
            .filter_map(|(encoded, server)| {
                inner
                    .states
                    .get(encoded)
                    .map(|record| (record.region.clone(), server.clone()))
            })
            .collect()
    }

    pub fn regions_of_table(&self, table: &TableName) -> Vec<RegionStateRecord> {
        self.inner
            .lock()
            .states
            .values()
            .filter(|record| &record.region.table == table)
            .cloned()
            .collect()
    }

    pub fn records(&self) -> Vec<RegionStateRecord> {
        self.inner.lock().states.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn region(start: &[u8]) -> RegionInfo {
        RegionInfo::new(TableName::new("t1"), start, b"", 1)
    }

    fn server(n: u16) -> ServerName {
        ServerName::new(format!("rs{n}"), 16020, 1)
    }

    fn assert_null_server_invariant(states: &RegionStates) {
        for record in states.records() {
            assert_eq!(
                record.state.is_serverless(),
                record.server.is_none(),
                "{record:?}"
            );
        }
    }

    #[test]
    fn create_region_state_is_idempotent() {
        let states = RegionStates::new();
        let r = region(b"a");
        let first = states.create_region_state(&r);
        assert_eq!(first.state, RegionState::Offline);

        states.update_region_state(&r, RegionState::PendingOpen, Some(server(1)));
        let second = states.create_region_state(&r);
        assert_eq!(second.state, RegionState::PendingOpen);
        assert_eq!(states.create_region_state(&r), second);
    }

    #[test]
    fn serverless_states_drop_the_server() {
        let states = RegionStates::new();
        let r = region(b"a");
        let record = states.update_region_state(&r, RegionState::Closed, Some(server(1)));
        assert_eq!(record.server, None);
        let record = states.update_region_state(&r, RegionState::Offline, Some(server(1)));
        assert_eq!(record.server, None);
        states.update_region_state(&r, RegionState::Opening, Some(server(1)));
        assert_null_server_invariant(&states);
    }

    #[test]
    fn in_transition_membership() {
        let states = RegionStates::new();
        let splitting = region(b"s");
        states.update_region_state(&splitting, RegionState::Splitting, Some(server(1)));
        assert!(!states.is_region_in_transition(&splitting));

        // A close without a server is not tracked, even for an assigned
        // region; the assignment is left alone.
        let open = region(b"o");
        states.region_online(&open, server(2));
        let record = states.update_region_state(&open, RegionState::Closing, None);
        assert_eq!(record.server, None);
        assert!(!states.is_region_in_transition(&open));
        assert_eq!(states.get_region_server(&open), Some(server(2)));

        let record = states.update_region_state(&open, RegionState::PendingClose, Some(server(2)));
        assert_eq!(record.server, Some(server(2)));
        assert!(states.is_region_in_transition(&open));
    }

    #[test]
    fn region_online_keeps_one_owner() {
        let states = RegionStates::new();
        let r = region(b"a");
        states.update_region_state(&r, RegionState::Opening, Some(server(1)));
        states.region_online(&r, server(1));
        assert!(!states.is_region_in_transition(&r));
        assert_eq!(states.server_holdings(&server(1)), vec![r.clone()]);

        states.region_online(&r, server(2));
        assert_eq!(states.get_region_server(&r), Some(server(2)));
        assert!(states.server_holdings(&server(1)).is_empty());
        assert_eq!(states.server_holdings(&server(2)), vec![r.clone()]);

        let owners: Vec<_> = states
            .assignments_by_server()
            .into_iter()
            .filter(|(_, held)| held.contains(&r))
            .collect();
        assert_eq!(owners.len(), 1);
    }

    #[test]
    fn region_offline_clears_assignment() {
        let states = RegionStates::new();
        let r = region(b"a");
        states.region_online(&r, server(1));
        states.region_offline(&r.as_split_parent());
        assert!(!states.is_region_online(&r));
        assert!(states.server_holdings(&server(1)).is_empty());
        let record = states.get_region_state(&r).unwrap();
        assert_eq!(record.state, RegionState::Offline);
        assert!(record.region.is_split_parent());
    }

    #[test]
    fn server_offline_returns_regions_in_transition_on_it() {
        let states = RegionStates::new();
        let dead = server(1);
        let r1 = region(b"r1");
        let r2 = region(b"r2");
        let r3 = region(b"r3");
        states.region_online(&r1, dead.clone());
        states.update_region_state(&r2, RegionState::Opening, Some(dead.clone()));
        states.update_region_state(&r3, RegionState::Opening, Some(server(2)));

        let affected = states.server_offline(&dead);

        assert!(!states.is_region_online(&r1));
        assert!(states.server_holdings(&dead).is_empty());
        assert_eq!(affected.len(), 1);
        assert_eq!(affected[0].region, r2);
        assert_eq!(affected[0].stamp, 0);
        assert_eq!(states.get_region_state(&r2).unwrap().stamp, 0);
        assert_ne!(states.get_region_state(&r3).unwrap().stamp, 0);
        assert_null_server_invariant(&states);
    }

    #[test]
    fn expire_reports_held_regions_catalog_first() {
        let states = RegionStates::new();
        let dead = server(1);
        let user = region(b"a");
        let catalog = RegionInfo::new(TableName::catalog(), b"", b"", 1);
        states.region_online(&user, dead.clone());
        states.region_online(&catalog, dead.clone());

        let outcome = states.expire_server_regions(&dead);
        assert_eq!(outcome.held, vec![catalog, user.clone()]);
        assert_eq!(
            states.get_region_state(&user).unwrap().state,
            RegionState::Offline
        );
    }

    #[test]
    fn timestamps_only_change_for_regions_in_transition() {
        let states = RegionStates::new();
        let r = region(b"a");
        states.region_online(&r, server(1));
        assert!(states.reset_timestamp(&r).is_none());

        states.update_region_state(&r, RegionState::PendingClose, Some(server(1)));
        assert_eq!(states.reset_timestamp(&r).unwrap().stamp, 0);
        assert!(states.update_timestamp(&r).unwrap().stamp > 0);
    }

    #[tokio::test]
    async fn wait_for_update_wakes_on_mutation() {
        let states = Arc::new(RegionStates::new());
        assert!(!states.wait_for_update(Duration::from_millis(20)).await);

        let waiter = {
            let states = Arc::clone(&states);
            tokio::spawn(async move { states.wait_for_update(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        states.region_online(&region(b"a"), server(1));
        assert!(waiter.await.unwrap());
    }
}
