//! Writes of the region transition protocol.
//!
//! Every region in transition has one node at `/unassigned/{encoded_name}`
//! holding a [`RegionTransition`]. The node version is the optimistic
//! concurrency token: each side presents the version it last observed and a
//! write based on a stale view fails instead of clobbering the winner.
//!
//! The master creates the node (OFFLINE before an open, CLOSING before a
//! close) and deletes it once the region settles. Region servers move it
//! forward (OPENING, OPENED, FAILED_OPEN, CLOSED, SPLITTING, SPLIT). Both
//! halves live here so region servers and tests drive the same protocol.

use region_coordination::{CasOutcome, CoordinationClient, ExpectedVersion};

use crate::error::{Error, Result};
use crate::paths;
use crate::types::{EventType, RegionInfo, RegionTransition, ServerName};

/// A decoded transition node and the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionNode {
    pub transition: RegionTransition,
    pub version: i64,
}

pub async fn read(
    client: &dyn CoordinationClient,
    encoded_name: &str,
) -> Result<Option<TransitionNode>> {
    let path = paths::transition_node(encoded_name);
    let Some(node) = client.get_data(&path).await? else {
        return Ok(None);
    };
    let transition = RegionTransition::decode(&node.data)
        .map_err(|e| Error::MalformedTransition(path, e))?;
    Ok(Some(TransitionNode {
        transition,
        version: node.version,
    }))
}

// ── Master side ─────────────────────────────────────────────────

/// Put the region's node into M_ZK_REGION_OFFLINE ahead of an open request.
///
/// Creates the node when absent. An existing node is overwritten only when
/// it shows no region server at work (OFFLINE, master CLOSING, CLOSED,
/// FAILED_OPEN). Returns the new version, or `None` when a region server or
/// a concurrent writer got there first.
pub async fn create_or_force_node_offline(
    client: &dyn CoordinationClient,
    region: &RegionInfo,
    master: &ServerName,
) -> Result<Option<i64>> {
    let encoded = region.encoded_name();
    let path = paths::transition_node(&encoded);
    let data = RegionTransition::new(EventType::MasterRegionOffline, region, master).encode()?;

    let expected = match read(client, &encoded).await {
        Ok(None) => ExpectedVersion::Absent,
        Ok(Some(node)) => {
            let event = node.transition.event_type;
            if !matches!(
                event,
                EventType::MasterRegionOffline
                    | EventType::MasterRegionClosing
                    | EventType::RegionClosed
                    | EventType::RegionFailedOpen
            ) {
                tracing::debug!(
                    region = %encoded,
                    event = %event,
                    "transition node shows a region server acting, not forcing offline"
                );
                return Ok(None);
            }
            ExpectedVersion::Exact(node.version)
        }
        Err(Error::MalformedTransition(path, e)) => {
            tracing::warn!(path = %path, error = %e, "overwriting malformed transition node");
            match client.get_data(&path).await? {
                Some(node) => ExpectedVersion::Exact(node.version),
                None => ExpectedVersion::Absent,
            }
        }
        Err(e) => return Err(e),
    };

    Ok(client.create_or_set(&path, data, expected).await?.version())
}

/// Overwrite whatever the node holds with M_ZK_REGION_OFFLINE, provided it is
/// still at `expected_version`. Used to take a region back from a server
/// that stopped making progress.
pub async fn force_node_offline(
    client: &dyn CoordinationClient,
    region: &RegionInfo,
    master: &ServerName,
    expected_version: i64,
) -> Result<Option<i64>> {
    let path = paths::transition_node(&region.encoded_name());
    let data = RegionTransition::new(EventType::MasterRegionOffline, region, master).encode()?;
    Ok(client
        .create_or_set(&path, data, ExpectedVersion::Exact(expected_version))
        .await?
        .version())
}

/// Create the region's node in M_ZK_REGION_CLOSING ahead of a close request.
/// `None` if a node already exists.
pub async fn create_node_closing(
    client: &dyn CoordinationClient,
    region: &RegionInfo,
    master: &ServerName,
) -> Result<Option<i64>> {
    let path = paths::transition_node(&region.encoded_name());
    let data = RegionTransition::new(EventType::MasterRegionClosing, region, master).encode()?;
    Ok(client
        .create_or_set(&path, data, ExpectedVersion::Absent)
        .await?
        .version())
}

/// Delete the node if it still shows `expected_event` (and, when given, is at
/// `expected_version`). Returns whether it was deleted.
pub async fn delete_node(
    client: &dyn CoordinationClient,
    encoded_name: &str,
    expected_event: EventType,
    expected_version: Option<i64>,
) -> Result<bool> {
    let node = match read(client, encoded_name).await {
        Ok(Some(node)) => node,
        Ok(None) => return Ok(false),
        Err(Error::MalformedTransition(path, e)) => {
            tracing::warn!(path = %path, error = %e, "not deleting malformed transition node");
            return Ok(false);
        }
        Err(e) => return Err(e),
    };
    if node.transition.event_type != expected_event {
        tracing::debug!(
            region = %encoded_name,
            expected = %expected_event,
            actual = %node.transition.event_type,
            "transition node changed, not deleting"
        );
        return Ok(false);
    }
    if expected_version.is_some_and(|v| v != node.version) {
        return Ok(false);
    }
    Ok(client
        .delete(&paths::transition_node(encoded_name), Some(node.version))
        .await?)
}

/// Remove a node left behind by a close, whichever step it reached.
pub async fn delete_closing_or_closed_node(
    client: &dyn CoordinationClient,
    encoded_name: &str,
) -> Result<bool> {
    if delete_node(client, encoded_name, EventType::MasterRegionClosing, None).await? {
        return Ok(true);
    }
    delete_node(client, encoded_name, EventType::RegionClosed, None).await
}

// ── Region server side ──────────────────────────────────────────

/// Move the node from `from` to `to` if it is still at `expected_version`.
///
/// Nodes last written by a region server must have been written by
/// `server`; master-written nodes may be picked up by any server. Returns
/// the new version or `None` if the node moved on.
pub async fn transition_node(
    client: &dyn CoordinationClient,
    region: &RegionInfo,
    server: &ServerName,
    from: EventType,
    to: EventType,
    expected_version: i64,
    payload: Option<Vec<RegionInfo>>,
) -> Result<Option<i64>> {
    let encoded = region.encoded_name();
    let Some(node) = read(client, &encoded).await? else {
        tracing::debug!(region = %encoded, from = %from, to = %to, "transition node gone");
        return Ok(None);
    };
    let current = &node.transition;
    let written_by_master = matches!(
        current.event_type,
        EventType::MasterRegionOffline | EventType::MasterRegionClosing
    );
    if current.event_type != from
        || node.version != expected_version
        || (!written_by_master && current.origin != *server)
    {
        tracing::debug!(
            region = %encoded,
            from = %from,
            to = %to,
            actual = %current.event_type,
            version = node.version,
            expected_version,
            "transition node not in expected state"
        );
        return Ok(None);
    }

    let mut next = RegionTransition::new(to, region, server);
    next.payload = payload;
    let outcome = client
        .create_or_set(
            &paths::transition_node(&encoded),
            next.encode()?,
            ExpectedVersion::Exact(expected_version),
        )
        .await?;
    Ok(match outcome {
        CasOutcome::Written(v) => Some(v),
        CasOutcome::Conflict => None,
    })
}

pub async fn transition_to_opening(
    client: &dyn CoordinationClient,
    region: &RegionInfo,
    server: &ServerName,
    offline_version: i64,
) -> Result<Option<i64>> {
    transition_node(
        client,
        region,
        server,
        EventType::MasterRegionOffline,
        EventType::RegionOpening,
        offline_version,
        None,
    )
    .await
}

pub async fn transition_to_opened(
    client: &dyn CoordinationClient,
    region: &RegionInfo,
    server: &ServerName,
    opening_version: i64,
) -> Result<Option<i64>> {
    transition_node(
        client,
        region,
        server,
        EventType::RegionOpening,
        EventType::RegionOpened,
        opening_version,
        None,
    )
    .await
}

pub async fn transition_to_failed_open(
    client: &dyn CoordinationClient,
    region: &RegionInfo,
    server: &ServerName,
    opening_version: i64,
) -> Result<Option<i64>> {
    transition_node(
        client,
        region,
        server,
        EventType::RegionOpening,
        EventType::RegionFailedOpen,
        opening_version,
        None,
    )
    .await
}

pub async fn transition_to_closing(
    client: &dyn CoordinationClient,
    region: &RegionInfo,
    server: &ServerName,
    closing_version: i64,
) -> Result<Option<i64>> {
    transition_node(
        client,
        region,
        server,
        EventType::MasterRegionClosing,
        EventType::RegionClosing,
        closing_version,
        None,
    )
    .await
}

/// `from` is the master's CLOSING node or the server's own CLOSING step.
pub async fn transition_to_closed(
    client: &dyn CoordinationClient,
    region: &RegionInfo,
    server: &ServerName,
    from: EventType,
    version: i64,
) -> Result<Option<i64>> {
    transition_node(
        client,
        region,
        server,
        from,
        EventType::RegionClosed,
        version,
        None,
    )
    .await
}

/// Announce a split in progress. Fails if any other transition is pending.
pub async fn create_node_splitting(
    client: &dyn CoordinationClient,
    region: &RegionInfo,
    server: &ServerName,
) -> Result<Option<i64>> {
    let path = paths::transition_node(&region.encoded_name());
    let data = RegionTransition::new(EventType::RegionSplitting, region, server).encode()?;
    Ok(client
        .create_or_set(&path, data, ExpectedVersion::Absent)
        .await?
        .version())
}

pub async fn transition_to_split(
    client: &dyn CoordinationClient,
    parent: &RegionInfo,
    server: &ServerName,
    splitting_version: i64,
    daughter_a: &RegionInfo,
    daughter_b: &RegionInfo,
) -> Result<Option<i64>> {
    transition_node(
        client,
        parent,
        server,
        EventType::RegionSplitting,
        EventType::RegionSplit,
        splitting_version,
        Some(vec![daughter_a.clone(), daughter_b.clone()]),
    )
    .await
}
