mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{table_regions, test_config, wait_until, Behavior, TestCluster};
use region_assigner::master::MasterConfig;
use region_assigner::transition;
use region_assigner::types::{EventType, RegionState, ServerName};

fn short_timeout_config(timeout: Duration) -> MasterConfig {
    let mut config = test_config();
    config.timeout_monitor.timeout = timeout;
    config
}

#[tokio::test]
async fn test_sweep_reports_without_acting_before_deadline() {
    let cluster = TestCluster::new(test_config());
    let region = table_regions("metrics", 1).remove(0);
    cluster
        .am()
        .region_states()
        .update_region_state(&region, RegionState::Offline, None);

    let report = cluster.master.timeout_monitor().sweep();
    assert_eq!(report.in_transition, 1);
    assert_eq!(report.over_threshold, 0);
    assert_eq!(report.acted_on, 0);
    // No servers registered at all.
    assert!(cluster.am().all_servers_offline());
}

#[tokio::test]
async fn test_stuck_pending_open_is_reassigned() {
    let mut cluster = TestCluster::new(short_timeout_config(Duration::from_millis(300)));
    let stuck = cluster.add_server("rs1").await;
    cluster.rpc.set_behavior(&stuck, Behavior::Silent);
    let regions = table_regions("metrics", 2);
    cluster.seed_catalog(&regions).await;
    cluster.start_and_wait_ready().await;

    // From now on rs1 refuses connections, so the retry lands on rs2.
    let healthy = cluster.add_server("rs2").await;
    cluster.rpc.set_behavior(&stuck, Behavior::Unreachable);

    cluster.wait_online(&regions).await;
    for region in &regions {
        assert_eq!(cluster.server_of(region), Some(healthy.clone()));
    }
    cluster.wait_no_transition_nodes().await;
}

#[tokio::test]
async fn test_stuck_opening_is_taken_back_and_reassigned() {
    let mut cluster = TestCluster::new(short_timeout_config(Duration::from_secs(1)));
    let stuck = cluster.add_server("rs1").await;
    cluster.rpc.set_behavior(&stuck, Behavior::Silent);
    let regions = table_regions("metrics", 1);
    cluster.seed_catalog(&regions).await;
    cluster.start_and_wait_ready().await;
    let region = regions[0].clone();

    // rs1 picks up the OFFLINE node and then hangs in OPENING.
    let node = transition::read(&cluster.coordination, &region.encoded_name())
        .await
        .unwrap()
        .expect("offline node should exist");
    assert_eq!(node.transition.event_type, EventType::MasterRegionOffline);
    transition::transition_to_opening(&cluster.coordination, &region, &stuck, node.version)
        .await
        .unwrap()
        .expect("opening transition should apply");
    {
        let am = Arc::clone(cluster.am());
        let region = region.clone();
        wait_until(move || {
            am.region_states()
                .region_in_transition(&region)
                .is_some_and(|r| r.state == RegionState::Opening)
        })
        .await;
    }

    let healthy = cluster.add_server("rs2").await;
    cluster.rpc.set_behavior(&stuck, Behavior::Unreachable);
    cluster.wait_online(&regions).await;
    assert_eq!(cluster.server_of(&region), Some(healthy));
}

#[tokio::test]
async fn test_opening_region_already_opened_is_left_alone() {
    let mut cluster = TestCluster::new(test_config());
    let server = cluster.add_server("rs1").await;
    let region = table_regions("metrics", 1).remove(0);
    let master = ServerName::new("master", 16000, 1);

    let offline = transition::create_or_force_node_offline(&cluster.coordination, &region, &master)
        .await
        .unwrap()
        .unwrap();
    let opening = transition::transition_to_opening(&cluster.coordination, &region, &server, offline)
        .await
        .unwrap()
        .unwrap();
    transition::transition_to_opened(&cluster.coordination, &region, &server, opening)
        .await
        .unwrap()
        .unwrap();
    let record = cluster.am().region_states().update_region_state(
        &region,
        RegionState::Opening,
        Some(server.clone()),
    );

    cluster
        .am()
        .retry_stuck_opening(&region, record.stamp)
        .await
        .unwrap();

    let rit = cluster.am().region_states().region_in_transition(&region).unwrap();
    assert_eq!(rit.state, RegionState::Opening);
    let node = transition::read(&cluster.coordination, &region.encoded_name())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.transition.event_type, EventType::RegionOpened);
    assert_eq!(cluster.rpc.open_count(&server), 0);
}

#[tokio::test]
async fn test_stuck_close_is_sent_again() {
    let mut cluster = TestCluster::new(short_timeout_config(Duration::from_millis(300)));
    let server = cluster.add_server("rs1").await;
    let regions = table_regions("metrics", 1);
    cluster.seed_catalog(&regions).await;
    cluster.start_and_wait_ready().await;
    cluster.wait_online(&regions).await;
    cluster.wait_no_transition_nodes().await;

    // rs1 takes the close but never reports back.
    cluster.rpc.set_behavior(&server, Behavior::Silent);
    cluster.am().unassign(&regions[0], false, None).await.unwrap();
    assert_eq!(cluster.rpc.close_count(&server), 1);

    let rpc = Arc::clone(&cluster.rpc);
    wait_until(move || rpc.close_count(&server) >= 2).await;
}
