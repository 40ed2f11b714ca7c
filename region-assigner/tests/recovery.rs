mod common;

use common::{table_regions, test_config, TestCluster, REGION_SERVER_PORT};
use region_assigner::catalog::CatalogTable;
use region_assigner::transition;
use region_assigner::types::{RegionInfo, ServerName};
use region_coordination::memory::MemoryCoordination;

fn previous_master() -> ServerName {
    ServerName::new("master", 16000, 1)
}

/// Leave `region` the way a previous master and `server` left it: an
/// OFFLINE node moved forward to OPENING, and to OPENED if `opened`.
async fn leave_open_in_progress(
    coordination: &MemoryCoordination,
    region: &RegionInfo,
    server: &ServerName,
    opened: bool,
) {
    let offline = transition::create_or_force_node_offline(coordination, region, &previous_master())
        .await
        .unwrap()
        .unwrap();
    let opening = transition::transition_to_opening(coordination, region, server, offline)
        .await
        .unwrap()
        .unwrap();
    if opened {
        transition::transition_to_opened(coordination, region, server, opening)
            .await
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_new_master_adopts_open_regions() {
    let mut cluster = TestCluster::new(test_config());
    cluster.add_server("rs1").await;
    cluster.add_server("rs2").await;
    let regions = table_regions("accounts", 6);
    cluster.seed_catalog(&regions).await;
    cluster.start_and_wait_ready().await;
    cluster.wait_online(&regions).await;
    cluster.wait_catalog_locations(&regions).await;
    let before = cluster.am().region_states().region_assignments();
    let opens = cluster.rpc.total_opens();

    cluster.fail_over().await;
    cluster.wait_online(&regions).await;

    assert_eq!(cluster.am().region_states().region_assignments(), before);
    assert_eq!(cluster.rpc.total_opens(), opens);
}

#[tokio::test]
async fn test_opened_node_left_behind_is_completed() {
    let mut cluster = TestCluster::new(test_config());
    let server = cluster.add_server("rs1").await;
    let regions = table_regions("accounts", 1);
    cluster.seed_catalog(&regions).await;
    let region = regions[0].clone();
    leave_open_in_progress(&cluster.coordination, &region, &server, true).await;
    cluster.rpc.host(&server, &region);

    cluster.start_and_wait_ready().await;
    cluster.wait_online(&regions).await;
    cluster.wait_no_transition_nodes().await;

    assert_eq!(cluster.server_of(&region), Some(server.clone()));
    assert_eq!(cluster.rpc.open_count(&server), 0);
    let row = cluster.catalog.get(&region).await.unwrap().unwrap();
    assert_eq!(row.server, Some(server));
}

#[tokio::test]
async fn test_region_opening_on_dead_server_is_taken_back() {
    let mut cluster = TestCluster::new(test_config());
    let live = cluster.add_server("rs1").await;
    let dead = ServerName::new("rs9", REGION_SERVER_PORT, 1);
    let regions = table_regions("accounts", 2);
    cluster.seed_catalog(&regions).await;
    leave_open_in_progress(&cluster.coordination, &regions[0], &dead, false).await;

    cluster.start_and_wait_ready().await;
    cluster.wait_online(&regions).await;
    for region in &regions {
        assert_eq!(cluster.server_of(region), Some(live.clone()));
    }
}

#[tokio::test]
async fn test_split_finished_by_dead_server_is_completed() {
    let mut cluster = TestCluster::new(test_config());
    let live = cluster.add_server("rs1").await;
    let dead = ServerName::new("rs9", REGION_SERVER_PORT, 1);
    let parent = table_regions("accounts", 1).remove(0);
    cluster.seed_catalog(std::slice::from_ref(&parent)).await;
    let (a, b) = parent.daughters(b"k", 2);
    let splitting = transition::create_node_splitting(&cluster.coordination, &parent, &dead)
        .await
        .unwrap()
        .unwrap();
    transition::transition_to_split(&cluster.coordination, &parent, &dead, splitting, &a, &b)
        .await
        .unwrap()
        .unwrap();

    cluster.start_and_wait_ready().await;
    cluster.wait_online(&[a.clone(), b.clone()]).await;
    cluster.wait_no_transition_nodes().await;

    assert!(!cluster.am().region_states().is_region_online(&parent));
    assert_eq!(cluster.server_of(&a), Some(live.clone()));
    assert_eq!(cluster.server_of(&b), Some(live));
    let row = cluster.catalog.get(&parent).await.unwrap().unwrap();
    assert!(row.region.is_split_parent());
}
