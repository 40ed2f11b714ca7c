mod common;

use std::sync::Arc;

use common::{catalog_region, table_regions, test_config, wait_until, TestCluster};
use region_assigner::catalog::CatalogTable;
use region_assigner::catalog_janitor::JanitorScanResult;
use region_assigner::types::ServerName;

fn server() -> ServerName {
    ServerName::new("rs1", common::REGION_SERVER_PORT, 1)
}

#[tokio::test]
async fn test_scan_without_split_parents_cleans_nothing() {
    let cluster = TestCluster::new(test_config());
    let mut regions = table_regions("docs", 3);
    regions.push(catalog_region());
    cluster.seed_catalog(&regions).await;

    let result = cluster.master.janitor().scan().await.unwrap();
    assert_eq!(result.scanned, 4);
    assert_eq!(result.split_parents, 0);
    assert_eq!(result.cleaned, 0);
}

#[tokio::test]
async fn test_parent_is_removed_once_daughters_drop_references() {
    let cluster = TestCluster::new(test_config());
    let parent = table_regions("docs", 1).remove(0);
    cluster.seed_catalog(std::slice::from_ref(&parent)).await;
    let (a, b) = parent.daughters(b"m", 2);
    cluster.catalog.split_parent(&parent, &a, &b, &server()).await.unwrap();
    cluster.fs.set_references(&a, true);

    let janitor = cluster.master.janitor();
    let result = janitor.scan().await.unwrap();
    assert_eq!(result.split_parents, 1);
    assert_eq!(result.cleaned, 0);
    assert!(cluster.catalog.get(&parent).await.unwrap().is_some());
    assert!(cluster.fs.archived().is_empty());

    cluster.fs.set_references(&a, false);
    let result = janitor.scan().await.unwrap();
    assert_eq!(result.cleaned, 1);
    assert!(cluster.catalog.get(&parent).await.unwrap().is_none());
    assert_eq!(cluster.fs.archived(), vec![parent.clone()]);
    for daughter in [&a, &b] {
        let row = cluster.catalog.get(daughter).await.unwrap().unwrap();
        assert_eq!(row.server, Some(server()));
    }
}

#[tokio::test]
async fn test_daughter_that_split_again_waits_for_its_parent() {
    let cluster = TestCluster::new(test_config());
    let root = table_regions("docs", 1).remove(0);
    cluster.seed_catalog(std::slice::from_ref(&root)).await;
    let (a, b) = root.daughters(b"m", 2);
    cluster.catalog.split_parent(&root, &a, &b, &server()).await.unwrap();
    let (a1, a2) = a.daughters(b"f", 3);
    cluster.catalog.split_parent(&a, &a1, &a2, &server()).await.unwrap();

    // `a` still holds references into `root`; its own daughters hold none.
    cluster.fs.set_references(&a, true);
    let janitor = cluster.master.janitor();
    let result = janitor.scan().await.unwrap();
    assert_eq!(result.split_parents, 2);
    assert_eq!(result.cleaned, 0);
    assert!(cluster.catalog.get(&a).await.unwrap().is_some());

    cluster.fs.set_references(&a, false);
    let result = janitor.scan().await.unwrap();
    assert_eq!(result.cleaned, 2);
    assert!(cluster.catalog.get(&root).await.unwrap().is_none());
    assert!(cluster.catalog.get(&a).await.unwrap().is_none());
    assert_eq!(cluster.fs.archived(), vec![root, a]);
}

#[tokio::test]
async fn test_scan_requested_while_another_runs_does_nothing() {
    let cluster = TestCluster::new(test_config());
    let parent = table_regions("docs", 1).remove(0);
    cluster.seed_catalog(std::slice::from_ref(&parent)).await;
    let (a, b) = parent.daughters(b"m", 2);
    cluster.catalog.split_parent(&parent, &a, &b, &server()).await.unwrap();

    let gate = cluster.fs.hold_reference_checks();
    let janitor = Arc::clone(cluster.master.janitor());
    let first = {
        let janitor = Arc::clone(&janitor);
        tokio::spawn(async move { janitor.scan().await })
    };
    let fs = Arc::clone(&cluster.fs);
    wait_until(move || fs.held_reference_checks() == 1).await;

    let second = janitor.scan().await.unwrap();
    assert_eq!(second, JanitorScanResult::default());
    assert!(cluster.catalog.get(&parent).await.unwrap().is_some());

    gate.add_permits(1);
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.split_parents, 1);
    assert_eq!(first.cleaned, 1);
    assert!(cluster.catalog.get(&parent).await.unwrap().is_none());

    // The guard is released once the first scan is done.
    let third = janitor.scan().await.unwrap();
    assert_eq!(third.split_parents, 0);
}
