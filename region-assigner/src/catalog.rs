use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use region_coordination::client::{read_json, write_json};
use region_coordination::{CasOutcome, CoordinationClient, ExpectedVersion};

use crate::error::{Error, Result};
use crate::paths;
use crate::types::{RegionInfo, ServerName};

/// One row of the catalog table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRow {
    pub region: RegionInfo,
    /// Last server the region was opened on.
    pub server: Option<ServerName>,
    /// Daughters of a split parent, until the parent is garbage collected.
    #[serde(default)]
    pub split_a: Option<RegionInfo>,
    #[serde(default)]
    pub split_b: Option<RegionInfo>,
}

impl CatalogRow {
    pub fn new(region: RegionInfo, server: Option<ServerName>) -> Self {
        Self {
            region,
            server,
            split_a: None,
            split_b: None,
        }
    }
}

#[async_trait]
pub trait CatalogTable: Send + Sync {
    async fn scan(&self) -> Result<Vec<CatalogRow>>;

    async fn get(&self, region: &RegionInfo) -> Result<Option<CatalogRow>>;

    async fn put(&self, row: CatalogRow) -> Result<()>;

    async fn update_location(&self, region: &RegionInfo, server: &ServerName) -> Result<()>;

    /// Mark `parent` as split into `a` and `b` and add rows for both
    /// daughters on `server`.
    async fn split_parent(
        &self,
        parent: &RegionInfo,
        a: &RegionInfo,
        b: &RegionInfo,
        server: &ServerName,
    ) -> Result<()>;

    async fn remove_daughter_references(&self, parent: &RegionInfo) -> Result<()>;

    async fn delete_region(&self, region: &RegionInfo) -> Result<()>;
}

/// Catalog rows stored as JSON nodes under `/catalog` in the coordination
/// service.
pub struct CoordinationCatalog {
    client: Arc<dyn CoordinationClient>,
}

impl CoordinationCatalog {
    pub fn new(client: Arc<dyn CoordinationClient>) -> Self {
        Self { client }
    }

    /// Read-modify-write of one row, retried on conflict.
    async fn modify<F>(&self, region: &RegionInfo, mut f: F) -> Result<()>
    where
        F: FnMut(Option<CatalogRow>) -> Option<CatalogRow> + Send,
    {
        let path = paths::catalog_row(&region.encoded_name());
        loop {
            let current = read_json::<CatalogRow>(self.client.as_ref(), &path).await?;
            let expected = match &current {
                Some((_, version)) => ExpectedVersion::Exact(*version),
                None => ExpectedVersion::Absent,
            };
            let Some(next) = f(current.map(|(row, _)| row)) else {
                return Ok(());
            };
            match write_json(self.client.as_ref(), &path, &next, expected).await? {
                CasOutcome::Written(_) => return Ok(()),
                CasOutcome::Conflict => {
                    tracing::debug!(region = %region, "catalog row changed concurrently, retrying");
                }
            }
        }
    }
}

#[async_trait]
impl CatalogTable for CoordinationCatalog {
    async fn scan(&self) -> Result<Vec<CatalogRow>> {
        let mut rows = Vec::new();
        for child in self.client.list_children(paths::CATALOG_DIR).await? {
            let path = paths::catalog_row(&child);
            if let Some((row, _)) = read_json::<CatalogRow>(self.client.as_ref(), &path).await? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    async fn get(&self, region: &RegionInfo) -> Result<Option<CatalogRow>> {
        let path = paths::catalog_row(&region.encoded_name());
        Ok(read_json::<CatalogRow>(self.client.as_ref(), &path)
            .await?
            .map(|(row, _)| row))
    }

    async fn put(&self, row: CatalogRow) -> Result<()> {
        let region = row.region.clone();
        self.modify(&region, |_| Some(row.clone())).await
    }

    async fn update_location(&self, region: &RegionInfo, server: &ServerName) -> Result<()> {
        self.modify(region, |current| {
            let mut row = current.unwrap_or_else(|| CatalogRow::new(region.clone(), None));
            row.server = Some(server.clone());
            Some(row)
        })
        .await
    }

    async fn split_parent(
        &self,
        parent: &RegionInfo,
        a: &RegionInfo,
        b: &RegionInfo,
        server: &ServerName,
    ) -> Result<()> {
        self.modify(parent, |current| {
            let mut row = current.unwrap_or_else(|| CatalogRow::new(parent.clone(), None));
            row.region = parent.as_split_parent();
            row.split_a = Some(a.clone());
            row.split_b = Some(b.clone());
            Some(row)
        })
        .await?;
        for daughter in [a, b] {
            self.put(CatalogRow::new(daughter.clone(), Some(server.clone())))
                .await?;
        }
        Ok(())
    }

    async fn remove_daughter_references(&self, parent: &RegionInfo) -> Result<()> {
        self.modify(parent, |current| {
            let mut row = current?;
            row.split_a = None;
            row.split_b = None;
            Some(row)
        })
        .await
    }

    async fn delete_region(&self, region: &RegionInfo) -> Result<()> {
        let path = paths::catalog_row(&region.encoded_name());
        self.client.delete(&path, None).await?;
        Ok(())
    }
}

// ── Region storage ──────────────────────────────────────────────

/// The part of region storage the catalog janitor needs.
#[async_trait]
pub trait RegionFileSystem: Send + Sync {
    /// Whether the region's store files still include references into a
    /// split parent.
    async fn has_references(&self, region: &RegionInfo) -> Result<bool>;

    /// Move a garbage collected region's files to the archive.
    async fn archive_region(&self, region: &RegionInfo) -> Result<()>;
}

/// Suffix of a reference file pointing into a parent's store file.
pub const REFERENCE_SUFFIX: &str = ".ref";

/// Regions laid out as `{root}/{table}/{encoded_name}/{family}/{file}` on a
/// local disk. Archived regions move to `{root}/.archive/{table}/`.
pub struct LocalRegionFileSystem {
    root: PathBuf,
}

impl LocalRegionFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn region_dir(&self, region: &RegionInfo) -> PathBuf {
        self.root
            .join(region.table.as_str())
            .join(region.encoded_name())
    }

    pub fn archive_dir(&self, region: &RegionInfo) -> PathBuf {
        self.root
            .join(".archive")
            .join(region.table.as_str())
            .join(region.encoded_name())
    }
}

async fn contains_reference(dir: &Path) -> Result<bool> {
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(REFERENCE_SUFFIX))
            {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[async_trait]
impl RegionFileSystem for LocalRegionFileSystem {
    async fn has_references(&self, region: &RegionInfo) -> Result<bool> {
        contains_reference(&self.region_dir(region)).await
    }

    async fn archive_region(&self, region: &RegionInfo) -> Result<()> {
        let source = self.region_dir(region);
        if !tokio::fs::try_exists(&source).await? {
            tracing::debug!(region = %region, "no region directory to archive");
            return Ok(());
        }
        let target = self.archive_dir(region);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&source, &target)
            .await
            .map_err(|e| Error::Catalog(format!("archiving {}: {e}", source.display())))?;
        tracing::info!(region = %region, archive = %target.display(), "archived region files");
        Ok(())
    }
}
