use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use region_coordination::client::{read_json, write_json};
use region_coordination::{CasOutcome, CoordinationClient, ExpectedVersion};

use crate::error::Result;
use crate::paths;
use crate::types::TableName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableState {
    Enabled,
    Disabling,
    Disabled,
    Enabling,
}

/// Enabled/disabled state of every table, cached in memory and persisted
/// under `/table/{name}` so a new master sees tables left half disabled.
/// Tables without a node are enabled.
pub struct TableStateManager {
    client: Arc<dyn CoordinationClient>,
    states: RwLock<HashMap<TableName, TableState>>,
}

impl TableStateManager {
    pub fn new(client: Arc<dyn CoordinationClient>) -> Self {
        Self {
            client,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the cache with what is persisted.
    pub async fn load(&self) -> Result<()> {
        let mut loaded = HashMap::new();
        for name in self.client.list_children(paths::TABLES_DIR).await? {
            let table = TableName::new(name);
            if let Some((state, _)) =
                read_json::<TableState>(self.client.as_ref(), &paths::table_node(&table)).await?
            {
                loaded.insert(table, state);
            }
        }
        tracing::info!(tables = loaded.len(), "loaded table states");
        *self.states.write() = loaded;
        Ok(())
    }

    pub async fn set_state(&self, table: &TableName, state: TableState) -> Result<()> {
        let path = paths::table_node(table);
        loop {
            let expected = match read_json::<TableState>(self.client.as_ref(), &path).await? {
                Some((_, version)) => ExpectedVersion::Exact(version),
                None => ExpectedVersion::Absent,
            };
            if let CasOutcome::Written(_) =
                write_json(self.client.as_ref(), &path, &state, expected).await?
            {
                break;
            }
        }
        self.states.write().insert(table.clone(), state);
        tracing::info!(table = %table, state = ?state, "table state changed");
        Ok(())
    }

    pub fn get_state(&self, table: &TableName) -> TableState {
        self.states
            .read()
            .get(table)
            .copied()
            .unwrap_or(TableState::Enabled)
    }

    pub fn is_disabling_or_disabled(&self, table: &TableName) -> bool {
        matches!(
            self.get_state(table),
            TableState::Disabling | TableState::Disabled
        )
    }

    pub fn is_disabling(&self, table: &TableName) -> bool {
        self.get_state(table) == TableState::Disabling
    }

    pub fn is_disabled(&self, table: &TableName) -> bool {
        self.get_state(table) == TableState::Disabled
    }
}
