use region_coordination::client::join_path;

use crate::types::{ServerName, TableName};

pub const UNASSIGNED_DIR: &str = "/unassigned";
pub const SERVERS_DIR: &str = "/rs";
pub const TABLES_DIR: &str = "/table";
pub const CATALOG_DIR: &str = "/catalog";

/// Path of a region's transition node.
pub fn transition_node(encoded_name: &str) -> String {
    join_path(UNASSIGNED_DIR, encoded_name)
}

/// Prefix that matches every transition node and nothing else.
pub fn transition_prefix() -> String {
    format!("{UNASSIGNED_DIR}/")
}

pub fn server_node(server: &ServerName) -> String {
    join_path(SERVERS_DIR, &server.to_string())
}

pub fn servers_prefix() -> String {
    format!("{SERVERS_DIR}/")
}

pub fn table_node(table: &TableName) -> String {
    join_path(TABLES_DIR, table.as_str())
}

pub fn catalog_row(encoded_name: &str) -> String {
    join_path(CATALOG_DIR, encoded_name)
}
