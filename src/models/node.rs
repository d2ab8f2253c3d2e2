use serde::{Deserialize, Serialize};

/// A live proxy node record from the node directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub name: String,
    pub id: i64,
    #[serde(rename = "type")]
    pub node_type: String,
    pub online: u64,
    #[serde(default)]
    pub last_update: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostNodeInfo {
    pub host_id: String,
    pub host_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub nodes: Vec<DirectoryNode>,
    pub total_online: u64,
}

impl HostNodeInfo {
    pub fn new(host_id: &str, host_name: &str, alias: Option<String>, nodes: Vec<DirectoryNode>) -> Self {
        let total_online = nodes.iter().map(|n| n.online).sum();
        Self {
            host_id: host_id.to_string(),
            host_name: host_name.to_string(),
            alias,
            nodes,
            total_online,
        }
    }
}
