use crate::error::{AppError, AppResult};
use crate::models::node::{DirectoryNode, HostNodeInfo};
use crate::services::tags::AliasStore;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Raw key/value access to the node directory.
#[async_trait]
pub trait DirectoryBackend: Send + Sync {
    /// Every `(key, value)` whose key starts with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> AppResult<Vec<(String, Vec<u8>)>>;
}

pub struct RedisDirectory {
    connection: MultiplexedConnection,
    timeout: Duration,
}

impl RedisDirectory {
    /// Opens a multiplexed connection and checks it with a PING.
    pub async fn connect(url: &str, limit: Duration) -> AppResult<Self> {
        let client = redis::Client::open(url)?;
        let mut connection = timeout(limit, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| AppError::DirectoryUnavailable(format!("connecting to {} timed out", url)))??;

        let pong: String = timeout(limit, redis::cmd("PING").query_async(&mut connection))
            .await
            .map_err(|_| AppError::DirectoryUnavailable("PING timed out".to_string()))??;
        debug!("Node directory answered {}", pong);

        Ok(Self {
            connection,
            timeout: limit,
        })
    }

    async fn scan(&self, prefix: &str) -> AppResult<Vec<(String, Vec<u8>)>> {
        let mut conn = self.connection.clone();
        let keys: Vec<String> = {
            let mut iter = conn.scan_match::<_, String>(format!("{}*", prefix)).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            // keys can expire between SCAN and GET; one unreadable key (wrong
            // type, oversized value) must not hide the rest of the directory
            match conn.get::<_, Option<Vec<u8>>>(&key).await {
                Ok(Some(value)) => entries.push((key, value)),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable node record {}: {}", key, e),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl DirectoryBackend for RedisDirectory {
    async fn scan_prefix(&self, prefix: &str) -> AppResult<Vec<(String, Vec<u8>)>> {
        timeout(self.timeout, self.scan(prefix))
            .await
            .map_err(|_| AppError::DirectoryUnavailable("node directory scan timed out".to_string()))?
    }
}

/// Live proxy-node lookups, matched to hosts through their aliases.
///
/// Without a backend the directory is disabled and every query reports
/// [`AppError::DirectoryUnavailable`], which callers keep distinct from an
/// empty match.
pub struct NodeDirectory {
    backend: Option<Arc<dyn DirectoryBackend>>,
    key_prefix: String,
    aliases: Arc<AliasStore>,
}

impl NodeDirectory {
    pub fn new(backend: Arc<dyn DirectoryBackend>, key_prefix: impl Into<String>, aliases: Arc<AliasStore>) -> Self {
        Self {
            backend: Some(backend),
            key_prefix: key_prefix.into(),
            aliases,
        }
    }

    pub fn disabled(key_prefix: impl Into<String>, aliases: Arc<AliasStore>) -> Self {
        info!("Node directory disabled, online user counts will be unavailable");
        Self {
            backend: None,
            key_prefix: key_prefix.into(),
            aliases,
        }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    fn backend(&self) -> AppResult<&Arc<dyn DirectoryBackend>> {
        self.backend
            .as_ref()
            .ok_or_else(|| AppError::DirectoryUnavailable("node directory is not configured".to_string()))
    }

    /// Every decodable node under the key prefix. Malformed records are
    /// skipped.
    pub async fn all_nodes(&self) -> AppResult<Vec<DirectoryNode>> {
        let entries = self.backend()?.scan_prefix(&self.key_prefix).await?;

        let mut nodes = Vec::with_capacity(entries.len());
        for (key, raw) in entries {
            match serde_json::from_slice::<DirectoryNode>(&raw) {
                Ok(node) => nodes.push(node),
                Err(e) => warn!("Skipping malformed node record {}: {}", key, e),
            }
        }
        Ok(nodes)
    }

    /// Nodes whose name contains `alias` (case-sensitive). A blank alias
    /// matches nothing and does not touch the backend.
    pub async fn find_nodes_by_alias(&self, alias: &str) -> AppResult<Vec<DirectoryNode>> {
        self.backend()?;
        if alias.trim().is_empty() {
            return Ok(Vec::new());
        }

        let nodes: Vec<DirectoryNode> = self
            .all_nodes()
            .await?
            .into_iter()
            .filter(|node| node.name.contains(alias))
            .collect();
        debug!("Alias {:?} matched {} nodes", alias, nodes.len());
        Ok(nodes)
    }

    pub async fn search(&self, keyword: &str) -> AppResult<Vec<DirectoryNode>> {
        self.find_nodes_by_alias(keyword).await
    }

    /// Nodes behind one host, found through its alias. A host without an
    /// alias has no nodes.
    pub async fn host_node_info(&self, host_id: &str, host_name: &str) -> AppResult<HostNodeInfo> {
        let alias = self.aliases.get(host_id)?.map(|a| a.alias);
        let nodes = match alias.as_deref() {
            Some(alias) => self.find_nodes_by_alias(alias).await?,
            None => {
                self.backend()?;
                Vec::new()
            }
        };
        Ok(HostNodeInfo::new(host_id, host_name, alias, nodes))
    }

    /// Sum of `online` across the host's alias-matched nodes.
    pub async fn online_users(&self, host_id: &str) -> AppResult<u64> {
        self.backend()?;
        let Some(alias) = self.aliases.get(host_id)? else {
            return Ok(0);
        };
        let nodes = self.find_nodes_by_alias(&alias.alias).await?;
        Ok(nodes.iter().map(|n| n.online).sum())
    }
}
