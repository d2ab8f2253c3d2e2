use crate::error::{AppError, AppResult};
use crate::models::config::AggregationConfig;
use crate::models::metrics::{AverageView, FleetSummary, Host, HostLoad, HostStatus, LoadStatus, Sample};
use crate::models::node::{DirectoryNode, HostNodeInfo};
use crate::models::threshold::Threshold;
use crate::services::directory::NodeDirectory;
use crate::services::gateway::MetricsSource;
use crate::services::load;
use crate::services::threshold::ThresholdStore;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Turns raw samples into per-host averages and load statuses.
///
/// Fleet-wide calls degrade per host (zeroed view, unknown online count)
/// instead of failing; single-host calls propagate errors.
pub struct AggregationEngine {
    metrics: Arc<dyn MetricsSource>,
    thresholds: Arc<ThresholdStore>,
    directory: Arc<NodeDirectory>,
    sample_window: usize,
    concurrency: usize,
}

impl AggregationEngine {
    pub fn new(
        metrics: Arc<dyn MetricsSource>,
        thresholds: Arc<ThresholdStore>,
        directory: Arc<NodeDirectory>,
        config: &AggregationConfig,
    ) -> Self {
        Self {
            metrics,
            thresholds,
            directory,
            sample_window: config.sample_window.max(1),
            concurrency: config.fleet_concurrency.max(1),
        }
    }

    pub async fn list_hosts(&self) -> AppResult<Vec<Host>> {
        self.metrics.list_hosts().await
    }

    pub async fn summary(&self) -> AppResult<FleetSummary> {
        Ok(FleetSummary::from_hosts(&self.list_hosts().await?))
    }

    async fn find_host(&self, host_id: &str) -> AppResult<Host> {
        self.list_hosts()
            .await?
            .into_iter()
            .find(|host| host.id == host_id)
            .ok_or_else(|| AppError::NotFound(format!("host {}", host_id)))
    }

    /// Most recent raw samples for one host.
    pub async fn host_samples(&self, host_id: &str, limit: usize) -> AppResult<Vec<Sample>> {
        self.metrics.list_recent_samples(host_id, limit).await
    }

    /// `None` when the node directory is unavailable, `Some(0)` when the host
    /// has no alias or its lookup failed otherwise.
    async fn online_users(&self, host_id: &str) -> Option<u64> {
        match self.directory.online_users(host_id).await {
            Ok(count) => Some(count),
            Err(AppError::DirectoryUnavailable(reason)) => {
                debug!("Online users for host {} unavailable: {}", host_id, reason);
                None
            }
            Err(e) => {
                warn!("Failed to count online users for host {}: {}", host_id, e);
                Some(0)
            }
        }
    }

    async fn try_build_view(&self, host: &Host) -> AppResult<AverageView> {
        let samples = self.metrics.list_recent_samples(&host.id, self.sample_window).await?;
        let online_users = self.online_users(&host.id).await;
        Ok(average_view(host.clone(), &samples, online_users))
    }

    /// Average view for one host. Sample fetch failures yield a zeroed view.
    pub async fn build_view(&self, host: &Host) -> AverageView {
        match self.try_build_view(host).await {
            Ok(view) => view,
            Err(e) => {
                warn!("Failed to fetch samples for host {} ({}): {}", host.id, host.name, e);
                AverageView::zeroed(host.clone(), self.online_users(&host.id).await)
            }
        }
    }

    /// One view per host, in input order. At most `concurrency` hosts are
    /// fetched at a time; dropping the future stops further requests.
    pub async fn build_fleet_view(&self, hosts: &[Host]) -> Vec<AverageView> {
        let views: futures::future::BoxFuture<'_, Vec<AverageView>> = Box::pin(
            stream::iter(hosts.iter())
                .map(|host| self.build_view(host))
                .buffered(self.concurrency)
                .collect(),
        );
        views.await
    }

    /// Load status for a view, then feeds the observed rates back into the
    /// host's learned ceilings.
    pub fn evaluate(&self, view: &AverageView) -> LoadStatus {
        let threshold = self.threshold_or_default(&view.host.id);
        let status = load::evaluate(view, &threshold);

        if let Err(e) = self
            .thresholds
            .update_learned_ceiling(&view.host.id, view.net_up_mbps(), view.net_down_mbps())
        {
            warn!("Failed to update network ceilings for host {}: {}", view.host.id, e);
        }
        status
    }

    fn threshold_or_default(&self, host_id: &str) -> Threshold {
        self.thresholds.get_or_create_default(host_id).unwrap_or_else(|e| {
            warn!("Falling back to default threshold for host {}: {}", host_id, e);
            Threshold::with_defaults(host_id)
        })
    }

    pub async fn fleet_status(&self) -> AppResult<Vec<HostLoad>> {
        let hosts = self.list_hosts().await?;
        let views = self.build_fleet_view(&hosts).await;

        let loads: Vec<HostLoad> = views
            .into_iter()
            .map(|view| {
                let load_status = self.evaluate(&view);
                HostLoad { view, load_status }
            })
            .collect();

        let high = loads.iter().filter(|l| l.load_status == LoadStatus::High).count();
        info!("Evaluated {} hosts, {} under high load", loads.len(), high);
        Ok(loads)
    }

    /// Fleet views keyed by host id, for batch lookups. A failed host listing
    /// yields an empty map.
    pub async fn fleet_views_by_host(&self) -> HashMap<String, AverageView> {
        let hosts = match self.list_hosts().await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!("Failed to list hosts for batch evaluation: {}", e);
                return HashMap::new();
            }
        };

        self.build_fleet_view(&hosts)
            .await
            .into_iter()
            .map(|view| (view.host.id.clone(), view))
            .collect()
    }

    pub async fn host_status(&self, host_id: &str) -> AppResult<HostLoad> {
        let host = self.find_host(host_id).await?;
        let view = self.try_build_view(&host).await?;
        let load_status = self.evaluate(&view);
        Ok(HostLoad { view, load_status })
    }

    pub async fn host_node_info(&self, host_id: &str) -> AppResult<HostNodeInfo> {
        let host = self.find_host(host_id).await?;
        self.directory.host_node_info(&host.id, &host.name).await
    }

    /// Node info for every host. Hosts whose lookup fails are left out.
    pub async fn all_node_info(&self) -> AppResult<Vec<HostNodeInfo>> {
        if !self.directory.is_available() {
            return Err(AppError::DirectoryUnavailable("node directory is not configured".to_string()));
        }
        let hosts = self.list_hosts().await?;
        Ok(self.node_info_for(hosts.iter()).await)
    }

    pub async fn search_nodes(&self, keyword: &str) -> AppResult<Vec<DirectoryNode>> {
        self.directory.search(keyword).await
    }

    /// Node info for hosts that are unreachable or under high load.
    pub async fn high_load_nodes(&self) -> AppResult<Vec<HostNodeInfo>> {
        if !self.directory.is_available() {
            return Err(AppError::DirectoryUnavailable("node directory is not configured".to_string()));
        }
        let loads = self.fleet_status().await?;
        let flagged = loads
            .iter()
            .filter(|l| l.load_status == LoadStatus::High || l.view.host.status != HostStatus::Up)
            .map(|l| &l.view.host);
        Ok(self.node_info_for(flagged).await)
    }

    async fn node_info_for<'a>(&self, hosts: impl Iterator<Item = &'a Host>) -> Vec<HostNodeInfo> {
        let mut infos = Vec::new();
        for host in hosts {
            match self.directory.host_node_info(&host.id, &host.name).await {
                Ok(info) => infos.push(info),
                Err(e) => warn!("Skipping node info for host {}: {}", host.id, e),
            }
        }
        infos
    }
}

/// Averages `samples` into a view of `host`. No samples gives a zeroed view.
pub fn average_view(host: Host, samples: &[Sample], online_users: Option<u64>) -> AverageView {
    if samples.is_empty() {
        return AverageView::zeroed(host, online_users);
    }

    let n = samples.len() as f64;
    let mean = |f: fn(&Sample) -> f64| samples.iter().map(f).sum::<f64>() / n;
    let last_update = samples
        .iter()
        .map(|s| s.created_at)
        .max()
        .unwrap_or_else(chrono::Utc::now);

    AverageView {
        avg_cpu: mean(|s: &Sample| s.cpu),
        avg_mem_pct: mean(|s: &Sample| s.effective_mem_pct()),
        avg_net_sent: mean(|s: &Sample| s.net_sent),
        avg_net_recv: mean(|s: &Sample| s.net_recv),
        online_users,
        last_update,
        host,
    }
}
