use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reachability as reported by the metrics API. Anything other than
/// `up`/`down` (paused, pending, ...) is `unknown`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Up,
    Down,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: String,
    pub status: HostStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: String,
    pub host_id: String,
    pub granularity: String,
    pub cpu: f64,
    pub mem_total: f64,
    pub mem_used: f64,
    pub mem_pct: f64,
    pub net_sent: f64,
    pub net_recv: f64,
    pub created_at: DateTime<Utc>,
}

impl Sample {
    /// Reported memory percent, or used/total when the source left it at zero.
    pub fn effective_mem_pct(&self) -> f64 {
        if self.mem_pct == 0.0 && self.mem_total > 0.0 {
            self.mem_used / self.mem_total * 100.0
        } else {
            self.mem_pct
        }
    }
}

/// Rolling average over a host's most recent samples.
///
/// `online_users` is `None` when the node directory could not be reached,
/// which is distinct from `Some(0)` (no alias, or no matching nodes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AverageView {
    #[serde(flatten)]
    pub host: Host,
    pub avg_cpu: f64,
    pub avg_mem_pct: f64,
    pub avg_net_sent: f64,
    pub avg_net_recv: f64,
    pub online_users: Option<u64>,
    pub last_update: DateTime<Utc>,
}

impl AverageView {
    pub fn zeroed(host: Host, online_users: Option<u64>) -> Self {
        Self {
            host,
            avg_cpu: 0.0,
            avg_mem_pct: 0.0,
            avg_net_sent: 0.0,
            avg_net_recv: 0.0,
            online_users,
            last_update: Utc::now(),
        }
    }

    /// Observed upload rate in Mbps (rates are stored per-byte).
    pub fn net_up_mbps(&self) -> f64 {
        self.avg_net_sent * 8.0
    }

    pub fn net_down_mbps(&self) -> f64 {
        self.avg_net_recv * 8.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Normal,
    High,
    NoData,
    NotFound,
}

impl std::fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadStatus::Normal => write!(f, "normal"),
            LoadStatus::High => write!(f, "high"),
            LoadStatus::NoData => write!(f, "no_data"),
            LoadStatus::NotFound => write!(f, "not_found"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostLoad {
    #[serde(flatten)]
    pub view: AverageView,
    pub load_status: LoadStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSummary {
    pub total: u64,
    pub online: u64,
    pub offline: u64,
    pub unknown: u64,
}

impl FleetSummary {
    pub fn from_hosts(hosts: &[Host]) -> Self {
        let mut summary = FleetSummary {
            total: hosts.len() as u64,
            ..Default::default()
        };
        for host in hosts {
            match host.status {
                HostStatus::Up => summary.online += 1,
                HostStatus::Down => summary.offline += 1,
                HostStatus::Unknown => summary.unknown += 1,
            }
        }
        summary
    }
}
