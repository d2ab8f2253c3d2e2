use crate::models::metrics::{AverageView, HostStatus, LoadStatus};
use crate::models::threshold::Threshold;
use std::fmt;
use tracing::debug;

/// The rule that made a host high. Formatting only happens when the debug
/// log line is actually emitted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HighLoad {
    Unreachable(HostStatus),
    Cpu { pct: f64, limit: f64 },
    Memory { pct: f64, limit: f64 },
    Upload { mbps: f64, limit: f64 },
    Download { mbps: f64, limit: f64 },
    OnlineUsers { online: u64, limit: i64 },
}

impl fmt::Display for HighLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HighLoad::Unreachable(status) => write!(f, "reachability is {:?}", status),
            HighLoad::Cpu { pct, limit } => write!(f, "cpu {:.1}% >= {:.1}%", pct, limit),
            HighLoad::Memory { pct, limit } => write!(f, "memory {:.1}% >= {:.1}%", pct, limit),
            HighLoad::Upload { mbps, limit } => write!(f, "upload {:.2} Mbps >= {:.2} Mbps", mbps, limit),
            HighLoad::Download { mbps, limit } => write!(f, "download {:.2} Mbps >= {:.2} Mbps", mbps, limit),
            HighLoad::OnlineUsers { online, limit } => write!(f, "{} users online >= {}", online, limit),
        }
    }
}

/// Classifies one host against its threshold. The first rule that fires
/// decides; a host that isn't up is high before any metric is looked at.
pub fn evaluate(view: &AverageView, threshold: &Threshold) -> LoadStatus {
    match high_load(view, threshold) {
        Some(reason) => {
            debug!(reason = %reason, "Host {} is under high load", view.host.id);
            LoadStatus::High
        }
        None => LoadStatus::Normal,
    }
}

pub fn high_load(view: &AverageView, threshold: &Threshold) -> Option<HighLoad> {
    if view.host.status != HostStatus::Up {
        return Some(HighLoad::Unreachable(view.host.status));
    }
    if view.avg_cpu >= threshold.cpu_alert_limit {
        return Some(HighLoad::Cpu {
            pct: view.avg_cpu,
            limit: threshold.cpu_alert_limit,
        });
    }
    if view.avg_mem_pct >= threshold.mem_alert_limit {
        return Some(HighLoad::Memory {
            pct: view.avg_mem_pct,
            limit: threshold.mem_alert_limit,
        });
    }

    // Ceilings of zero are not learned yet and never fire.
    if threshold.net_up_max > 0.0 {
        let limit = threshold.net_up_max * threshold.net_up_alert / 100.0;
        if view.net_up_mbps() >= limit {
            return Some(HighLoad::Upload {
                mbps: view.net_up_mbps(),
                limit,
            });
        }
    }
    if threshold.net_down_max > 0.0 {
        let limit = threshold.net_down_max * threshold.net_down_alert / 100.0;
        if view.net_down_mbps() >= limit {
            return Some(HighLoad::Download {
                mbps: view.net_down_mbps(),
                limit,
            });
        }
    }

    if threshold.online_users_limit > 0 {
        if let Some(online) = view.online_users {
            if online >= threshold.online_users_limit as u64 {
                return Some(HighLoad::OnlineUsers {
                    online,
                    limit: threshold.online_users_limit,
                });
            }
        }
    }
    None
}
