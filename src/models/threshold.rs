use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

pub const DEFAULT_CPU_ALERT_LIMIT: f64 = 90.0;
pub const DEFAULT_MEM_ALERT_LIMIT: f64 = 90.0;
pub const DEFAULT_NET_ALERT: f64 = 80.0;
pub const DEFAULT_ONLINE_USERS_LIMIT: i64 = 300;

/// Per-host alert configuration.
///
/// `net_up_max`/`net_down_max` are learned ceilings in Mbps; `0` means nothing
/// has been observed yet. The `*_alert` fields are percentages of those ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub id: Uuid,
    pub host_id: String,
    pub cpu_alert_limit: f64,
    pub mem_alert_limit: f64,
    pub net_up_max: f64,
    pub net_down_max: f64,
    pub net_up_alert: f64,
    pub net_down_alert: f64,
    pub online_users_limit: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Threshold {
    pub fn with_defaults(host_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            host_id: host_id.to_string(),
            cpu_alert_limit: DEFAULT_CPU_ALERT_LIMIT,
            mem_alert_limit: DEFAULT_MEM_ALERT_LIMIT,
            net_up_max: 0.0,
            net_down_max: 0.0,
            net_up_alert: DEFAULT_NET_ALERT,
            net_down_alert: DEFAULT_NET_ALERT,
            online_users_limit: DEFAULT_ONLINE_USERS_LIMIT,
            created_at: now,
            updated_at: now,
        }
    }

    /// Raises each ceiling if the observation is strictly greater.
    /// Returns whether anything changed.
    pub fn raise_ceilings(&mut self, up_mbps: f64, down_mbps: f64) -> bool {
        let mut changed = false;
        if up_mbps > self.net_up_max {
            self.net_up_max = up_mbps;
            changed = true;
        }
        if down_mbps > self.net_down_max {
            self.net_down_max = down_mbps;
            changed = true;
        }
        changed
    }
}

/// Operator-supplied threshold values for an upsert. Omitted fields take
/// the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdValues {
    pub cpu_alert_limit: f64,
    pub mem_alert_limit: f64,
    pub net_up_max: f64,
    pub net_down_max: f64,
    pub net_up_alert: f64,
    pub net_down_alert: f64,
    pub online_users_limit: i64,
}

impl Default for ThresholdValues {
    fn default() -> Self {
        Self {
            cpu_alert_limit: DEFAULT_CPU_ALERT_LIMIT,
            mem_alert_limit: DEFAULT_MEM_ALERT_LIMIT,
            net_up_max: 0.0,
            net_down_max: 0.0,
            net_up_alert: DEFAULT_NET_ALERT,
            net_down_alert: DEFAULT_NET_ALERT,
            online_users_limit: DEFAULT_ONLINE_USERS_LIMIT,
        }
    }
}

impl ThresholdValues {
    pub fn validate(&self) -> AppResult<()> {
        let percentages = [
            ("cpu_alert_limit", self.cpu_alert_limit),
            ("mem_alert_limit", self.mem_alert_limit),
            ("net_up_alert", self.net_up_alert),
            ("net_down_alert", self.net_down_alert),
        ];
        for (field, value) in percentages {
            if !(0.0..=100.0).contains(&value) {
                return Err(AppError::Validation(format!(
                    "{} must be between 0 and 100, got {}",
                    field, value
                )));
            }
        }

        for (field, value) in [("net_up_max", self.net_up_max), ("net_down_max", self.net_down_max)] {
            if !value.is_finite() || value < 0.0 {
                return Err(AppError::Validation(format!(
                    "{} must be a non-negative number, got {}",
                    field, value
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let t = Threshold::with_defaults("h1");
        assert_eq!(t.cpu_alert_limit, 90.0);
        assert_eq!(t.mem_alert_limit, 90.0);
        assert_eq!(t.net_up_alert, 80.0);
        assert_eq!(t.net_down_alert, 80.0);
        assert_eq!(t.net_up_max, 0.0);
        assert_eq!(t.online_users_limit, 300);
    }

    #[test]
    fn raise_ceilings_never_lowers() {
        let mut t = Threshold::with_defaults("h1");
        assert!(t.raise_ceilings(50.0, 20.0));
        assert!(!t.raise_ceilings(-5.0, 0.0));
        assert!(!t.raise_ceilings(f64::NAN, 20.0));
        assert_eq!((t.net_up_max, t.net_down_max), (50.0, 20.0));
        assert!(t.raise_ceilings(10.0, 30.0));
        assert_eq!((t.net_up_max, t.net_down_max), (50.0, 30.0));
    }

    #[test]
    fn rejects_out_of_range_percentages() {
        let values = ThresholdValues {
            cpu_alert_limit: 101.0,
            ..Default::default()
        };
        assert!(matches!(values.validate(), Err(AppError::Validation(_))));

        let values = ThresholdValues {
            net_down_alert: -1.0,
            ..Default::default()
        };
        assert!(values.validate().is_err());

        assert!(ThresholdValues::default().validate().is_ok());
    }
}
