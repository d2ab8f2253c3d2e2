use crate::error::{AppError, AppResult};
use crate::models::threshold::{Threshold, ThresholdValues};
use crate::services::store::KvStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

const KEY_PREFIX: &str = "threshold:";

fn key(host_id: &str) -> String {
    format!("{}{}", KEY_PREFIX, host_id)
}

pub struct ThresholdStore {
    store: Arc<KvStore>,
}

impl ThresholdStore {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    /// Stored record only; never creates one.
    pub fn get(&self, host_id: &str) -> AppResult<Option<Threshold>> {
        self.store.get(&key(host_id))
    }

    /// Stored record, or a freshly persisted default one.
    pub fn get_or_create_default(&self, host_id: &str) -> AppResult<Threshold> {
        if let Some(existing) = self.get(host_id)? {
            return Ok(existing);
        }

        self.store.transact(|txn| {
            let key = key(host_id);
            // another caller may have created it since the read above
            if let Some(existing) = txn.get::<Threshold>(&key)? {
                return Ok(existing);
            }
            let threshold = Threshold::with_defaults(host_id);
            txn.put(&key, &threshold)?;
            debug!("Created default threshold for host {}", host_id);
            Ok(threshold)
        })
    }

    /// Replaces every operator field, keeping `id` and `created_at`.
    ///
    /// Learned ceilings only move upwards here as well: a lower `net_*_max`
    /// than the stored one is ignored. Lowering a ceiling takes a delete.
    pub fn upsert(&self, host_id: &str, values: &ThresholdValues) -> AppResult<Threshold> {
        if host_id.trim().is_empty() {
            return Err(AppError::Validation("host id must not be empty".to_string()));
        }
        values.validate()?;

        self.store.transact(|txn| {
            let key = key(host_id);
            let mut threshold = txn
                .get::<Threshold>(&key)?
                .unwrap_or_else(|| Threshold::with_defaults(host_id));

            threshold.cpu_alert_limit = values.cpu_alert_limit;
            threshold.mem_alert_limit = values.mem_alert_limit;
            threshold.net_up_alert = values.net_up_alert;
            threshold.net_down_alert = values.net_down_alert;
            threshold.online_users_limit = values.online_users_limit;
            threshold.raise_ceilings(values.net_up_max, values.net_down_max);
            threshold.updated_at = Utc::now();

            txn.put(&key, &threshold)?;
            Ok(threshold)
        })
    }

    /// Adaptive baseline: raises each learned ceiling when the observed rate
    /// is strictly higher, in a single transaction. Returns whether the record
    /// changed.
    pub fn update_learned_ceiling(&self, host_id: &str, up_mbps: f64, down_mbps: f64) -> AppResult<bool> {
        let (raised, threshold) = self.store.transact(|txn| {
            let key = key(host_id);
            let (mut threshold, created) = match txn.get::<Threshold>(&key)? {
                Some(existing) => (existing, false),
                None => (Threshold::with_defaults(host_id), true),
            };

            let raised = threshold.raise_ceilings(up_mbps, down_mbps);
            if raised {
                threshold.updated_at = Utc::now();
            }
            if raised || created {
                txn.put(&key, &threshold)?;
            }
            Ok((raised, threshold))
        })?;

        if raised {
            info!(
                "Raised network ceilings for host {}: up {:.2} Mbps, down {:.2} Mbps",
                host_id, threshold.net_up_max, threshold.net_down_max
            );
        }
        Ok(raised)
    }

    pub fn delete(&self, host_id: &str) -> AppResult<()> {
        if self.store.delete(&key(host_id))? {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("threshold for host {}", host_id)))
        }
    }

    pub fn list_all(&self) -> Vec<Threshold> {
        self.store
            .scan_prefix::<Threshold>(KEY_PREFIX)
            .into_iter()
            .map(|(_, threshold)| threshold)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ThresholdStore {
        ThresholdStore::new(Arc::new(KvStore::in_memory()))
    }

    #[test]
    fn get_does_not_create() {
        let thresholds = store();
        assert!(thresholds.get("h1").unwrap().is_none());
        assert!(thresholds.list_all().is_empty());
    }

    #[test]
    fn get_or_create_default_is_idempotent_in_value() {
        let thresholds = store();
        let first = thresholds.get_or_create_default("h1").unwrap();
        let second = thresholds.get_or_create_default("h1").unwrap();
        assert_eq!(first, second);
        assert_eq!(thresholds.list_all().len(), 1);
        assert_eq!(first.cpu_alert_limit, 90.0);
    }

    #[test]
    fn upsert_preserves_identity_and_creation_time() {
        let thresholds = store();
        let original = thresholds.get_or_create_default("h1").unwrap();

        let values = ThresholdValues {
            cpu_alert_limit: 75.0,
            online_users_limit: 0,
            ..Default::default()
        };
        let updated = thresholds.upsert("h1", &values).unwrap();

        assert_eq!(updated.id, original.id);
        assert_eq!(updated.created_at, original.created_at);
        assert_eq!(updated.cpu_alert_limit, 75.0);
        assert_eq!(updated.online_users_limit, 0);
        assert_eq!(thresholds.get("h1").unwrap(), Some(updated));
    }

    #[test]
    fn upsert_creates_when_absent_and_validates() {
        let thresholds = store();
        let bad = ThresholdValues {
            mem_alert_limit: 150.0,
            ..Default::default()
        };
        assert!(matches!(thresholds.upsert("h1", &bad), Err(AppError::Validation(_))));
        assert!(thresholds.get("h1").unwrap().is_none());

        let created = thresholds.upsert("h1", &ThresholdValues::default()).unwrap();
        assert_eq!(created.host_id, "h1");
    }

    #[test]
    fn upsert_never_lowers_learned_ceiling() {
        let thresholds = store();
        thresholds.update_learned_ceiling("h1", 120.0, 60.0).unwrap();
        let updated = thresholds.upsert("h1", &ThresholdValues::default()).unwrap();
        assert_eq!(updated.net_up_max, 120.0);
        assert_eq!(updated.net_down_max, 60.0);
    }

    #[test]
    fn learned_ceilings_are_monotonic() {
        let thresholds = store();
        let observations = [
            (10.0, 5.0),
            (0.0, 0.0),
            (-40.0, -1.0),
            (8.0, 50.0),
            (f64::NAN, 2.0),
            (90.0, 1.0),
        ];

        let mut last = (0.0, 0.0);
        for (up, down) in observations {
            thresholds.update_learned_ceiling("h1", up, down).unwrap();
            let current = thresholds.get("h1").unwrap().unwrap();
            assert!(current.net_up_max >= last.0);
            assert!(current.net_down_max >= last.1);
            last = (current.net_up_max, current.net_down_max);
        }
        assert_eq!(last, (90.0, 50.0));
    }

    #[test]
    fn ceiling_update_reports_change_only_when_raised() {
        let thresholds = store();
        assert!(thresholds.update_learned_ceiling("h1", 10.0, 0.0).unwrap());
        assert!(!thresholds.update_learned_ceiling("h1", 10.0, 0.0).unwrap());
        assert!(!thresholds.update_learned_ceiling("h1", 3.0, 0.0).unwrap());
    }

    #[test]
    fn concurrent_ceiling_updates_keep_the_maximum() {
        let thresholds = Arc::new(store());
        let handles: Vec<_> = (1..=16)
            .map(|i| {
                let thresholds = Arc::clone(&thresholds);
                std::thread::spawn(move || {
                    thresholds
                        .update_learned_ceiling("h1", i as f64, (17 - i) as f64)
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let threshold = thresholds.get("h1").unwrap().unwrap();
        assert_eq!(threshold.net_up_max, 16.0);
        assert_eq!(threshold.net_down_max, 16.0);
    }

    #[test]
    fn delete_then_recreate_resets_ceiling() {
        let thresholds = store();
        thresholds.update_learned_ceiling("h1", 500.0, 500.0).unwrap();
        thresholds.delete("h1").unwrap();
        assert!(matches!(thresholds.delete("h1"), Err(AppError::NotFound(_))));

        let fresh = thresholds.get_or_create_default("h1").unwrap();
        assert_eq!(fresh.net_up_max, 0.0);
    }
}
