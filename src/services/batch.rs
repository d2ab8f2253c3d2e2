use crate::models::metrics::{AverageView, LoadStatus};
use crate::models::tags::{TagLoadStatus, TagRef};
use crate::services::aggregation::AggregationEngine;
use crate::services::load;
use crate::services::tags::TagStore;
use crate::services::threshold::ThresholdStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves `(type, id)` tags to the load status of the host carrying them.
/// Never fails as a whole: every request gets an answer, in request order.
pub struct BatchLoadEvaluator {
    tags: Arc<TagStore>,
    thresholds: Arc<ThresholdStore>,
    engine: Arc<AggregationEngine>,
}

impl BatchLoadEvaluator {
    pub fn new(tags: Arc<TagStore>, thresholds: Arc<ThresholdStore>, engine: Arc<AggregationEngine>) -> Self {
        Self {
            tags,
            thresholds,
            engine,
        }
    }

    pub async fn resolve_load_statuses(&self, requests: &[TagRef]) -> Vec<TagLoadStatus> {
        if requests.is_empty() {
            return Vec::new();
        }
        let views = self.engine.fleet_views_by_host().await;
        self.resolve_with_views(requests, &views)
    }

    /// Resolution against an already built fleet view map.
    pub fn resolve_with_views(
        &self,
        requests: &[TagRef],
        views: &HashMap<String, AverageView>,
    ) -> Vec<TagLoadStatus> {
        requests
            .iter()
            .map(|request| TagLoadStatus {
                tag_type: request.tag_type.clone(),
                id: request.id,
                load_status: self.resolve_one(request, views),
            })
            .collect()
    }

    fn resolve_one(&self, request: &TagRef, views: &HashMap<String, AverageView>) -> LoadStatus {
        let Some(host_id) = self.tags.find_host(request) else {
            debug!("No host tagged {}:{}", request.tag_type, request.id);
            return LoadStatus::NotFound;
        };
        let Some(view) = views.get(&host_id) else {
            return LoadStatus::NoData;
        };

        match self.thresholds.get_or_create_default(&host_id) {
            Ok(threshold) => load::evaluate(view, &threshold),
            Err(e) => {
                warn!("Threshold lookup for host {} failed, reporting normal: {}", host_id, e);
                LoadStatus::Normal
            }
        }
    }
}
