use crate::error::{AppError, AppResult};
use crate::models::config::MetricsConfig;
use crate::models::metrics::{Host, HostStatus, Sample};
use crate::services::session::SessionManager;
use crate::utils::time::parse_timestamp;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

const HOSTS_PATH: &str = "/api/collections/systems/records";
const SAMPLES_PATH: &str = "/api/collections/system_stats/records";
const MAX_PAGE_SIZE: usize = 500;

/// Read side of the remote metrics API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Every host, newest-created first.
    async fn list_hosts(&self) -> AppResult<Vec<Host>>;

    /// Up to `count` most recent samples for one host, newest first.
    async fn list_recent_samples(&self, host_id: &str, count: usize) -> AppResult<Vec<Sample>>;
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(rename = "totalPages")]
    total_pages: u32,
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct SystemRecord {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    port: String,
    #[serde(default)]
    status: HostStatus,
    #[serde(default)]
    created: String,
    #[serde(default)]
    updated: String,
}

impl From<SystemRecord> for Host {
    fn from(record: SystemRecord) -> Self {
        Host {
            id: record.id,
            name: record.name,
            host: record.host,
            port: record.port,
            status: record.status,
            created_at: parse_timestamp(&record.created),
            updated_at: parse_timestamp(&record.updated),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatsRecord {
    id: String,
    system: String,
    #[serde(rename = "type")]
    granularity: String,
    #[serde(default)]
    stats: Option<StatsField>,
    #[serde(default)]
    created: String,
}

/// The `stats` column arrives either as an object or as a JSON-encoded string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StatsField {
    Object(StatsData),
    Encoded(String),
}

#[derive(Debug, Default, Deserialize)]
struct StatsData {
    #[serde(default)]
    cpu: f64,
    #[serde(rename = "m", default)]
    mem_total: f64,
    #[serde(rename = "mu", default)]
    mem_used: f64,
    #[serde(rename = "mp", default)]
    mem_pct: f64,
    #[serde(rename = "ns", default)]
    net_sent: f64,
    #[serde(rename = "nr", default)]
    net_recv: f64,
}

impl StatsRecord {
    fn into_sample(self) -> AppResult<Sample> {
        let data = match self.stats {
            Some(StatsField::Object(data)) => data,
            Some(StatsField::Encoded(raw)) => serde_json::from_str(&raw).map_err(|e| {
                AppError::upstream(0, format!("undecodable stats in record {}: {}", self.id, e))
            })?,
            None => StatsData::default(),
        };

        let mut sample = Sample {
            id: self.id,
            host_id: self.system,
            granularity: self.granularity,
            cpu: data.cpu,
            mem_total: data.mem_total,
            mem_used: data.mem_used,
            mem_pct: data.mem_pct,
            net_sent: data.net_sent,
            net_recv: data.net_recv,
            created_at: parse_timestamp(&self.created),
        };
        sample.mem_pct = sample.effective_mem_pct();
        Ok(sample)
    }
}

/// [`MetricsSource`] over HTTP. Every call gets a valid session first and is
/// retried at most once after a 401.
pub struct MetricsGateway {
    client: reqwest::Client,
    base_url: String,
    session: Arc<SessionManager>,
    page_size: u32,
    granularity: String,
}

impl MetricsGateway {
    pub fn new(client: reqwest::Client, session: Arc<SessionManager>, config: &MetricsConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            session,
            page_size: config.page_size.max(1),
            granularity: config.granularity.clone(),
        }
    }

    async fn get(&self, path: &str, query: &[(&str, String)], token: &str) -> AppResult<reqwest::Response> {
        Ok(self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .bearer_auth(token)
            .send()
            .await?)
    }

    async fn get_authorized(&self, path: &str, query: &[(&str, String)]) -> AppResult<reqwest::Response> {
        let token = self.session.ensure_valid_session().await?;
        let response = self.get(path, query, &token).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let token = self.session.on_unauthorized_response(&token).await?;
        let response = self.get(path, query, &token).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(AppError::Auth(format!("{} rejected a freshly issued token", path)));
        }
        Ok(response)
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> AppResult<T> {
        let response = self.get_authorized(path, query).await?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            warn!("Metrics API {} answered {}: {}", path, status, body);
            return Err(AppError::upstream(status.as_u16(), body));
        }
        Ok(response.json().await?)
    }
}

fn sample_filter(host_id: &str, granularity: &str) -> String {
    format!(
        "system = \"{}\" && type = \"{}\"",
        host_id.replace('\\', "\\\\").replace('"', "\\\""),
        granularity
    )
}

#[async_trait]
impl MetricsSource for MetricsGateway {
    async fn list_hosts(&self) -> AppResult<Vec<Host>> {
        let mut hosts = Vec::new();
        let mut page = 1u32;

        loop {
            let query = [
                ("page", page.to_string()),
                ("perPage", self.page_size.to_string()),
                ("sort", "-created".to_string()),
            ];
            let response: ListResponse<SystemRecord> = self.fetch(HOSTS_PATH, &query).await?;
            let fetched = response.items.len();
            hosts.extend(response.items.into_iter().map(Host::from));

            // the local counter decides; a server that echoes a stale page
            // number must not keep the loop going
            if fetched == 0 || page >= response.total_pages {
                break;
            }
            page += 1;
        }

        debug!("Fetched {} hosts from metrics API", hosts.len());
        Ok(hosts)
    }

    async fn list_recent_samples(&self, host_id: &str, count: usize) -> AppResult<Vec<Sample>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let query = [
            ("page", "1".to_string()),
            ("perPage", count.min(MAX_PAGE_SIZE).to_string()),
            ("sort", "-created".to_string()),
            ("filter", sample_filter(host_id, &self.granularity)),
        ];
        let response: ListResponse<StatsRecord> = self.fetch(SAMPLES_PATH, &query).await?;

        let mut samples = response
            .items
            .into_iter()
            .map(StatsRecord::into_sample)
            .collect::<AppResult<Vec<_>>>()?;
        samples.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        samples.truncate(count);
        Ok(samples)
    }
}
