use crate::error::{AppError, AppResult};
use crate::models::auth::{Claims, Credentials, LoginRequest, LoginResponse, Session};
use crate::models::config::MetricsConfig;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const LOGIN_PATH: &str = "/api/collections/users/auth-with-password";

/// Owns the bearer token used against the metrics API.
///
/// Logins are serialized through the session mutex, so concurrent requests
/// that all find the token stale trigger a single login.
pub struct SessionManager {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
    session: Mutex<Option<Session>>,
    refresh_in_flight: AtomicBool,
    expiry_lookahead: Duration,
    fallback_lifetime: Duration,
}

impl SessionManager {
    pub fn new(client: reqwest::Client, config: &MetricsConfig) -> Self {
        let credentials = match (&config.email, &config.password) {
            (Some(identity), Some(password)) if !identity.is_empty() && !password.is_empty() => {
                Some(Credentials {
                    identity: identity.clone(),
                    password: password.clone(),
                })
            }
            _ => None,
        };

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
            session: Mutex::new(None),
            refresh_in_flight: AtomicBool::new(false),
            expiry_lookahead: Duration::seconds(config.expiry_lookahead_secs),
            fallback_lifetime: Duration::seconds(config.fallback_token_lifetime_secs),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Token valid for at least the lookahead window, logging in first if needed.
    pub async fn ensure_valid_session(&self) -> AppResult<String> {
        let credentials = self.credentials()?;
        let mut session = self.session.lock().await;

        if let Some(current) = session.as_ref() {
            if current.expires_at > Utc::now() + self.expiry_lookahead {
                return Ok(current.token.clone());
            }
            info!("Metrics API token expires at {}, re-authenticating", current.expires_at);
        }

        let fresh = self.login(credentials).await?;
        let token = fresh.token.clone();
        *session = Some(fresh);
        Ok(token)
    }

    /// Called once when the API rejects `rejected_token` with a 401. Performs
    /// one re-login and returns the token the caller should retry with; an
    /// error means the caller must not retry.
    pub async fn on_unauthorized_response(&self, rejected_token: &str) -> AppResult<String> {
        let credentials = self.credentials()?;
        let mut session = self.session.lock().await;

        // Someone else already replaced the rejected token while we waited.
        if let Some(current) = session.as_ref() {
            if current.token != rejected_token {
                return Ok(current.token.clone());
            }
        }

        warn!("Metrics API rejected the session token, logging in again");
        *session = None;
        let fresh = self.login(credentials).await?;
        let token = fresh.token.clone();
        *session = Some(fresh);
        Ok(token)
    }

    /// Proactive re-login. Returns `Ok(false)` without doing anything when a
    /// refresh is already running.
    pub async fn refresh(&self) -> AppResult<bool> {
        if self.refresh_in_flight.swap(true, Ordering::AcqRel) {
            debug!("Session refresh already in flight, skipping");
            return Ok(false);
        }
        let _in_flight = InFlight(&self.refresh_in_flight);

        let credentials = self.credentials()?;
        let fresh = self.login(credentials).await?;
        *self.session.lock().await = Some(fresh);
        Ok(true)
    }

    /// Starts the periodic re-login task. The first refresh happens one full
    /// `every` after start.
    pub fn spawn_refresh_task(self: &Arc<Self>, every: std::time::Duration) -> RefreshTask {
        let (shutdown, mut stopped) = watch::channel(false);
        let manager = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match manager.refresh().await {
                            Ok(true) => info!("Metrics API session refreshed"),
                            Ok(false) => {}
                            Err(e) => warn!("Metrics API session refresh failed: {}", e),
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
            debug!("Session refresh task stopped");
        });

        RefreshTask { shutdown, handle }
    }

    fn credentials(&self) -> AppResult<&Credentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| AppError::Auth("no metrics API credentials configured".to_string()))
    }

    async fn login(&self, credentials: &Credentials) -> AppResult<Session> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, LOGIN_PATH))
            .json(&LoginRequest {
                identity: &credentials.identity,
                password: &credentials.password,
            })
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Auth(format!(
                "login rejected with status {}: {}",
                status.as_u16(),
                body
            )));
        }

        let login: LoginResponse = response.json().await?;
        let expires_at =
            token_expiry(&login.token).unwrap_or_else(|| Utc::now() + self.fallback_lifetime);

        info!(
            "Logged in to metrics API as {} (token valid until {})",
            login
                .record
                .as_ref()
                .map(|r| if r.email.is_empty() { r.id.as_str() } else { r.email.as_str() })
                .unwrap_or(credentials.identity.as_str()),
            expires_at.format("%Y-%m-%d %H:%M:%S")
        );

        Ok(Session {
            token: login.token,
            expires_at,
        })
    }
}

/// Handle to the background refresh task.
pub struct RefreshTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RefreshTask {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!("Session refresh task ended abnormally: {}", e);
        }
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// `exp` claim of a JWT, read without verifying the signature.
fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let data = decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    DateTime::from_timestamp(data.claims.exp, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fake_api::FakeMetricsApi;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use tokio_test::{assert_err, assert_ok};

    fn config(base_url: &str) -> MetricsConfig {
        MetricsConfig {
            base_url: base_url.to_string(),
            email: Some("ops@example.com".to_string()),
            password: Some(FakeMetricsApi::PASSWORD.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn reads_expiry_from_jwt() {
        let exp = Utc::now().timestamp() + 3600;
        let token = encode(
            &Header::default(),
            &Claims { exp },
            &EncodingKey::from_secret(b"server-side-secret"),
        )
        .unwrap();

        assert_eq!(token_expiry(&token).map(|t| t.timestamp()), Some(exp));
        assert_eq!(token_expiry("opaque-token"), None);
    }

    #[tokio::test]
    async fn missing_credentials_is_auth_error() {
        let mut config = config("http://127.0.0.1:9");
        config.password = None;
        let manager = SessionManager::new(reqwest::Client::new(), &config);

        assert!(!manager.has_credentials());
        assert!(matches!(manager.ensure_valid_session().await, Err(AppError::Auth(_))));
        assert!(matches!(manager.refresh().await, Err(AppError::Auth(_))));
    }

    #[tokio::test]
    async fn reuses_token_until_close_to_expiry() {
        let api = FakeMetricsApi::start().await;
        let manager = SessionManager::new(reqwest::Client::new(), &config(&api.base_url));

        let first = assert_ok!(manager.ensure_valid_session().await);
        let second = assert_ok!(manager.ensure_valid_session().await);
        assert_eq!(first, second);
        assert_eq!(api.login_count(), 1);
    }

    #[tokio::test]
    async fn relogs_when_token_within_lookahead() {
        let api = FakeMetricsApi::start().await;
        let mut config = config(&api.base_url);
        // Token lifetime shorter than the lookahead: always considered stale.
        config.fallback_token_lifetime_secs = 60;
        let manager = SessionManager::new(reqwest::Client::new(), &config);

        assert_ok!(manager.ensure_valid_session().await);
        assert_ok!(manager.ensure_valid_session().await);
        assert_eq!(api.login_count(), 2);
    }

    #[tokio::test]
    async fn rejected_login_is_auth_error() {
        let api = FakeMetricsApi::start().await;
        let mut config = config(&api.base_url);
        config.password = Some("wrong".to_string());
        let manager = SessionManager::new(reqwest::Client::new(), &config);

        let err = assert_err!(manager.ensure_valid_session().await);
        assert!(matches!(err, AppError::Auth(_)));
    }

    #[tokio::test]
    async fn unauthorized_triggers_single_relogin() {
        let api = FakeMetricsApi::start().await;
        let manager = SessionManager::new(reqwest::Client::new(), &config(&api.base_url));

        let stale = assert_ok!(manager.ensure_valid_session().await);
        let fresh = assert_ok!(manager.on_unauthorized_response(&stale).await);
        assert_ne!(stale, fresh);
        assert_eq!(api.login_count(), 2);

        // A second caller holding the same stale token reuses the new one.
        let reused = assert_ok!(manager.on_unauthorized_response(&stale).await);
        assert_eq!(reused, fresh);
        assert_eq!(api.login_count(), 2);
    }

    #[tokio::test]
    async fn overlapping_refresh_is_a_no_op() {
        let api = FakeMetricsApi::start().await;
        let manager = SessionManager::new(reqwest::Client::new(), &config(&api.base_url));

        manager.refresh_in_flight.store(true, Ordering::Release);
        assert_eq!(assert_ok!(manager.refresh().await), false);
        assert_eq!(api.login_count(), 0);

        manager.refresh_in_flight.store(false, Ordering::Release);
        assert_eq!(assert_ok!(manager.refresh().await), true);
        assert_eq!(api.login_count(), 1);
        assert!(!manager.refresh_in_flight.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn refresh_task_runs_on_schedule_and_stops() {
        let api = FakeMetricsApi::start().await;
        let manager = Arc::new(SessionManager::new(reqwest::Client::new(), &config(&api.base_url)));

        let task = manager.spawn_refresh_task(std::time::Duration::from_millis(50));
        tokio::time::sleep(std::time::Duration::from_millis(180)).await;
        task.stop().await;

        let after_stop = api.login_count();
        assert!(after_stop >= 2, "expected periodic logins, got {}", after_stop);
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        assert_eq!(api.login_count(), after_stop);
    }
}
