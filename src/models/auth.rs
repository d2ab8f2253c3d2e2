use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct Credentials {
    pub identity: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub identity: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    #[serde(default)]
    pub record: Option<AuthRecord>,
}

#[derive(Debug, Deserialize)]
pub struct AuthRecord {
    pub id: String,
    #[serde(default)]
    pub email: String,
}

/// The only claim read from metrics API tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub exp: i64,
}
