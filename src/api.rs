#![forbid(unsafe_code)]

// Platform HTTP API - signup, initial view, and user record endpoints of the
// external chat platform

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Header carrying the signup token on authenticated calls.
pub const AUTH_HEADER: &str = "X-AUTH-CODE";

#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP contract violation: anything other than 200 is fatal for the
    /// simulated user that made the call.
    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: &'static str, status: u16 },
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Server-assigned user record returned by `GET /user`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    #[serde(rename = "responseId")]
    pub response_id: i64,
}

/// Generates a fresh signup token: a UUIDv4 in simple form (32 hex chars).
pub fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Thin client over the platform's HTTP endpoints. The underlying
/// `reqwest::Client` is shared across a whole batch for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /signup` with the token and treatment id.
    pub async fn post_signup(&self, token: &str, treatment: u32) -> Result<(), ApiError> {
        let response = self
            .http
            .post(format!("{}/signup", self.base_url))
            .json(&json!({ "linkId": token, "treatment": treatment }))
            .send()
            .await?;
        expect_ok("/signup", response.status().as_u16())
    }

    /// `POST /initial-view`, authenticated by the signup token. Observed to
    /// be idempotent: the view redirect path re-posts it.
    pub async fn post_initial_view(&self, token: &str, view: &str) -> Result<(), ApiError> {
        let response = self
            .http
            .post(format!("{}/initial-view", self.base_url))
            .header(AUTH_HEADER, token)
            .json(&json!({ "view": view }))
            .send()
            .await?;
        expect_ok("/initial-view", response.status().as_u16())
    }

    /// `GET /user` - fetches the server-assigned record for this token.
    pub async fn fetch_user(&self, token: &str) -> Result<UserRecord, ApiError> {
        let response = self
            .http
            .get(format!("{}/user", self.base_url))
            .header(AUTH_HEADER, token)
            .send()
            .await?;
        expect_ok("/user", response.status().as_u16())?;
        Ok(response.json().await?)
    }
}

fn expect_ok(endpoint: &'static str, status: u16) -> Result<(), ApiError> {
    if status == 200 {
        Ok(())
    } else {
        Err(ApiError::Status { endpoint, status })
    }
}
