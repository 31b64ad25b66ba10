//! AbuseIPDB reputation client.

use crate::config::AbuseIPDBConfig;
use crate::policy::ReputationScore;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const BODY_PREVIEW_LIMIT: usize = 256;

/// Error from a reputation lookup. Never cached.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[source] reqwest::Error),
    /// Timeout.
    #[error("Request timed out")]
    Timeout,
    /// Rate limited.
    #[error("Rate limited")]
    RateLimited,
    /// Non-success status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// Invalid response.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for LookupError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LookupError::Timeout
        } else {
            LookupError::Http(e.without_url())
        }
    }
}

/// A single external reputation lookup.
#[async_trait]
pub trait ReputationLookup: Send + Sync {
    /// Fetch the abuse confidence score for an address.
    async fn lookup(&self, address: &str) -> Result<ReputationScore, LookupError>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

/// AbuseIPDB API response.
#[derive(Debug, Deserialize)]
struct AbuseIPDBResponse {
    data: AbuseIPDBData,
}

#[derive(Debug, Deserialize)]
struct AbuseIPDBData {
    /// Abuse confidence score (0-100).
    #[serde(rename = "abuseConfidenceScore")]
    abuse_confidence_score: f64,

    #[serde(rename = "totalReports", default)]
    total_reports: u32,
}

/// AbuseIPDB `check` endpoint client.
pub struct AbuseIpDbClient {
    client: Client,
    check_url: String,
    api_key: String,
    max_age_days: u32,
}

impl std::fmt::Debug for AbuseIpDbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbuseIpDbClient")
            .field("check_url", &self.check_url)
            .field("max_age_days", &self.max_age_days)
            .finish_non_exhaustive()
    }
}

impl AbuseIpDbClient {
    /// Create a new client. Fails if the HTTP client cannot be built.
    pub fn new(config: &AbuseIPDBConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            check_url: format!("{}/check", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            max_age_days: config.max_age_days,
        })
    }
}

#[async_trait]
impl ReputationLookup for AbuseIpDbClient {
    async fn lookup(&self, address: &str) -> Result<ReputationScore, LookupError> {
        debug!(ip = %address, "Querying AbuseIPDB");

        let response = self
            .client
            .get(&self.check_url)
            .query(&[
                ("ipAddress", address.to_string()),
                ("maxAgeInDays", self.max_age_days.to_string()),
            ])
            .header("Key", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            warn!("AbuseIPDB rate limit exceeded");
            return Err(LookupError::RateLimited);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LookupError::Status {
                status: status.as_u16(),
                body: preview_body(&body),
            });
        }

        let body = response.bytes().await?;
        let parsed: AbuseIPDBResponse = serde_json::from_slice(&body).map_err(|e| {
            LookupError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;

        let score = parse_score(parsed.data.abuse_confidence_score)?;

        debug!(
            ip = %address,
            score = score,
            reports = parsed.data.total_reports,
            "AbuseIPDB lookup complete"
        );

        Ok(score)
    }

    fn name(&self) -> &str {
        "abuseipdb"
    }
}

/// Accept whole numbers in 0..=100, whether sent as `87` or `87.0`.
fn parse_score(raw: f64) -> Result<ReputationScore, LookupError> {
    if raw.is_finite() && raw.fract() == 0.0 && (0.0..=100.0).contains(&raw) {
        Ok(raw as ReputationScore)
    } else {
        Err(LookupError::InvalidResponse(format!(
            "abuseConfidenceScore is not a whole number in 0..=100: {}",
            raw
        )))
    }
}

fn preview_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }
    if trimmed.len() <= BODY_PREVIEW_LIMIT {
        return trimmed.to_string();
    }
    let mut end = BODY_PREVIEW_LIMIT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}
