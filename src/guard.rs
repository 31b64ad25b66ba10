//! Host-facing request guard.
//!
//! Resolves the client address for a request, applies the allowlist and the
//! global switch, and turns the gate's verdict into a [`Decision`].

use crate::config::{AddressSet, Config, ConfigError, IpExtractionConfig};
use crate::gate::ReputationGate;
use crate::policy::Verdict;
use axum::http::HeaderMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Body of the rejection response.
pub const REJECTION_BODY: &str = "Access denied from your IP.";

/// Status of the rejection response.
pub const REJECTION_STATUS: u16 = 403;

/// What the host should do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Continue normal processing.
    Allow,
    /// Replace the response with [`REJECTION_STATUS`] and [`REJECTION_BODY`].
    Reject,
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Request guard wrapping a [`ReputationGate`].
pub struct RequestGuard {
    config: Arc<Config>,
    gate: ReputationGate,
    allowlist: AddressSet,
    trusted_proxies: AddressSet,
}

impl RequestGuard {
    /// Create a guard with an AbuseIPDB-backed gate.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let gate = ReputationGate::from_config(&config)?;
        Self::with_gate(config, gate)
    }

    /// Create a guard around an existing gate.
    pub fn with_gate(config: Config, gate: ReputationGate) -> Result<Self, ConfigError> {
        let allowlist = AddressSet::parse("allowlist", &config.allowlist)?;
        let trusted_proxies = AddressSet::parse(
            "ip_extraction.trusted_proxies",
            &config.ip_extraction.trusted_proxies,
        )?;
        info!(
            enabled = config.settings.enabled,
            allowlist_entries = allowlist.len(),
            trusted_proxies = trusted_proxies.len(),
            "Request guard initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            gate,
            allowlist,
            trusted_proxies,
        })
    }

    pub fn gate(&self) -> &ReputationGate {
        &self.gate
    }

    /// Resolve the client address: an untrusted peer is taken at its word,
    /// forwarding headers only count behind a trusted proxy or when the host
    /// did not supply a peer.
    fn client_ip(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> Option<IpAddr> {
        match peer {
            Some(peer) if !self.trusted_proxies.contains(&peer) => Some(peer),
            _ => extract_client_ip(headers, &self.config.ip_extraction).or(peer),
        }
    }

    /// Decide a request given its headers and socket peer.
    pub async fn check(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> Decision {
        if !self.config.settings.enabled {
            debug!("Reputation gate disabled globally");
            return Decision::Allow;
        }

        let ip = match self.client_ip(headers, peer) {
            Some(ip) => ip,
            None => {
                debug!("No client IP found for request");
                return Decision::Allow;
            }
        };

        self.check_ip(ip).await
    }

    /// Decide a request from a known client address.
    pub async fn check_ip(&self, ip: IpAddr) -> Decision {
        if self.allowlist.contains(&ip) {
            debug!(ip = %ip, "IP is allowlisted");
            return Decision::Allow;
        }

        let address = ip.to_string();
        let verdict = match self.gate.evaluate(&address).await {
            Ok(verdict) => verdict,
            Err(e) => {
                error!(ip = %ip, error = %e, "Reputation gate unavailable");
                self.gate.options().fallback_verdict()
            }
        };

        match verdict {
            Verdict::Deny => {
                if self.config.settings.log_blocked {
                    info!(ip = %ip, "Blocking request");
                }
                Decision::Reject
            }
            Verdict::Allow => {
                if self.config.settings.log_allowed {
                    debug!(ip = %ip, "Allowing request");
                }
                Decision::Allow
            }
        }
    }
}

/// Extract client IP from request headers.
pub fn extract_client_ip(headers: &HeaderMap, config: &IpExtractionConfig) -> Option<IpAddr> {
    for header_name in &config.headers {
        let Some(value) = headers
            .get(header_name.to_lowercase().as_str())
            .and_then(|v| v.to_str().ok())
        else {
            continue;
        };

        let ip_str = if config.use_first_ip {
            // X-Forwarded-For: client, proxy1, proxy2
            value.split(',').next()
        } else {
            // Use the last IP (closest proxy)
            value.split(',').last()
        };

        if let Some(Ok(ip)) = ip_str.map(|s| s.trim().parse()) {
            return Some(ip);
        }
    }
    None
}
