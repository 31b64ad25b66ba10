//! Reputation gate for Zentinel.
//!
//! Rejects requests from client IPs that AbuseIPDB rates as abusive, and
//! remembers each allow/deny verdict for a fixed horizon so the external
//! service is consulted at most once per address per cache window.
//!
//! # Features
//!
//! - **Verdict Cache** - Allow and deny verdicts cached for 24 hours by default
//! - **Single-Flight Lookups** - Concurrent requests from one uncached address share one AbuseIPDB call
//! - **Score Policy** - Confidence scores above 50 are denied
//! - **Fail-Open/Closed** - Configurable behavior when the lookup fails
//! - **Host Adapters** - axum middleware and an auth-subrequest `/check` endpoint
//!
//! # Example Configuration
//!
//! ```yaml
//! settings:
//!   enabled: true
//!   fail_action: allow
//!
//! abuseipdb:
//!   api_key: "${ABUSEIPDB_API_KEY}"
//!   timeout_ms: 5000
//!
//! cache:
//!   ttl_seconds: 86400
//!
//! allowlist:
//!   - "127.0.0.1"
//!   - "10.0.0.0/8"
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod gate;
pub mod guard;
pub mod policy;
pub mod server;

pub use cache::{CacheError, MemoryVerdictCache, VerdictStore};
pub use client::{AbuseIpDbClient, LookupError, ReputationLookup};
pub use config::{Config, ConfigError};
pub use gate::{GateOptions, ReputationGate};
pub use guard::{Decision, RequestGuard};
pub use policy::{decide, Verdict};
