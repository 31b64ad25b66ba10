//! Reputation gate: cache lookup, single-flight external lookup, verdict.

use crate::cache::{CacheError, MemoryVerdictCache, VerdictStore};
use crate::client::{AbuseIpDbClient, LookupError, ReputationLookup};
use crate::config::{Config, ConfigError, FailAction};
use crate::policy::{self, Verdict};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Gate tuning.
#[derive(Debug, Clone)]
pub struct GateOptions {
    /// How long a verdict stays cached.
    pub ttl: Duration,
    /// Upper bound on a single external lookup.
    pub lookup_timeout: Duration,
    /// Verdict to return when the lookup fails.
    pub fail_action: FailAction,
}

impl Default for GateOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(86_400),
            lookup_timeout: Duration::from_secs(5),
            fail_action: FailAction::Allow,
        }
    }
}

impl GateOptions {
    /// Verdict returned when no reputation can be obtained.
    pub fn fallback_verdict(&self) -> Verdict {
        match self.fail_action {
            FailAction::Allow => Verdict::Allow,
            FailAction::Block => Verdict::Deny,
        }
    }
}

/// Counters exposed to operators.
#[derive(Debug, Default)]
pub struct GateStats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    coalesced: AtomicU64,
    lookups: AtomicU64,
    lookup_failures: AtomicU64,
    denials: AtomicU64,
    cache_errors: AtomicU64,
}

/// Point-in-time copy of [`GateStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub coalesced: u64,
    pub lookups: u64,
    pub lookup_failures: u64,
    pub denials: u64,
    pub cache_errors: u64,
}

impl GateStats {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            lookup_failures: self.lookup_failures.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
            cache_errors: self.cache_errors.load(Ordering::Relaxed),
        }
    }
}

/// Result of one in-flight lookup, shared by every waiter.
#[derive(Debug, Clone)]
enum FlightOutcome {
    Decided(Verdict),
    LookupFailed,
    CacheFailed(CacheError),
}

type Flight = Shared<BoxFuture<'static, FlightOutcome>>;
type FlightMap = Arc<Mutex<HashMap<String, Flight>>>;

/// Unregisters a flight when its task ends, even by panic.
struct FlightRegistration {
    in_flight: FlightMap,
    address: String,
}

impl Drop for FlightRegistration {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.address);
    }
}

/// Everything a detached lookup task needs.
#[derive(Clone)]
struct FlightContext {
    cache: Arc<dyn VerdictStore>,
    lookup: Arc<dyn ReputationLookup>,
    options: GateOptions,
    stats: Arc<GateStats>,
}

impl FlightContext {
    async fn run(self, address: String) -> FlightOutcome {
        // A flight that finished between our cache miss and registration
        // has already written its verdict.
        match self.cache.get(&address).await {
            Ok(Some(verdict)) => return FlightOutcome::Decided(verdict),
            Ok(None) => {}
            Err(e) => return FlightOutcome::CacheFailed(e),
        }

        GateStats::incr(&self.stats.lookups);
        let result =
            match tokio::time::timeout(self.options.lookup_timeout, self.lookup.lookup(&address))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(LookupError::Timeout),
            };

        let score = match result {
            Ok(score) => score,
            Err(e) => {
                GateStats::incr(&self.stats.lookup_failures);
                warn!(
                    provider = self.lookup.name(),
                    ip = %address,
                    error = %e,
                    "Reputation lookup failed"
                );
                return FlightOutcome::LookupFailed;
            }
        };

        let verdict = policy::decide(score);
        debug!(ip = %address, score = score, verdict = %verdict, "Reputation decided");

        match self.cache.put(&address, verdict, self.options.ttl).await {
            Ok(()) => FlightOutcome::Decided(verdict),
            Err(e) => FlightOutcome::CacheFailed(e),
        }
    }
}

/// Gates addresses by cached or freshly looked-up reputation.
///
/// At most one external lookup per address runs at a time; concurrent
/// callers for the same address wait on it. The lookup runs on its own task,
/// so a caller that is cancelled stops waiting without cancelling the lookup.
pub struct ReputationGate {
    ctx: FlightContext,
    in_flight: FlightMap,
}

impl ReputationGate {
    pub fn new(
        cache: Arc<dyn VerdictStore>,
        lookup: Arc<dyn ReputationLookup>,
        options: GateOptions,
    ) -> Self {
        Self {
            ctx: FlightContext {
                cache,
                lookup,
                options,
                stats: Arc::new(GateStats::default()),
            },
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build a gate with an in-memory cache and an AbuseIPDB client.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let cache = Arc::new(MemoryVerdictCache::new(config.cache.max_entries));
        let client = Arc::new(AbuseIpDbClient::new(&config.abuseipdb)?);
        let options = GateOptions {
            ttl: config.cache.ttl(),
            lookup_timeout: config.abuseipdb.timeout(),
            fail_action: config.settings.fail_action,
        };

        info!(
            ttl_seconds = config.cache.ttl_seconds,
            timeout_ms = config.abuseipdb.timeout_ms,
            fail_action = ?config.settings.fail_action,
            "Reputation gate initialized"
        );

        Ok(Self::new(cache, client, options))
    }

    /// Decide whether requests from `address` may proceed.
    ///
    /// Lookup failures resolve to the configured fallback verdict and are
    /// never cached. A cache that cannot be read or written is an error.
    pub async fn evaluate(&self, address: &str) -> Result<Verdict, CacheError> {
        let stats = &self.ctx.stats;

        match self.ctx.cache.get(address).await {
            Ok(Some(verdict)) => {
                GateStats::incr(&stats.cache_hits);
                debug!(ip = %address, verdict = %verdict, "Verdict cache hit");
                return Ok(self.record(verdict));
            }
            Ok(None) => GateStats::incr(&stats.cache_misses),
            Err(e) => {
                GateStats::incr(&stats.cache_errors);
                error!(ip = %address, error = %e, "Verdict cache read failed");
                return Err(e);
            }
        }

        match self.join_flight(address).await {
            FlightOutcome::Decided(verdict) => Ok(self.record(verdict)),
            FlightOutcome::LookupFailed => {
                Ok(self.record(self.ctx.options.fallback_verdict()))
            }
            FlightOutcome::CacheFailed(e) => {
                GateStats::incr(&stats.cache_errors);
                error!(ip = %address, error = %e, "Verdict cache unavailable during lookup");
                Err(e)
            }
        }
    }

    /// Join the in-flight lookup for `address`, starting one if needed.
    fn join_flight(&self, address: &str) -> Flight {
        let mut in_flight = self.in_flight.lock();

        if let Some(flight) = in_flight.get(address) {
            GateStats::incr(&self.ctx.stats.coalesced);
            debug!(ip = %address, "Joining in-flight lookup");
            return flight.clone();
        }

        let registration = FlightRegistration {
            in_flight: self.in_flight.clone(),
            address: address.to_string(),
        };
        let ctx = self.ctx.clone();
        let owned = address.to_string();
        // Unregistration blocks on our lock until the flight is inserted below.
        let task = tokio::spawn(async move {
            let _registration = registration;
            ctx.run(owned).await
        });

        let stats = self.ctx.stats.clone();
        let flight = async move {
            task.await.unwrap_or_else(|e| {
                GateStats::incr(&stats.lookup_failures);
                warn!(error = %e, "Reputation lookup task aborted");
                FlightOutcome::LookupFailed
            })
        }
        .boxed()
        .shared();

        in_flight.insert(address.to_string(), flight.clone());
        flight
    }

    fn record(&self, verdict: Verdict) -> Verdict {
        if verdict == Verdict::Deny {
            GateStats::incr(&self.ctx.stats.denials);
        }
        verdict
    }

    /// Number of lookups currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn options(&self) -> &GateOptions {
        &self.ctx.options
    }
}
