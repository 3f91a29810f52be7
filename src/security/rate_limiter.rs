//! Fixed-window, multi-scope rate limiting keyed by client identity.
//!
//! Each request is checked against every `(scope, limit)` pair that applies to
//! its route: the route's own limits first, then the shared global limits.
//! A request is admitted only if **all** applicable pairs have capacity.
//!
//! # Windows
//!
//! Windows are aligned to the epoch: a `60s` window covers `[k*60, (k+1)*60)`.
//! A bucket resets to zero the instant its window index changes. This is a
//! hard fixed window, not a token bucket; a client may spend a full budget at
//! the end of one window and another at the start of the next.
//!
//! # Atomicity
//!
//! [`InMemoryStore`] increments and compares under the bucket's shard lock, so
//! concurrent requests from the same client can never both take the last
//! slot. When a later pair denies a request, slots already taken for earlier
//! pairs of the same request are returned so a denied request does not spend
//! budget in other scopes.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::clock::{Clock, SystemClock};
use crate::error::{AppError, AppResult};

/// Bucket scope name for limits shared across all non-health routes.
pub const GLOBAL_SCOPE: &str = "global";

/// The only storage backend this process can honor.
pub const MEMORY_STORAGE_URL: &str = "memory://";

// =============================================================================
// Limits
// =============================================================================

/// A single `N requests per window` limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests: u32,
    pub window_secs: u64,
}

impl RateLimit {
    pub const fn new(requests: u32, window_secs: u64) -> Self {
        Self {
            requests,
            window_secs,
        }
    }

    pub const fn per_minute(requests: u32) -> Self {
        Self::new(requests, 60)
    }

    pub const fn per_hour(requests: u32) -> Self {
        Self::new(requests, 3_600)
    }

    pub const fn per_day(requests: u32) -> Self {
        Self::new(requests, 86_400)
    }

    /// Seconds until the window containing `now` ends. Always in `1..=window_secs`.
    pub fn reset_in(&self, now: u64) -> u64 {
        self.window_secs - (now % self.window_secs)
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.window_secs {
            1 => write!(f, "{} per second", self.requests),
            60 => write!(f, "{} per minute", self.requests),
            3_600 => write!(f, "{} per hour", self.requests),
            86_400 => write!(f, "{} per day", self.requests),
            secs => write!(f, "{} per {}s", self.requests, secs),
        }
    }
}

/// Error parsing a rate limit expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitParseError {
    #[error("expected '<count> per <unit>' or '<count>/<unit>', got '{0}'")]
    Syntax(String),
    #[error("invalid request count in '{0}'")]
    Count(String),
    #[error("unknown time unit '{0}' (expected second, minute, hour or day)")]
    Unit(String),
    #[error("rate limit list is empty")]
    Empty,
}

fn unit_seconds(unit: &str) -> Option<u64> {
    match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" | "second" | "seconds" => Some(1),
        "m" | "min" | "minute" | "minutes" => Some(60),
        "h" | "hour" | "hours" => Some(3_600),
        "d" | "day" | "days" => Some(86_400),
        _ => None,
    }
}

impl FromStr for RateLimit {
    type Err = RateLimitParseError;

    /// Parses `30 per minute`, `30/minute` or `30/min`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (count, unit) = if let Some((count, unit)) = trimmed.split_once('/') {
            (count.trim(), unit.trim())
        } else {
            let mut parts = trimmed.split_whitespace();
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(count), Some(per), Some(unit), None) if per.eq_ignore_ascii_case("per") => {
                    (count, unit)
                }
                _ => return Err(RateLimitParseError::Syntax(trimmed.to_string())),
            }
        };

        let requests = count
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| RateLimitParseError::Count(trimmed.to_string()))?;
        let window_secs =
            unit_seconds(unit).ok_or_else(|| RateLimitParseError::Unit(unit.to_string()))?;

        Ok(Self::new(requests, window_secs))
    }
}

/// Parse a comma- or semicolon-separated list such as `200 per day, 50 per hour`.
pub fn parse_rate_limits(raw: &str) -> Result<Vec<RateLimit>, RateLimitParseError> {
    let limits = raw
        .split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(RateLimit::from_str)
        .collect::<Result<Vec<_>, _>>()?;

    if limits.is_empty() {
        return Err(RateLimitParseError::Empty);
    }
    Ok(limits)
}

// =============================================================================
// Scopes and policy
// =============================================================================

/// Route class used to select limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteScope {
    /// `GET /`
    Index,
    /// `GET /health`
    Health,
    /// Every other path.
    Asset,
}

impl RouteScope {
    pub fn for_path(path: &str) -> Self {
        match path {
            "/" => RouteScope::Index,
            "/health" => RouteScope::Health,
            _ => RouteScope::Asset,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RouteScope::Index => "index",
            RouteScope::Health => "health",
            RouteScope::Asset => "static",
        }
    }
}

/// Configured limits per scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub global: Vec<RateLimit>,
    pub index: Vec<RateLimit>,
    pub assets: Vec<RateLimit>,
    pub health: Vec<RateLimit>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            global: vec![RateLimit::per_day(200), RateLimit::per_hour(50)],
            index: vec![RateLimit::per_minute(30)],
            assets: vec![RateLimit::per_minute(100)],
            health: vec![RateLimit::per_minute(10)],
        }
    }
}

impl RateLimitPolicy {
    pub fn limits_for(&self, scope: RouteScope) -> &[RateLimit] {
        match scope {
            RouteScope::Index => &self.index,
            RouteScope::Health => &self.health,
            RouteScope::Asset => &self.assets,
        }
    }

    /// All `(bucket scope, limit)` pairs for a route, route-specific first.
    ///
    /// The global pairs apply to every scope.
    fn applicable(&self, scope: RouteScope) -> Vec<(&'static str, RateLimit)> {
        self.limits_for(scope)
            .iter()
            .map(|limit| (scope.name(), *limit))
            .chain(self.global.iter().map(|limit| (GLOBAL_SCOPE, *limit)))
            .collect()
    }
}

// =============================================================================
// Storage
// =============================================================================

/// Identity of one counter: `(client, scope, window length)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub client: String,
    pub scope: &'static str,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_index: u64,
    count: u32,
}

/// Result of trying to take one slot from a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    Exhausted { reset_in_secs: u64 },
}

/// Counter storage for the limiter.
///
/// `try_acquire` must increment and compare atomically with respect to other
/// calls for the same key.
pub trait RateLimitStore: Send + Sync + fmt::Debug {
    /// Take one slot if the bucket for `now`'s window has fewer than `limit` hits.
    fn try_acquire(&self, key: &BucketKey, limit: u32, now: u64) -> Acquire;

    /// Return a slot taken by `try_acquire` in the same window.
    fn release(&self, key: &BucketKey, now: u64);

    /// Report whether the bucket is exhausted without taking a slot.
    fn peek(&self, key: &BucketKey, limit: u32, now: u64) -> Acquire;

    /// Drop buckets whose window has ended. Returns the number removed.
    fn sweep(&self, now: u64) -> usize;

    fn bucket_count(&self) -> usize;
}

/// Process-local store. Counters are not shared between processes.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    buckets: DashMap<BucketKey, Bucket>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for InMemoryStore {
    fn try_acquire(&self, key: &BucketKey, limit: u32, now: u64) -> Acquire {
        let window_index = now / key.window_secs;
        let mut bucket = self.buckets.entry(key.clone()).or_insert(Bucket {
            window_index,
            count: 0,
        });

        if bucket.window_index != window_index {
            bucket.window_index = window_index;
            bucket.count = 0;
        }

        if bucket.count >= limit {
            return Acquire::Exhausted {
                reset_in_secs: RateLimit::new(limit, key.window_secs).reset_in(now),
            };
        }

        bucket.count += 1;
        Acquire::Granted
    }

    fn release(&self, key: &BucketKey, now: u64) {
        if let Some(mut bucket) = self.buckets.get_mut(key)
            && bucket.window_index == now / key.window_secs
        {
            bucket.count = bucket.count.saturating_sub(1);
        }
    }

    fn peek(&self, key: &BucketKey, limit: u32, now: u64) -> Acquire {
        match self.buckets.get(key) {
            Some(bucket)
                if bucket.window_index == now / key.window_secs && bucket.count >= limit =>
            {
                Acquire::Exhausted {
                    reset_in_secs: RateLimit::new(limit, key.window_secs).reset_in(now),
                }
            }
            _ => Acquire::Granted,
        }
    }

    fn sweep(&self, now: u64) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|key, bucket| bucket.window_index == now / key.window_secs);
        before.saturating_sub(self.buckets.len())
    }

    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Open the counter store named by a storage URL.
///
/// Only `memory://` is supported; anything else is a configuration error
/// rather than a silent fallback to process-local counters.
pub fn open_store(url: &str) -> AppResult<Arc<dyn RateLimitStore>> {
    if url.trim() == MEMORY_STORAGE_URL {
        Ok(Arc::new(InMemoryStore::new()))
    } else {
        Err(AppError::ConfigError(format!(
            "unsupported rate limit storage '{url}' (only {MEMORY_STORAGE_URL} is available)"
        )))
    }
}

// =============================================================================
// Limiter
// =============================================================================

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Admit,
    Deny {
        /// Seconds until the nearest failing window resets (at least 1).
        retry_after_secs: u64,
        /// Request count of the failing limit reported to the client.
        limit: u32,
    },
}

/// Multi-scope fixed-window limiter.
///
/// Cheap to clone; clones share the same store.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    policy: Arc<RateLimitPolicy>,
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// In-memory limiter on the system clock.
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self::with_store(policy, Arc::new(InMemoryStore::new()), Arc::new(SystemClock))
    }

    pub fn with_store(
        policy: RateLimitPolicy,
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy: Arc::new(policy),
            store,
            clock,
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Check one request from `client_key` against every limit for `scope`.
    ///
    /// On admission every applicable bucket has been incremented. On denial
    /// none has: slots taken before the failing pair are released.
    pub fn check(&self, client_key: &str, scope: RouteScope) -> RateDecision {
        let now = self.clock.now_secs();
        let pairs = self.policy.applicable(scope);

        let mut acquired: Vec<BucketKey> = Vec::with_capacity(pairs.len());
        let mut denial: Option<(u64, u32)> = None;

        for (bucket_scope, limit) in pairs {
            let key = BucketKey {
                client: client_key.to_string(),
                scope: bucket_scope,
                window_secs: limit.window_secs,
            };

            match denial {
                None => match self.store.try_acquire(&key, limit.requests, now) {
                    Acquire::Granted => acquired.push(key),
                    Acquire::Exhausted { reset_in_secs } => {
                        denial = Some((reset_in_secs, limit.requests));
                    }
                },
                // Already denied: only look for an earlier reset among the rest.
                Some((nearest, _)) => {
                    if let Acquire::Exhausted { reset_in_secs } =
                        self.store.peek(&key, limit.requests, now)
                        && reset_in_secs < nearest
                    {
                        denial = Some((reset_in_secs, limit.requests));
                    }
                }
            }
        }

        match denial {
            None => RateDecision::Admit,
            Some((retry_after_secs, limit)) => {
                for key in &acquired {
                    self.store.release(key, now);
                }
                debug!(
                    client = %client_key,
                    scope = scope.name(),
                    retry_after_secs,
                    "Rate limit denial"
                );
                RateDecision::Deny {
                    retry_after_secs: retry_after_secs.max(1),
                    limit,
                }
            }
        }
    }

    /// Evict buckets from past windows. Returns the number removed.
    pub fn sweep(&self) -> usize {
        self.store.sweep(self.clock.now_secs())
    }

    pub fn tracked_buckets(&self) -> usize {
        self.store.bucket_count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::security::clock::ManualClock;

    fn limiter_at(policy: RateLimitPolicy, start: u64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let limiter =
            RateLimiter::with_store(policy, Arc::new(InMemoryStore::new()), clock.clone());
        (limiter, clock)
    }

    // =========================================================================
    // Parsing
    // =========================================================================

    #[test]
    fn test_parse_per_syntax() {
        assert_eq!(
            "30 per minute".parse::<RateLimit>().unwrap(),
            RateLimit::per_minute(30)
        );
        assert_eq!(
            "200 PER day".parse::<RateLimit>().unwrap(),
            RateLimit::per_day(200)
        );
    }

    #[test]
    fn test_parse_slash_syntax() {
        assert_eq!("10/min".parse::<RateLimit>().unwrap(), RateLimit::per_minute(10));
        assert_eq!("5 / second".parse::<RateLimit>().unwrap(), RateLimit::new(5, 1));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            "0 per minute".parse::<RateLimit>(),
            Err(RateLimitParseError::Count(_))
        ));
        assert!(matches!(
            "10 per fortnight".parse::<RateLimit>(),
            Err(RateLimitParseError::Unit(_))
        ));
        assert!(matches!(
            "lots".parse::<RateLimit>(),
            Err(RateLimitParseError::Syntax(_))
        ));
    }

    #[test]
    fn test_parse_list() {
        let limits = parse_rate_limits("200 per day, 50 per hour").unwrap();
        assert_eq!(limits, vec![RateLimit::per_day(200), RateLimit::per_hour(50)]);
        assert_eq!(parse_rate_limits(" , "), Err(RateLimitParseError::Empty));
    }

    #[test]
    fn test_display() {
        assert_eq!(RateLimit::per_hour(50).to_string(), "50 per hour");
        assert_eq!(RateLimit::new(3, 90).to_string(), "3 per 90s");
    }

    #[test]
    fn test_reset_in_bounds() {
        let limit = RateLimit::per_minute(1);
        assert_eq!(limit.reset_in(120), 60);
        assert_eq!(limit.reset_in(179), 1);
    }

    // =========================================================================
    // Scopes
    // =========================================================================

    #[test]
    fn test_route_scope_for_path() {
        assert_eq!(RouteScope::for_path("/"), RouteScope::Index);
        assert_eq!(RouteScope::for_path("/health"), RouteScope::Health);
        assert_eq!(RouteScope::for_path("/css/site.css"), RouteScope::Asset);
        assert_eq!(RouteScope::for_path("/health/"), RouteScope::Asset);
    }

    #[test]
    fn test_global_pairs_apply_to_every_scope() {
        let policy = RateLimitPolicy::default();
        let pairs = policy.applicable(RouteScope::Health);
        assert_eq!(
            pairs,
            vec![
                ("health", RateLimit::per_minute(10)),
                ("global", RateLimit::per_day(200)),
                ("global", RateLimit::per_hour(50)),
            ]
        );

        let pairs = policy.applicable(RouteScope::Index);
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], ("index", RateLimit::per_minute(30)));
    }

    // =========================================================================
    // Limiter
    // =========================================================================

    #[test]
    fn test_health_limit_denies_eleventh_call() {
        let (limiter, _clock) = limiter_at(RateLimitPolicy::default(), 1_000_020);

        for _ in 0..10 {
            assert_eq!(limiter.check("10.0.0.1", RouteScope::Health), RateDecision::Admit);
        }
        let decision = limiter.check("10.0.0.1", RouteScope::Health);
        match decision {
            RateDecision::Deny {
                retry_after_secs,
                limit,
            } => {
                assert_eq!(limit, 10);
                assert!((1..=60).contains(&retry_after_secs));
            }
            RateDecision::Admit => panic!("11th health check should be denied"),
        }
    }

    #[test]
    fn test_window_boundary_resets_count() {
        // 1_000_040 is 20s into a minute window.
        let (limiter, clock) = limiter_at(RateLimitPolicy::default(), 1_000_040);

        for _ in 0..10 {
            limiter.check("c", RouteScope::Health);
        }
        assert!(matches!(
            limiter.check("c", RouteScope::Health),
            RateDecision::Deny { retry_after_secs: 40, .. }
        ));

        clock.advance(40);
        assert_eq!(limiter.check("c", RouteScope::Health), RateDecision::Admit);
    }

    #[test]
    fn test_clients_are_independent() {
        let (limiter, _clock) = limiter_at(RateLimitPolicy::default(), 0);

        for _ in 0..10 {
            limiter.check("a", RouteScope::Health);
        }
        assert!(matches!(
            limiter.check("a", RouteScope::Health),
            RateDecision::Deny { .. }
        ));
        assert_eq!(limiter.check("b", RouteScope::Health), RateDecision::Admit);
    }

    #[test]
    fn test_global_limit_shared_across_routes() {
        let policy = RateLimitPolicy {
            global: vec![RateLimit::per_hour(5)],
            ..RateLimitPolicy::default()
        };
        let (limiter, _clock) = limiter_at(policy, 0);

        for _ in 0..3 {
            assert_eq!(limiter.check("c", RouteScope::Index), RateDecision::Admit);
        }
        for _ in 0..2 {
            assert_eq!(limiter.check("c", RouteScope::Asset), RateDecision::Admit);
        }
        assert!(matches!(
            limiter.check("c", RouteScope::Asset),
            RateDecision::Deny { limit: 5, .. }
        ));
        // Health draws on the same global budget.
        assert!(matches!(
            limiter.check("c", RouteScope::Health),
            RateDecision::Deny { limit: 5, .. }
        ));
    }

    #[test]
    fn test_health_polling_bounded_by_global_hourly_limit() {
        let (limiter, clock) = limiter_at(RateLimitPolicy::default(), 0);

        let mut admitted = 0;
        for _ in 0..6 {
            for _ in 0..10 {
                if limiter.check("10.0.0.1", RouteScope::Health) == RateDecision::Admit {
                    admitted += 1;
                }
            }
            clock.advance(60);
        }

        assert_eq!(admitted, 50);
    }

    #[test]
    fn test_denied_request_does_not_spend_route_budget() {
        let policy = RateLimitPolicy {
            global: vec![RateLimit::per_hour(2)],
            index: vec![RateLimit::per_minute(3)],
            ..RateLimitPolicy::default()
        };
        let (limiter, clock) = limiter_at(policy, 0);

        assert_eq!(limiter.check("c", RouteScope::Index), RateDecision::Admit);
        assert_eq!(limiter.check("c", RouteScope::Index), RateDecision::Admit);
        // Denied by global; the index slot taken first must be returned.
        for _ in 0..5 {
            assert!(matches!(
                limiter.check("c", RouteScope::Index),
                RateDecision::Deny { limit: 2, .. }
            ));
        }

        // Next hour: global resets, and index has capacity since denials were refunded.
        clock.set(3_600);
        assert_eq!(limiter.check("c", RouteScope::Index), RateDecision::Admit);
    }

    #[test]
    fn test_retry_after_is_nearest_failing_reset() {
        let policy = RateLimitPolicy {
            global: vec![RateLimit::per_day(1), RateLimit::per_hour(1)],
            assets: vec![RateLimit::per_minute(100)],
            ..RateLimitPolicy::default()
        };
        // 30s into the minute, 30s into the hour, 30s into the day.
        let (limiter, _clock) = limiter_at(policy, 30);

        assert_eq!(limiter.check("c", RouteScope::Asset), RateDecision::Admit);
        match limiter.check("c", RouteScope::Asset) {
            RateDecision::Deny {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, 3_570),
            RateDecision::Admit => panic!("expected denial"),
        }
    }

    #[test]
    fn test_concurrent_checks_never_exceed_limit() {
        let policy = RateLimitPolicy {
            health: vec![RateLimit::per_minute(25)],
            ..RateLimitPolicy::default()
        };
        let (limiter, _clock) = limiter_at(policy, 5);

        let admitted = std::sync::atomic::AtomicU32::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..10 {
                        if limiter.check("shared", RouteScope::Health) == RateDecision::Admit {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(std::sync::atomic::Ordering::SeqCst), 25);
    }

    #[test]
    fn test_sweep_removes_stale_buckets() {
        let (limiter, clock) = limiter_at(RateLimitPolicy::default(), 0);

        limiter.check("a", RouteScope::Health);
        limiter.check("b", RouteScope::Index);
        assert_eq!(limiter.tracked_buckets(), 6);

        // Minute windows ended, hour and day windows still live.
        clock.set(61);
        assert_eq!(limiter.sweep(), 2);
        assert_eq!(limiter.tracked_buckets(), 4);
    }

    #[test]
    fn test_open_store() {
        assert!(open_store("memory://").is_ok());
        assert!(matches!(
            open_store("redis://localhost:6379"),
            Err(AppError::ConfigError(_))
        ));
    }
}
