//! Shared application state for Axum handlers.
//!
//! Holds the configured security components:
//!
//! - **PathGuard**: static-root containment and file reads
//! - **RateLimiter**: fixed-window counters shared by all requests
//! - **CsrfGuard**: per-session token table
//! - **SecurityHeaderPolicy**: header set template
//!
//! # Structured Concurrency
//!
//! A background sweep task evicts rate-limit buckets from past windows and
//! expired CSRF tokens. It is managed with `tokio_util::task::TaskTracker`
//! and `CancellationToken`; call `shutdown()` to stop it before exit.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::error::AppResult;
use crate::metrics;
use crate::security::rate_limiter::open_store;
use crate::security::{
    AllowedExtensionSet, Clock, CsrfGuard, PathGuard, RateLimiter, SecurityHeaderPolicy,
    SystemClock,
};

/// Shared application state for Axum handlers.
///
/// Cloned per request; every component is internally reference counted.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::new(config)?;
/// // ... serve ...
/// state.shutdown().await;  // Stop the sweep task
/// ```
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub path_guard: PathGuard,
    pub rate_limiter: RateLimiter,
    pub csrf: CsrfGuard,
    pub header_policy: SecurityHeaderPolicy,
    /// Timestamp when the application started
    pub started_at: Instant,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build state on the system clock.
    ///
    /// # Errors
    ///
    /// `AppError::ConfigError` if the static root is unusable or the rate
    /// limit storage URL is unsupported.
    pub fn new(config: Config) -> AppResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build state on an explicit clock (tests drive window boundaries this way).
    ///
    /// Must be called inside a Tokio runtime: the sweep task is spawned here.
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> AppResult<Self> {
        let path_guard = PathGuard::new(
            &config.static_root,
            AllowedExtensionSet::new(&config.allowed_extensions),
            config.file_read_timeout,
        )?;

        let store = open_store(&config.rate_limit_storage_url)?;
        let rate_limiter =
            RateLimiter::with_store(config.rate_limit_policy.clone(), store, clock.clone());

        let csrf = CsrfGuard::new(
            config.secret_key.clone(),
            config.csrf_time_limit.as_secs(),
            config.csrf_exempt_paths.clone(),
            clock,
        );

        let header_policy = SecurityHeaderPolicy::new(config.csp_policy.clone(), config.force_https);

        info!(
            static_root = %path_guard.root().display(),
            extensions = path_guard.allowed_extensions().len(),
            "Static root ready"
        );

        let state = Self {
            config: Arc::new(config),
            path_guard,
            rate_limiter,
            csrf,
            header_policy,
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_sweep_task();

        Ok(state)
    }

    /// Spawn the periodic eviction task. Disabled when the interval is zero.
    fn spawn_sweep_task(&self) {
        let period = self.config.sweep_interval;
        if period.is_zero() {
            debug!("Sweep interval is zero, stale state will not be evicted");
            return;
        }

        let rate_limiter = self.rate_limiter.clone();
        let csrf = self.csrf.clone();
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Sweep task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let buckets = rate_limiter.sweep();
                        let tokens = csrf.sweep();
                        metrics::set_rate_limit_buckets(rate_limiter.tracked_buckets());
                        metrics::set_csrf_sessions(csrf.tracked_sessions());
                        trace!(
                            evicted_buckets = buckets,
                            evicted_tokens = tokens,
                            "Sweep completed"
                        );
                    }
                }
            }

            debug!("Sweep task shutting down");
        });
    }

    /// Gracefully shutdown background tasks.
    ///
    /// 1. Signals tasks to stop via cancellation token
    /// 2. Closes the task tracker (prevents new tasks)
    /// 3. Waits for all tasks to complete
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
