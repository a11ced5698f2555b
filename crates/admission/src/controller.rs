//! Admission controller: the entry point producers call before enqueuing work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace, warn};

use jobgate_core::{Clock, SystemClock};
use jobgate_observability::{MetricCategory, MetricRecord, MetricsSink, NullMetricsSink, emit};

use crate::error::AdmissionError;
use crate::policy::{AdmissionPolicy, AdmissionSettings, Algorithm, Decision};
use crate::table::{Housekeeping, WindowKey, WindowTable};
use crate::window::{FixedWindow, SlidingWindow};

/// Counters over the controller's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub total_allowed: u64,
    pub total_denied: u64,
    /// Windows currently tracked across both algorithms.
    pub active_windows: usize,
    pub evictions: u64,
}

/// Per-`(scope, identity)` rate limiter.
///
/// Safe to share behind an `Arc`; every method takes `&self`.
pub struct AdmissionController {
    policies: RwLock<HashMap<String, AdmissionPolicy>>,
    fixed: WindowTable<FixedWindow>,
    sliding: WindowTable<SlidingWindow>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    allowed: AtomicU64,
    denied: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(AdmissionSettings::default(), Arc::new(NullMetricsSink))
    }
}

impl AdmissionController {
    pub fn new(settings: AdmissionSettings, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            fixed: WindowTable::new(settings.max_tracked_keys),
            sliding: WindowTable::new(settings.max_tracked_keys),
            clock: Arc::new(SystemClock),
            metrics,
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Replace the time source (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register or replace the policy for `scope`.
    pub fn configure(
        &self,
        scope: impl Into<String>,
        policy: AdmissionPolicy,
    ) -> Result<(), AdmissionError> {
        policy.validate()?;
        let scope = scope.into();
        debug!(scope = %scope, quota = policy.quota, window_ms = policy.window.as_millis() as u64, "admission policy configured");
        self.policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope, policy);
        Ok(())
    }

    pub fn policy(&self, scope: &str) -> Option<AdmissionPolicy> {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .copied()
    }

    fn configured(&self, scope: &str) -> Result<AdmissionPolicy, AdmissionError> {
        self.policy(scope)
            .ok_or_else(|| AdmissionError::NotConfigured(scope.to_string()))
    }

    /// Fixed-window check against the policy registered for `scope`.
    ///
    /// An allowed decision has already consumed one unit of quota.
    pub fn check(&self, scope: &str, identity: &str) -> Result<Decision, AdmissionError> {
        let policy = self.configured(scope)?;
        let now = self.clock.now();
        let key = WindowKey::new(scope, identity);

        let (decision, housekeeping) = self.fixed.with_window(
            &key,
            now,
            || FixedWindow::new(now),
            |window| window.check(&policy, now),
        );

        Ok(self.observe(Algorithm::FixedWindow, &key, decision, housekeeping))
    }

    /// Sliding-window check with an explicit quota and window.
    pub fn check_sliding(
        &self,
        scope: &str,
        identity: &str,
        quota: u32,
        window: Duration,
    ) -> Result<Decision, AdmissionError> {
        let policy = AdmissionPolicy::new(quota, window);
        policy.validate()?;
        Ok(self.sliding_with(scope, identity, policy))
    }

    /// Sliding-window check against the policy registered for `scope`.
    pub fn check_configured_sliding(
        &self,
        scope: &str,
        identity: &str,
    ) -> Result<Decision, AdmissionError> {
        let policy = self.configured(scope)?;
        Ok(self.sliding_with(scope, identity, policy))
    }

    fn sliding_with(&self, scope: &str, identity: &str, policy: AdmissionPolicy) -> Decision {
        let now = self.clock.now();
        let key = WindowKey::new(scope, identity);

        let (decision, housekeeping) = self.sliding.with_window(
            &key,
            now,
            || SlidingWindow::new(now),
            |window| window.check(&policy, now),
        );

        self.observe(Algorithm::SlidingWindow, &key, decision, housekeeping)
    }

    fn observe(
        &self,
        algorithm: Algorithm,
        key: &WindowKey,
        decision: Decision,
        housekeeping: Housekeeping,
    ) -> Decision {
        if housekeeping.evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            emit(
                self.metrics.as_ref(),
                MetricRecord::counter("admission_evicted", MetricCategory::Performance)
                    .with_tag("algorithm", algorithm.as_str()),
            );
        }
        if housekeeping.overflowed {
            warn!(
                scope = %key.scope,
                identity = %key.identity,
                algorithm = algorithm.as_str(),
                "admission table over capacity; every tracked window is still live"
            );
            emit(
                self.metrics.as_ref(),
                MetricRecord::counter("admission_table_overflow", MetricCategory::Performance)
                    .with_tag("algorithm", algorithm.as_str()),
            );
        }

        if decision.allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            trace!(
                scope = %key.scope,
                identity = %key.identity,
                algorithm = algorithm.as_str(),
                remaining = decision.remaining,
                "admission granted"
            );
            emit(
                self.metrics.as_ref(),
                MetricRecord::counter("admission_allowed", MetricCategory::Business)
                    .with_tag("scope", &key.scope)
                    .with_tag("algorithm", algorithm.as_str()),
            );
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            let retry_after = decision.retry_after.unwrap_or_default().as_secs();
            debug!(
                scope = %key.scope,
                identity = %key.identity,
                algorithm = algorithm.as_str(),
                retry_after_secs = retry_after,
                "admission denied"
            );
            emit(
                self.metrics.as_ref(),
                MetricRecord::counter("admission_denied", MetricCategory::Business)
                    .with_tag("scope", &key.scope)
                    .with_tag("identity", &key.identity)
                    .with_tag("algorithm", algorithm.as_str()),
            );
        }

        decision
    }

    /// Forget both windows for one identity. Returns whether anything was tracked.
    pub fn reset(&self, scope: &str, identity: &str) -> bool {
        let key = WindowKey::new(scope, identity);
        let fixed = self.fixed.remove(&key);
        let sliding = self.sliding.remove(&key);
        fixed || sliding
    }

    /// Drop expired fixed windows and empty sliding windows.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(self.clock.now())
    }

    fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let purged = self.fixed.purge_idle(now) + self.sliding.purge_idle(now);
        if purged > 0 {
            debug!(purged, "purged idle admission windows");
        }
        purged
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            total_allowed: self.allowed.load(Ordering::Relaxed),
            total_denied: self.denied.load(Ordering::Relaxed),
            active_windows: self.fixed.len() + self.sliding.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobgate_core::ManualClock;
    use jobgate_observability::InMemoryMetricsSink;

    fn controller(clock: &ManualClock) -> (AdmissionController, Arc<InMemoryMetricsSink>) {
        let sink = InMemoryMetricsSink::arc();
        let ctl = AdmissionController::new(AdmissionSettings::default(), sink.clone())
            .with_clock(Arc::new(clock.clone()));
        (ctl, sink)
    }

    #[test]
    fn unconfigured_scope_is_a_caller_error() {
        let (ctl, _) = controller(&ManualClock::starting_now());

        let err = ctl.check("upload", "u1").unwrap_err();
        assert_eq!(err, AdmissionError::NotConfigured("upload".to_string()));
        assert!(ctl.check_configured_sliding("upload", "u1").is_err());
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let (ctl, _) = controller(&ManualClock::starting_now());

        assert!(matches!(
            ctl.configure("upload", AdmissionPolicy::new(0, Duration::from_secs(1))),
            Err(AdmissionError::InvalidPolicy(_))
        ));
        assert!(ctl.check_sliding("chat", "u1", 5, Duration::ZERO).is_err());
    }

    #[test]
    fn quota_of_two_allows_two_then_denies() {
        let clock = ManualClock::starting_now();
        let (ctl, sink) = controller(&clock);
        ctl.configure("upload", AdmissionPolicy::per_minute(2)).unwrap();

        let first = ctl.check("upload", "u1").unwrap();
        let second = ctl.check("upload", "u1").unwrap();
        let third = ctl.check("upload", "u1").unwrap();

        assert!(first.allowed && first.remaining == 1);
        assert!(second.allowed && second.remaining == 0);
        assert!(!third.allowed);
        assert!(third.retry_after.unwrap() <= Duration::from_secs(60));

        assert_eq!(sink.count("admission_allowed"), 2);
        assert_eq!(sink.count("admission_denied"), 1);
        assert_eq!(ctl.stats().total_denied, 1);
    }

    #[test]
    fn identities_do_not_share_quota() {
        let clock = ManualClock::starting_now();
        let (ctl, _) = controller(&clock);
        ctl.configure("upload", AdmissionPolicy::per_minute(1)).unwrap();

        assert!(ctl.check("upload", "u1").unwrap().allowed);
        assert!(ctl.check("upload", "u2").unwrap().allowed);
        assert!(!ctl.check("upload", "u1").unwrap().allowed);
    }

    #[test]
    fn window_expiry_restores_quota() {
        let clock = ManualClock::starting_now();
        let (ctl, _) = controller(&clock);
        ctl.configure("upload", AdmissionPolicy::new(1, Duration::from_secs(10))).unwrap();

        assert!(ctl.check("upload", "u1").unwrap().allowed);
        clock.advance(Duration::from_secs(9));
        let denied = ctl.check("upload", "u1").unwrap();
        assert_eq!(denied.retry_after, Some(Duration::from_secs(1)));

        clock.advance(Duration::from_secs(1));
        assert!(ctl.check("upload", "u1").unwrap().allowed);
    }

    #[test]
    fn sliding_check_uses_explicit_quota() {
        let clock = ManualClock::starting_now();
        let (ctl, _) = controller(&clock);

        assert!(ctl.check_sliding("chat", "u1", 2, Duration::from_secs(60)).unwrap().allowed);
        clock.advance(Duration::from_secs(30));
        assert!(ctl.check_sliding("chat", "u1", 2, Duration::from_secs(60)).unwrap().allowed);
        clock.advance(Duration::from_secs(15));

        let denied = ctl.check_sliding("chat", "u1", 2, Duration::from_secs(60)).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(15)));
    }

    #[test]
    fn configured_sliding_follows_registered_policy() {
        let clock = ManualClock::starting_now();
        let (ctl, _) = controller(&clock);
        ctl.configure("chat", AdmissionPolicy::per_second(1)).unwrap();

        assert!(ctl.check_configured_sliding("chat", "u1").unwrap().allowed);
        assert!(!ctl.check_configured_sliding("chat", "u1").unwrap().allowed);
    }

    #[test]
    fn reset_forgets_identity() {
        let clock = ManualClock::starting_now();
        let (ctl, _) = controller(&clock);
        ctl.configure("upload", AdmissionPolicy::per_hour(1)).unwrap();

        assert!(ctl.check("upload", "u1").unwrap().allowed);
        assert!(!ctl.check("upload", "u1").unwrap().allowed);
        assert!(ctl.reset("upload", "u1"));
        assert!(ctl.check("upload", "u1").unwrap().allowed);
        assert!(!ctl.reset("upload", "nobody"));
    }

    #[test]
    fn purge_only_drops_expired_windows() {
        let clock = ManualClock::starting_now();
        let (ctl, _) = controller(&clock);
        ctl.configure("short", AdmissionPolicy::new(5, Duration::from_secs(1))).unwrap();
        ctl.configure("long", AdmissionPolicy::per_hour(5)).unwrap();

        ctl.check("short", "u1").unwrap();
        ctl.check("long", "u1").unwrap();
        ctl.check_sliding("short", "u1", 5, Duration::from_secs(1)).unwrap();
        assert_eq!(ctl.stats().active_windows, 3);

        clock.advance(Duration::from_secs(2));
        assert_eq!(ctl.purge_expired(), 2);
        assert_eq!(ctl.stats().active_windows, 1);

        // The surviving window still remembers its usage.
        assert_eq!(ctl.check("long", "u1").unwrap().remaining, 3);
    }

    #[test]
    fn bounded_table_evicts_and_reports() {
        let clock = ManualClock::starting_now();
        let sink = InMemoryMetricsSink::arc();
        let ctl = AdmissionController::new(
            AdmissionSettings::default().with_max_tracked_keys(2),
            sink.clone(),
        )
        .with_clock(Arc::new(clock.clone()));
        ctl.configure("upload", AdmissionPolicy::per_minute(5)).unwrap();

        for id in ["a", "b"] {
            ctl.check("upload", id).unwrap();
            clock.advance(Duration::from_millis(10));
        }
        clock.advance(Duration::from_secs(61));
        ctl.check("upload", "c").unwrap();

        assert_eq!(ctl.stats().evictions, 1);
        assert_eq!(ctl.stats().active_windows, 2);
        assert_eq!(sink.count("admission_evicted"), 1);
        assert_eq!(sink.count("admission_table_overflow"), 0);
    }

    #[test]
    fn table_pressure_never_resets_a_live_window() {
        let clock = ManualClock::starting_now();
        let sink = InMemoryMetricsSink::arc();
        let ctl = AdmissionController::new(
            AdmissionSettings::default().with_max_tracked_keys(1),
            sink.clone(),
        )
        .with_clock(Arc::new(clock.clone()));
        ctl.configure("upload", AdmissionPolicy::per_hour(1)).unwrap();

        assert!(ctl.check("upload", "u1").unwrap().allowed);
        assert!(ctl.check("upload", "u2").unwrap().allowed);
        clock.advance(Duration::from_secs(60));
        let again = ctl.check("upload", "u1").unwrap();

        assert!(!again.allowed);
        assert_eq!(again.retry_after, Some(Duration::from_secs(3540)));
        assert_eq!(ctl.stats().evictions, 0);
        assert_eq!(ctl.stats().active_windows, 2);
        assert_eq!(sink.count("admission_table_overflow"), 1);
    }
}
