//! Idle manager.
//!
//! One instance per upstream node. Tracks an in-flight call refcount and
//! schedules a deactivation after `onCallEnd`/start-up once the refcount
//! drops to zero, honouring both `idleTimeoutSecs` (measured from the last
//! reset point) and `minLingerSecs` (measured from activation).

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use hatago_config::{IdlePolicy, IdleResetAt};

/// Tracks the two clocks the deactivation formula depends on and the
/// number of calls currently in flight.
pub struct IdleManager {
    policy: IdlePolicy,
    activated_at: Instant,
    /// Millis since `activated_at` at the last reset point; an `i64` so it
    /// can be read/written from an `AtomicI64` without a lock.
    last_reset_millis: AtomicI64,
    in_flight: AtomicU32,
}

impl IdleManager {
    pub fn new(policy: IdlePolicy) -> Self {
        Self {
            policy,
            activated_at: Instant::now(),
            last_reset_millis: AtomicI64::new(0),
            in_flight: AtomicU32::new(0),
        }
    }

    /// Call on a successful activation; resets both clocks.
    pub fn on_activate(&self) {
        self.in_flight.store(0, Ordering::SeqCst);
        self.last_reset_millis.store(0, Ordering::SeqCst);
    }

    /// Call when a call starts routing to this upstream.
    pub fn on_call_start(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if matches!(self.policy.reset_at, IdleResetAt::OnCallStart) {
            self.reset_clock();
        }
    }

    /// Call when a call to this upstream finishes (success or error).
    pub fn on_call_end(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if matches!(self.policy.reset_at, IdleResetAt::OnCallEnd) {
            self.reset_clock();
        }
    }

    fn reset_clock(&self) {
        let elapsed = self.activated_at.elapsed().as_millis() as i64;
        self.last_reset_millis.store(elapsed, Ordering::SeqCst);
    }

    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Duration to wait before the next deactivation check, per the
    /// formula:
    ///
    /// `delay = max(idleTimeout - idleElapsed, minLinger - runElapsed, 0)`
    ///
    /// Returns `None` when calls are in flight (the idle manager does not
    /// arm while the refcount is non-zero).
    pub fn next_deactivation_delay(&self) -> Option<Duration> {
        if self.in_flight_count() > 0 {
            return None;
        }
        let idle_elapsed = Duration::from_millis(
            (self.activated_at.elapsed().as_millis() as i64
                - self.last_reset_millis.load(Ordering::SeqCst))
            .max(0) as u64,
        );
        let run_elapsed = self.activated_at.elapsed();

        let idle_timeout = Duration::from_secs(self.policy.idle_timeout_secs);
        let min_linger = Duration::from_secs(self.policy.min_linger_secs);

        let from_idle = idle_timeout.saturating_sub(idle_elapsed);
        let from_linger = min_linger.saturating_sub(run_elapsed);
        Some(from_idle.max(from_linger))
    }

    /// Whether the node is eligible for deactivation right now.
    pub fn is_deactivation_due(&self) -> bool {
        matches!(self.next_deactivation_delay(), Some(d) if d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn armed_only_when_refcount_is_zero() {
        let manager = IdleManager::new(IdlePolicy {
            idle_timeout_secs: 0,
            min_linger_secs: 0,
            reset_at: IdleResetAt::OnCallStart,
        });
        manager.on_call_start();
        assert!(manager.next_deactivation_delay().is_none());
        manager.on_call_end();
        assert!(manager.next_deactivation_delay().is_some());
    }

    #[test]
    fn min_linger_dominates_fresh_activation() {
        let manager = IdleManager::new(IdlePolicy {
            idle_timeout_secs: 0,
            min_linger_secs: 60,
            reset_at: IdleResetAt::OnCallStart,
        });
        let delay = manager.next_deactivation_delay().unwrap();
        assert!(delay.as_secs() > 0 && delay.as_secs() <= 60);
    }

    #[test]
    fn on_call_start_reset_rearms_idle_timeout() {
        let manager = IdleManager::new(IdlePolicy {
            idle_timeout_secs: 300,
            min_linger_secs: 0,
            reset_at: IdleResetAt::OnCallStart,
        });
        manager.on_call_start();
        manager.on_call_end();
        let delay = manager.next_deactivation_delay().unwrap();
        assert!(delay.as_secs() > 0);
    }
}
