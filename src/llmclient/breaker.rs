// Circuit breaker: closed / open / half-open with a single probe

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker policy. The zero value disables the breaker.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreakerPolicy {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting a probe.
    pub cooldown: Duration,
}

impl BreakerPolicy {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }
}

#[derive(Debug)]
enum Phase {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    phase: Phase,
    consecutive_failures: u32,
}

/// Per-adapter failure detector. Shared across concurrent calls; all state
/// lives behind one mutex.
#[derive(Debug)]
pub struct CircuitBreaker {
    policy: BreakerPolicy,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(BreakerState {
                phase: Phase::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    fn enabled(&self) -> bool {
        self.policy.failure_threshold > 0 && !self.policy.cooldown.is_zero()
    }

    /// Whether a request may proceed. While open, only the expiry of the
    /// cooldown admits a request, and exactly one: the half-open probe.
    pub fn try_acquire(&self) -> bool {
        if !self.enabled() {
            return true;
        }
        let mut state = self.lock();
        match state.phase {
            Phase::Closed => true,
            Phase::Open { until } => {
                if Instant::now() >= until {
                    state.phase = Phase::HalfOpen;
                    true
                } else {
                    false
                }
            }
            Phase::HalfOpen => false,
        }
    }

    pub fn record_success(&self) {
        if !self.enabled() {
            return;
        }
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.phase = Phase::Closed;
    }

    pub fn record_failure(&self) {
        if !self.enabled() {
            return;
        }
        let mut state = self.lock();
        match state.phase {
            Phase::HalfOpen => {
                state.phase = Phase::Open {
                    until: Instant::now() + self.policy.cooldown,
                };
            }
            _ => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.policy.failure_threshold {
                    log::warn!(
                        "circuit breaker opened after {} consecutive failures",
                        state.consecutive_failures
                    );
                    state.consecutive_failures = 0;
                    state.phase = Phase::Open {
                        until: Instant::now() + self.policy.cooldown,
                    };
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_breaker_always_admits() {
        let breaker = CircuitBreaker::new(BreakerPolicy::disabled());
        for _ in 0..10 {
            breaker.record_failure();
            assert!(breaker.try_acquire());
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(BreakerPolicy::new(3, Duration::from_secs(60)));
        assert!(breaker.try_acquire());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.try_acquire());
        breaker.record_failure();
        assert!(!breaker.try_acquire());
    }

    #[test]
    fn test_success_resets_counter() {
        let breaker = CircuitBreaker::new(BreakerPolicy::new(2, Duration::from_secs(60)));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(breaker.try_acquire());
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let breaker = CircuitBreaker::new(BreakerPolicy::new(1, Duration::from_millis(0)));
        // zero cooldown disables the breaker entirely
        breaker.record_failure();
        assert!(breaker.try_acquire());

        let breaker = CircuitBreaker::new(BreakerPolicy::new(1, Duration::from_nanos(1)));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(1));
        assert!(breaker.try_acquire());
        // probe in flight, nothing else gets through
        assert!(!breaker.try_acquire());
        breaker.record_success();
        assert!(breaker.try_acquire());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(BreakerPolicy::new(1, Duration::from_secs(60)));
        breaker.record_failure();
        assert!(!breaker.try_acquire());
    }
}
