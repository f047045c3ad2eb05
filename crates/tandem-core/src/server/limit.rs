//! Admission policies.

use crate::error::{Result, TandemError};
use governor::{DefaultDirectRateLimiter, Quota};
use std::num::NonZeroU32;

/// Decides whether one more request may run.
pub trait Limiter: Send + Sync {
    fn allow(&self) -> bool;
}

impl<F> Limiter for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn allow(&self) -> bool {
        self()
    }
}

/// Token bucket limiter: `n` requests per second with a burst of `n`.
pub struct RateLimiter {
    inner: DefaultDirectRateLimiter,
    per_second: u32,
}

impl RateLimiter {
    pub fn per_second(n: u32) -> Result<Self> {
        let rate = NonZeroU32::new(n).ok_or_else(|| TandemError::Config {
            message: "rate limit must be at least 1 per second".to_string(),
        })?;

        Ok(Self {
            inner: governor::RateLimiter::direct(Quota::per_second(rate)),
            per_second: n,
        })
    }

    pub fn rate(&self) -> u32 {
        self.per_second
    }
}

impl Limiter for RateLimiter {
    fn allow(&self) -> bool {
        self.inner.check().is_ok()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("per_second", &self.per_second)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_closure_limiter() {
        let budget = AtomicUsize::new(2);
        let limiter = move || {
            budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        };

        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn test_rate_limiter_burst() {
        let limiter = RateLimiter::per_second(3).unwrap();
        assert_eq!(limiter.rate(), 3);

        let admitted = (0..10).filter(|_| limiter.allow()).count();
        assert_eq!(admitted, 3);
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(matches!(
            RateLimiter::per_second(0),
            Err(TandemError::Config { .. })
        ));
    }
}
