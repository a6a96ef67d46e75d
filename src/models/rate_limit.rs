use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Token bucket parameters: `capacity` tokens, one token regained per `refill_interval`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketPolicy {
    pub capacity: f64,
    pub refill_interval: Duration,
}

impl BucketPolicy {
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_interval,
        }
    }

    /// Seconds until a bucket holding `tokens` can admit one more request.
    pub fn retry_after(&self, tokens: f64) -> Duration {
        let deficit = (1.0 - tokens).max(0.0);
        let seconds = (deficit * self.refill_interval.as_secs_f64()).ceil() as u64;
        Duration::from_secs(seconds.max(1))
    }
}

/// Persisted bucket: remaining tokens and the unix second of the last write.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitDecision {
    Allow { remaining: f64 },
    Limited { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allow { .. })
    }
}

impl BucketState {
    /// Refill the bucket for the time elapsed since its last write and try to
    /// consume one token.
    ///
    /// Returns the decision and, when a token was consumed, the state to write
    /// back. A rejected request leaves the stored state untouched. The Redis
    /// script in `database::rate_limit` performs exactly this arithmetic.
    pub fn refill_and_take(current: Option<BucketState>, policy: &BucketPolicy, now: i64) -> (RateLimitDecision, Option<BucketState>) {
        let current = current.unwrap_or(BucketState {
            tokens: policy.capacity,
            last_refill: now,
        });

        let elapsed = (now - current.last_refill).max(0) as f64;
        let tokens = (current.tokens + elapsed / policy.refill_interval.as_secs_f64()).min(policy.capacity);

        if tokens < 1.0 {
            return (
                RateLimitDecision::Limited {
                    retry_after: policy.retry_after(tokens),
                },
                None,
            );
        }

        let remaining = tokens - 1.0;
        (
            RateLimitDecision::Allow { remaining },
            Some(BucketState {
                tokens: remaining,
                last_refill: now,
            }),
        )
    }
}


#[cfg(test)]
mod tests {
    use super::vectors::bucket_vectors;
    use super::*;
    use proptest::prelude::*;

    fn policy() -> BucketPolicy {
        BucketPolicy::new(5, Duration::from_secs(1))
    }

    #[test]
    fn fresh_bucket_admits_capacity_then_rejects() {
        let policy = policy();
        let now = 1_700_000_000;
        let mut state = None;
        for _ in 0..5 {
            let (decision, next) = BucketState::refill_and_take(state, &policy, now);
            assert!(decision.is_allowed());
            state = next;
        }

        let (decision, next) = BucketState::refill_and_take(state, &policy, now);
        assert!(matches!(decision, RateLimitDecision::Limited { retry_after } if retry_after == Duration::from_secs(1)));
        assert!(next.is_none());
    }

    #[test]
    fn bucket_refills_one_token_per_interval() {
        let policy = policy();
        let empty = Some(BucketState {
            tokens: 0.0,
            last_refill: 100,
        });

        let (decision, _) = BucketState::refill_and_take(empty, &policy, 100);
        assert!(!decision.is_allowed());

        let (decision, next) = BucketState::refill_and_take(empty, &policy, 102);
        assert!(matches!(decision, RateLimitDecision::Allow { remaining } if remaining == 1.0));
        assert_eq!(next.unwrap().last_refill, 102);
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let policy = policy();
        let stale = Some(BucketState { tokens: 2.0, last_refill: 0 });
        let (decision, _) = BucketState::refill_and_take(stale, &policy, 10_000);
        assert!(matches!(decision, RateLimitDecision::Allow { remaining } if remaining == 4.0));
    }

    #[test]
    fn clock_going_backwards_does_not_drain_bucket() {
        let policy = policy();
        let state = Some(BucketState {
            tokens: 3.0,
            last_refill: 200,
        });
        let (decision, _) = BucketState::refill_and_take(state, &policy, 150);
        assert!(matches!(decision, RateLimitDecision::Allow { remaining } if remaining == 2.0));
    }

    #[test]
    fn shared_bucket_vectors() {
        for vector in bucket_vectors() {
            let (decision, next) = BucketState::refill_and_take(vector.start, &vector.policy, vector.now);
            assert_eq!(decision, vector.decision, "{}", vector.name);
            assert_eq!(next.or(vector.start), vector.stored, "{}", vector.name);
        }
    }

    #[test]
    fn retry_after_scales_with_refill_interval() {
        let slow = BucketPolicy::new(5, Duration::from_secs(10));
        assert_eq!(slow.retry_after(0.0), Duration::from_secs(10));
        assert_eq!(slow.retry_after(0.75), Duration::from_secs(3));
        assert_eq!(policy().retry_after(0.99), Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn never_admits_more_than_capacity_without_time_passing(capacity in 1u32..50, attempts in 1usize..200) {
            let policy = BucketPolicy::new(capacity, Duration::from_secs(1));
            let mut state = None;
            let mut admitted = 0usize;
            for _ in 0..attempts {
                let (decision, next) = BucketState::refill_and_take(state, &policy, 42);
                if decision.is_allowed() {
                    admitted += 1;
                    state = next;
                }
            }
            prop_assert!(admitted <= capacity as usize);
            prop_assert_eq!(admitted, attempts.min(capacity as usize));
        }

        #[test]
        fn tokens_stay_within_bounds(tokens in 0.0f64..5.0, last in 0i64..1_000, now in 0i64..2_000) {
            let policy = policy();
            let (_, next) = BucketState::refill_and_take(Some(BucketState { tokens, last_refill: last }), &policy, now);
            if let Some(next) = next {
                prop_assert!(next.tokens >= 0.0);
                prop_assert!(next.tokens <= policy.capacity - 1.0);
            }
        }
    }
}
