//! Retry manager: failure counting and exponential backoff
//!
//! Retry state lives on the deployment itself (`failure_count`,
//! `next_retry_at`); this component decides what that state should become.

use berth_core::{BerthError, BerthResult, Deployment, DeploymentId, RetryPolicy, StateKind};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;
use tracing::{info, warn};

/// Outcome of recording a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again once the backoff expires
    Backoff {
        attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Budget spent; the deployment must become failed
    Exhausted { failures: u32 },
}

/// Applies the retry policy to deployments
#[derive(Debug, Clone)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Exponential delay for a failure count, before jitter
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63);
        let delay = self
            .policy
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.policy.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Delay including uniform jitter of up to `jitter_ratio` of the delay
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let base = self.base_delay(failures);
        let max_jitter = (base.as_millis() as f64 * self.policy.jitter_ratio) as u64;
        if max_jitter == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=max_jitter);
        base + Duration::from_millis(jitter)
    }

    /// Count a start or runtime failure against the budget
    pub fn record_failure(&self, deployment: &mut Deployment, now: DateTime<Utc>) -> RetryDecision {
        deployment.failure_count += 1;
        let failures = deployment.failure_count;

        if failures >= self.policy.max_failures {
            deployment.next_retry_at = None;
            warn!(
                deployment_id = %deployment.id,
                failures = failures,
                "Retry budget exhausted"
            );
            return RetryDecision::Exhausted { failures };
        }

        let delay = self.backoff_delay(failures);
        let next_retry_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        deployment.next_retry_at = Some(next_retry_at);

        info!(
            deployment_id = %deployment.id,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            "Scheduled retry with backoff"
        );
        RetryDecision::Backoff {
            attempt: failures,
            next_retry_at,
        }
    }

    /// Preemption is not the deployment's fault: eligible again immediately
    pub fn record_preemption(&self, deployment: &mut Deployment) {
        deployment.next_retry_at = None;
    }

    /// A placed deployment no longer waits on a backoff
    pub fn record_admission(&self, deployment: &mut Deployment) {
        deployment.next_retry_at = None;
    }

    /// Drop a backoff that has run out, so it is reported due only once
    ///
    /// Returns whether the deployment changed.
    pub fn clear_expired(&self, deployment: &mut Deployment, now: DateTime<Utc>) -> bool {
        if deployment.next_retry_at.is_some_and(|at| at <= now) {
            deployment.next_retry_at = None;
            return true;
        }
        false
    }

    /// Reset a failed deployment so it can be re-enqueued
    pub fn manual_retry(&self, deployment: &mut Deployment) -> BerthResult<()> {
        if deployment.kind() != StateKind::Failed {
            return Err(BerthError::InvalidState {
                deployment: deployment.id,
                state: deployment.kind(),
                reason: "only failed deployments can be retried".to_string(),
            });
        }
        deployment.failure_count = 0;
        deployment.next_retry_at = None;
        deployment.failure_reason = None;
        Ok(())
    }

    /// Whether re-evaluation may attempt admission now
    pub fn is_eligible(&self, deployment: &Deployment, now: DateTime<Utc>) -> bool {
        deployment.kind() == StateKind::Pending
            && deployment.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Pending deployments whose backoff has expired
    pub fn due<'a>(
        &self,
        deployments: impl IntoIterator<Item = &'a Deployment>,
        now: DateTime<Utc>,
    ) -> Vec<DeploymentId> {
        deployments
            .into_iter()
            .filter(|d| {
                d.kind() == StateKind::Pending && d.next_retry_at.is_some_and(|at| at <= now)
            })
            .map(|d| d.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{DeploymentRequest, DeploymentState, Priority, ResourceVector, TransitionCause};

    fn policy(max_failures: u32, jitter_ratio: f64) -> RetryPolicy {
        RetryPolicy {
            max_failures,
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            jitter_ratio,
        }
    }

    fn deployment() -> Deployment {
        Deployment::new(
            DeploymentRequest::new(
                "job".to_string(),
                "image".to_string(),
                ResourceVector::units(1, 0, 0),
                Priority::LOW,
            ),
            Utc::now(),
        )
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let retry = RetryManager::new(policy(10, 0.0));
        assert_eq!(retry.base_delay(1), Duration::from_millis(1_000));
        assert_eq!(retry.base_delay(2), Duration::from_millis(2_000));
        assert_eq!(retry.base_delay(3), Duration::from_millis(4_000));
        assert_eq!(retry.base_delay(4), Duration::from_millis(5_000));
        assert_eq!(retry.base_delay(200), Duration::from_millis(5_000));
        assert_eq!(retry.backoff_delay(2), Duration::from_millis(2_000));
    }

    #[test]
    fn test_jitter_bounds() {
        let retry = RetryManager::new(policy(10, 0.5));
        for _ in 0..50 {
            let delay = retry.backoff_delay(1);
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay <= Duration::from_millis(1_500));
        }
    }

    #[test]
    fn test_record_failure_until_exhausted() {
        let retry = RetryManager::new(policy(3, 0.0));
        let mut d = deployment();
        let now = Utc::now();

        match retry.record_failure(&mut d, now) {
            RetryDecision::Backoff {
                attempt,
                next_retry_at,
            } => {
                assert_eq!(attempt, 1);
                assert_eq!(next_retry_at, now + chrono::Duration::seconds(1));
            }
            other => panic!("unexpected decision: {:?}", other),
        }
        assert!(!retry.is_eligible(&d, now));
        assert!(retry.is_eligible(&d, now + chrono::Duration::seconds(1)));

        assert!(matches!(
            retry.record_failure(&mut d, now),
            RetryDecision::Backoff { attempt: 2, .. }
        ));
        assert_eq!(
            retry.record_failure(&mut d, now),
            RetryDecision::Exhausted { failures: 3 }
        );
        assert!(d.next_retry_at.is_none());
    }

    #[test]
    fn test_preemption_does_not_count() {
        let retry = RetryManager::new(policy(3, 0.0));
        let mut d = deployment();
        d.next_retry_at = Some(Utc::now() + chrono::Duration::hours(1));

        retry.record_preemption(&mut d);
        assert_eq!(d.failure_count, 0);
        assert!(retry.is_eligible(&d, Utc::now()));
    }

    #[test]
    fn test_manual_retry_requires_failed() {
        let retry = RetryManager::new(policy(1, 0.0));
        let mut d = deployment();
        assert!(matches!(
            retry.manual_retry(&mut d).unwrap_err(),
            BerthError::InvalidState { .. }
        ));

        let now = Utc::now();
        let allocation = berth_core::Allocation::new(d.id, uuid::Uuid::new_v4(), d.resources, now);
        d.transition(DeploymentState::Scheduled { allocation }, TransitionCause::Admitted, now)
            .unwrap();
        retry.record_failure(&mut d, now);
        d.transition(
            DeploymentState::Failed {
                reason: "boom".to_string(),
            },
            TransitionCause::RetryExhausted,
            now,
        )
        .unwrap();

        retry.manual_retry(&mut d).unwrap();
        assert_eq!(d.failure_count, 0);
        assert!(d.failure_reason.is_none());
    }

    #[test]
    fn test_due() {
        let retry = RetryManager::new(policy(5, 0.0));
        let now = Utc::now();
        let mut waiting = deployment();
        waiting.next_retry_at = Some(now - chrono::Duration::seconds(1));
        let mut later = deployment();
        later.next_retry_at = Some(now + chrono::Duration::seconds(30));
        let fresh = deployment();

        let due = retry.due([&waiting, &later, &fresh], now);
        assert_eq!(due, vec![waiting.id]);

        assert!(retry.clear_expired(&mut waiting, now));
        assert!(!retry.clear_expired(&mut later, now));
        assert!(retry.is_eligible(&waiting, now));
        assert!(retry.due([&waiting, &later, &fresh], now).is_empty());
    }
}
