use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::Domain;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Checking,
    Available,
    Unavailable,
}

/// Per-domain belief about whether the remote strategy is viable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendHealth {
    pub state: HealthState,
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl BackendHealth {
    fn unknown() -> Self {
        Self {
            state: HealthState::Unknown,
            last_checked_at: None,
            detail: None,
        }
    }
}

/// How a health probe is retried before settling on `unavailable`.
#[derive(Debug, Clone)]
pub struct ProbePolicy {
    pub timeout: Duration,
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Owns one domain's [`BackendHealth`].
///
/// Every transition goes through [`HealthMonitor::transition`]. At most one
/// probe runs at a time; concurrent callers wait on the probe gate and then
/// read the settled state instead of probing again.
pub struct HealthMonitor {
    domain: Domain,
    policy: ProbePolicy,
    state: RwLock<BackendHealth>,
    probe_gate: Mutex<()>,
}

impl HealthMonitor {
    pub fn new(domain: Domain, policy: ProbePolicy) -> Self {
        Self {
            domain,
            policy,
            state: RwLock::new(BackendHealth::unknown()),
            probe_gate: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> BackendHealth {
        self.read().clone()
    }

    pub fn state(&self) -> HealthState {
        self.read().state
    }

    fn read(&self) -> RwLockReadGuard<'_, BackendHealth> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Settle an `unknown` state by probing; other states are returned as-is.
    pub async fn ensure_checked<F, Fut>(&self, probe: F) -> HealthState
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if !matches!(self.state(), HealthState::Unknown | HealthState::Checking) {
            return self.state();
        }

        let _gate = self.probe_gate.lock().await;
        // A probe abandoned mid-flight leaves `checking` behind; holding the gate
        // means nobody else is probing, so both states get a fresh probe.
        let current = self.state();
        if !matches!(current, HealthState::Unknown | HealthState::Checking) {
            return current;
        }

        self.transition(HealthState::Checking, None);
        let mut last_error = String::new();
        for attempt in 1..=self.policy.attempts.max(1) {
            match tokio::time::timeout(self.policy.timeout, probe()).await {
                Ok(Ok(())) => {
                    self.transition(HealthState::Available, None);
                    return HealthState::Available;
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!(
                        "health probe timed out after {}s",
                        self.policy.timeout.as_secs_f64()
                    )
                }
            }
            debug!(domain = %self.domain, attempt, error = %last_error, "Health probe failed");
            if attempt < self.policy.attempts {
                tokio::time::sleep(self.policy.backoff).await;
            }
        }

        self.transition(HealthState::Unavailable, Some(last_error));
        HealthState::Unavailable
    }

    /// Immediate demotion after a connectivity failure. Unconditional overwrite.
    pub fn demote(&self, reason: impl Into<String>) {
        self.transition(HealthState::Unavailable, Some(reason.into()));
    }

    /// Forget the current belief so the next call probes again.
    pub fn reset(&self) {
        self.transition(HealthState::Unknown, None);
    }

    fn transition(&self, next: HealthState, detail: Option<String>) {
        let previous = {
            let mut current = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let last_checked_at = match next {
                HealthState::Unknown | HealthState::Checking => current.last_checked_at,
                HealthState::Available | HealthState::Unavailable => Some(Utc::now()),
            };
            std::mem::replace(
                &mut *current,
                BackendHealth {
                    state: next,
                    last_checked_at,
                    detail: detail.clone(),
                },
            )
        };

        if previous.state == next {
            return;
        }
        match next {
            HealthState::Unavailable => warn!(
                domain = %self.domain,
                from = ?previous.state,
                reason = detail.as_deref().unwrap_or(""),
                "Remote backend marked unavailable"
            ),
            HealthState::Available => {
                info!(domain = %self.domain, from = ?previous.state, "Remote backend available")
            }
            _ => debug!(domain = %self.domain, from = ?previous.state, to = ?next, "Health transition"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy() -> ProbePolicy {
        ProbePolicy {
            timeout: Duration::from_millis(200),
            attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_probe() {
        let monitor = Arc::new(HealthMonitor::new(Domain::Phospho, fast_policy()));
        let probes = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let monitor = monitor.clone();
            let probes = probes.clone();
            handles.push(tokio::spawn(async move {
                monitor
                    .ensure_checked(|| {
                        let probes = probes.clone();
                        async move {
                            probes.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(())
                        }
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), HealthState::Available);
        }
        assert_eq!(probes.load(Ordering::SeqCst), 1);
        assert!(monitor.snapshot().last_checked_at.is_some());
    }

    #[tokio::test]
    async fn retries_then_settles_unavailable() {
        let monitor = HealthMonitor::new(Domain::Proteomics, fast_policy());
        let probes = AtomicUsize::new(0);

        let state = monitor
            .ensure_checked(|| {
                probes.fetch_add(1, Ordering::SeqCst);
                async { Err(FlowError::BackendUnavailable("connection refused".to_string())) }
            })
            .await;

        assert_eq!(state, HealthState::Unavailable);
        assert_eq!(probes.load(Ordering::SeqCst), 3);
        assert!(monitor.snapshot().detail.unwrap().contains("connection refused"));

        // Settled: no automatic re-probe.
        let again = monitor
            .ensure_checked(|| {
                probes.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert_eq!(again, HealthState::Unavailable);
        assert_eq!(probes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn recovers_on_later_attempt() {
        let monitor = HealthMonitor::new(Domain::Transcriptome, fast_policy());
        let probes = AtomicUsize::new(0);

        let state = monitor
            .ensure_checked(|| {
                let n = probes.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(FlowError::BackendUnavailable("starting".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        assert_eq!(state, HealthState::Available);
        assert_eq!(probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_probe_counts_as_failure() {
        let monitor = HealthMonitor::new(
            Domain::SingleCell,
            ProbePolicy {
                timeout: Duration::from_millis(20),
                attempts: 1,
                backoff: Duration::ZERO,
            },
        );
        let state = monitor
            .ensure_checked(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(state, HealthState::Unavailable);
    }

    #[tokio::test]
    async fn demote_and_reset() {
        let monitor = HealthMonitor::new(Domain::Phospho, fast_policy());
        monitor.ensure_checked(|| async { Ok(()) }).await;
        assert_eq!(monitor.state(), HealthState::Available);

        monitor.demote("connection refused");
        assert_eq!(monitor.state(), HealthState::Unavailable);

        monitor.reset();
        assert_eq!(monitor.state(), HealthState::Unknown);
        assert_eq!(
            monitor.ensure_checked(|| async { Ok(()) }).await,
            HealthState::Available
        );
    }
}
