//! Periodic removal of expired sessions.
//!
//! Each tick takes every expired session out of the store in one transaction,
//! then revokes their addresses. Revocation failures are logged and counted
//! but never put a session back: expiry is final.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::access::revoke_unowned;
use crate::activity::{ActivityKind, ActivityLog, Subject};
use crate::enforcement::EnforcementBackend;
use crate::store::SessionStore;
use crate::util::{truncate_token, Clock};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub revoke_failures: usize,
}

pub struct ExpirySweeper {
    store: SessionStore,
    enforcement: Arc<dyn EnforcementBackend>,
    activity: Arc<ActivityLog>,
    clock: Clock,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(
        store: SessionStore,
        enforcement: Arc<dyn EnforcementBackend>,
        activity: Arc<ActivityLog>,
        clock: Clock,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            enforcement,
            activity,
            clock,
            interval,
        }
    }

    /// Run a single sweep now.
    pub async fn sweep_once(&self) -> SweepReport {
        let now = self.clock.now();
        let expired = self
            .store
            .transaction(|idx| {
                let tokens = idx.expired_tokens(now);
                Ok::<_, std::convert::Infallible>(
                    tokens.iter().filter_map(|t| idx.remove(t)).collect::<Vec<_>>(),
                )
            })
            .await
            .unwrap_or_default();

        let mut report = SweepReport {
            expired: expired.len(),
            revoke_failures: 0,
        };
        for session in &expired {
            info!(
                device = %session.device_id,
                token = %truncate_token(&session.token),
                addresses = session.active_addresses.len(),
                "Session expired"
            );
            report.revoke_failures += revoke_unowned(
                &self.store,
                self.enforcement.as_ref(),
                session.active_addresses.iter().copied(),
                "expired",
            )
            .await;
            self.activity
                .log(
                    ActivityKind::Expired,
                    Subject::device(&session.device_id, &session.token),
                    format!("expired after {} minutes", session.duration_minutes),
                )
                .await;
        }
        if report.revoke_failures > 0 {
            warn!(
                failures = report.revoke_failures,
                "Some firewall rules could not be removed for expired sessions"
            );
        }
        report
    }

    /// Sweep every `interval` until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("Expiry sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let report = self.sweep_once().await;
                        if report.expired > 0 {
                            debug!(expired = report.expired, "Sweep finished");
                        }
                    }
                }
            }
        })
    }
}
