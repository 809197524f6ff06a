//! In-memory enforcement backend.
//!
//! Tracks the same two rules per address that the iptables backend installs,
//! without touching the host. Used for `mode = "dry-run"` and throughout the
//! tests, where failure injection exercises the rollback paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use super::{EnforcementBackend, RuleKind};
use crate::error::EnforcementError;

/// Calls kept in the log; older ones are dropped.
const MAX_CALL_LOG: usize = 1024;

/// One call made against the backend, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementCall {
    Grant(IpAddr),
    Revoke(IpAddr),
}

#[derive(Default)]
struct RuleTable {
    forward: HashSet<IpAddr>,
    bypass: HashSet<IpAddr>,
    base_installed: bool,
    calls: VecDeque<EnforcementCall>,
    /// Install steps that fail for a given address.
    failing_steps: HashMap<IpAddr, RuleKind>,
    fail_revokes: bool,
}

impl RuleTable {
    fn record(&mut self, call: EnforcementCall) {
        if self.calls.len() == MAX_CALL_LOG {
            self.calls.pop_front();
        }
        self.calls.push_back(call);
    }
}

/// Rule table held in process memory.
#[derive(Default)]
pub struct MemoryBackend {
    table: Mutex<RuleTable>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `kind` install step fail for `address` on every later grant.
    pub async fn fail_step(&self, address: IpAddr, kind: RuleKind) {
        self.table.lock().await.failing_steps.insert(address, kind);
    }

    /// Clear an injected install failure.
    pub async fn clear_failure(&self, address: IpAddr) {
        self.table.lock().await.failing_steps.remove(&address);
    }

    /// Make every revoke report an execution failure (rules are still removed).
    pub async fn fail_revokes(&self, fail: bool) {
        self.table.lock().await.fail_revokes = fail;
    }

    /// The most recent calls, oldest first.
    pub async fn calls(&self) -> Vec<EnforcementCall> {
        self.table.lock().await.calls.iter().copied().collect()
    }

    pub async fn grants(&self) -> Vec<IpAddr> {
        self.calls()
            .await
            .into_iter()
            .filter_map(|c| match c {
                EnforcementCall::Grant(a) => Some(a),
                EnforcementCall::Revoke(_) => None,
            })
            .collect()
    }

    pub async fn revokes(&self) -> Vec<IpAddr> {
        self.calls()
            .await
            .into_iter()
            .filter_map(|c| match c {
                EnforcementCall::Revoke(a) => Some(a),
                EnforcementCall::Grant(_) => None,
            })
            .collect()
    }

    /// Both rules present.
    pub async fn is_granted(&self, address: IpAddr) -> bool {
        let t = self.table.lock().await;
        t.forward.contains(&address) && t.bypass.contains(&address)
    }

    pub async fn has_forward_rule(&self, address: IpAddr) -> bool {
        self.table.lock().await.forward.contains(&address)
    }

    pub async fn has_bypass_rule(&self, address: IpAddr) -> bool {
        self.table.lock().await.bypass.contains(&address)
    }

    /// Every address with either rule installed.
    pub async fn granted_addresses(&self) -> HashSet<IpAddr> {
        let t = self.table.lock().await;
        t.forward.union(&t.bypass).copied().collect()
    }

    pub async fn base_installed(&self) -> bool {
        self.table.lock().await.base_installed
    }
}

#[async_trait]
impl EnforcementBackend for MemoryBackend {
    async fn grant(&self, address: IpAddr) -> Result<(), EnforcementError> {
        let mut t = self.table.lock().await;
        t.record(EnforcementCall::Grant(address));
        let failing = t.failing_steps.get(&address).copied();

        if failing == Some(RuleKind::Forward) {
            return Err(EnforcementError::Rejected {
                rule: RuleKind::Forward,
                address,
                detail: "injected failure".to_string(),
            });
        }
        t.forward.insert(address);

        if failing == Some(RuleKind::PortalBypass) {
            t.forward.remove(&address);
            return Err(EnforcementError::Rejected {
                rule: RuleKind::PortalBypass,
                address,
                detail: "injected failure".to_string(),
            });
        }
        t.bypass.insert(address);
        info!(%address, "dry-run: granted network access");
        Ok(())
    }

    async fn revoke(&self, address: IpAddr) -> Result<(), EnforcementError> {
        let mut t = self.table.lock().await;
        t.record(EnforcementCall::Revoke(address));
        t.forward.remove(&address);
        t.bypass.remove(&address);
        if t.fail_revokes {
            return Err(EnforcementError::Timeout {
                program: "dry-run".to_string(),
            });
        }
        info!(%address, "dry-run: revoked network access");
        Ok(())
    }

    async fn install_base_rules(&self) -> Result<(), EnforcementError> {
        self.table.lock().await.base_installed = true;
        info!("dry-run: base rules installed");
        Ok(())
    }

    async fn remove_base_rules(&self) -> Result<(), EnforcementError> {
        self.table.lock().await.base_installed = false;
        info!("dry-run: base rules removed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dry-run"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_grant_and_revoke_are_idempotent() {
        let backend = MemoryBackend::new();
        let a = ip("10.0.0.5");

        backend.grant(a).await.unwrap();
        backend.grant(a).await.unwrap();
        assert!(backend.is_granted(a).await);

        backend.revoke(a).await.unwrap();
        backend.revoke(a).await.unwrap();
        assert!(!backend.is_granted(a).await);
        assert!(backend.granted_addresses().await.is_empty());
        assert_eq!(backend.grants().await, vec![a, a]);
        assert_eq!(backend.revokes().await, vec![a, a]);
    }

    #[tokio::test]
    async fn test_bypass_failure_rolls_back_forward() {
        let backend = MemoryBackend::new();
        let a = ip("10.0.0.5");
        backend.fail_step(a, RuleKind::PortalBypass).await;

        let err = backend.grant(a).await.unwrap_err();
        assert!(matches!(
            err,
            EnforcementError::Rejected {
                rule: RuleKind::PortalBypass,
                ..
            }
        ));
        assert!(!backend.has_forward_rule(a).await);
        assert!(!backend.has_bypass_rule(a).await);

        backend.clear_failure(a).await;
        backend.grant(a).await.unwrap();
        assert!(backend.is_granted(a).await);
    }

    #[tokio::test]
    async fn test_failed_revoke_still_removes_rules() {
        let backend = MemoryBackend::new();
        let a = ip("10.0.0.5");
        backend.grant(a).await.unwrap();
        backend.fail_revokes(true).await;

        assert!(backend.revoke(a).await.unwrap_err().is_execution_failure());
        assert!(!backend.is_granted(a).await);
    }

    #[tokio::test]
    async fn test_base_rules_toggle() {
        let backend = MemoryBackend::new();
        backend.install_base_rules().await.unwrap();
        assert!(backend.base_installed().await);
        backend.remove_base_rules().await.unwrap();
        assert!(!backend.base_installed().await);
    }

    #[tokio::test]
    async fn test_call_log_is_bounded() {
        let backend = MemoryBackend::new();
        let a = ip("10.0.0.5");
        for _ in 0..MAX_CALL_LOG {
            backend.grant(a).await.unwrap();
        }
        backend.revoke(a).await.unwrap();

        let calls = backend.calls().await;
        assert_eq!(calls.len(), MAX_CALL_LOG);
        assert_eq!(calls.last(), Some(&EnforcementCall::Revoke(a)));
        assert_eq!(backend.revokes().await, vec![a]);
    }
}
