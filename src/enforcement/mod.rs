//! Firewall enforcement of session state.
//!
//! The engine only ever asks two questions of the firewall: *let this address
//! out* ([`EnforcementBackend::grant`]) and *stop letting it out*
//! ([`EnforcementBackend::revoke`]). Each grant is two rules:
//!
//! | Rule                        | Effect                                          |
//! |-----------------------------|-------------------------------------------------|
//! | [`RuleKind::Forward`]       | `FORWARD -s <addr> -j ACCEPT`: traffic may leave |
//! | [`RuleKind::PortalBypass`]  | `nat PREROUTING -s <addr> -j ACCEPT`: skip the portal DNAT |
//!
//! Both operations are idempotent and safe to call in any order for the same
//! address. A failed `grant` never leaves the first rule behind.
//!
//! Backends:
//!
//! - [`iptables::IptablesBackend`]: shells out to `iptables`/`ip6tables`
//! - [`memory::MemoryBackend`]: in-memory rule table, used for `mode = "dry-run"`
//!   and by the tests

pub mod command;
pub mod iptables;
pub mod memory;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{FirewallConfig, FirewallMode, PortalConfig};
use crate::error::EnforcementError;
use crate::store::Session;

/// The two halves of a per-address grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Forward,
    PortalBypass,
}

impl RuleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::PortalBypass => "portal_bypass",
        }
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability to permit or withdraw traffic for a client address.
#[async_trait]
pub trait EnforcementBackend: Send + Sync {
    /// Install forward-permit then portal-bypass for `address`. If the second
    /// install fails the first is removed again before returning the error.
    async fn grant(&self, address: IpAddr) -> Result<(), EnforcementError>;

    /// Remove both rules for `address`. Absent rules are not an error; this
    /// only fails when the host command could not run.
    async fn revoke(&self, address: IpAddr) -> Result<(), EnforcementError>;

    /// Global setup: forwarding on, default deny, redirect unauthenticated
    /// HTTP and DNS to the portal.
    async fn install_base_rules(&self) -> Result<(), EnforcementError>;

    /// Undo [`install_base_rules`](Self::install_base_rules).
    async fn remove_base_rules(&self) -> Result<(), EnforcementError>;

    /// Short name for logs and `/api/health`.
    fn name(&self) -> &'static str;
}

/// Build the backend selected by `[firewall] mode`.
pub fn from_config(
    firewall: &FirewallConfig,
    portal: &PortalConfig,
) -> Arc<dyn EnforcementBackend> {
    match firewall.mode {
        FirewallMode::Iptables => Arc::new(iptables::IptablesBackend::new(
            firewall.clone(),
            portal.gateway_address.clone(),
            portal.port,
        )),
        FirewallMode::DryRun => {
            info!("Firewall dry-run mode: rules are tracked in memory only");
            Arc::new(memory::MemoryBackend::new())
        }
    }
}

/// Revoke every address of a retired session. Failures are logged and
/// counted, never propagated: the session is gone either way.
pub async fn revoke_session(
    backend: &dyn EnforcementBackend,
    session: &Session,
    reason: &str,
) -> usize {
    revoke_addresses(backend, session.active_addresses.iter().copied(), reason).await
}

/// Revoke each address in turn, returning how many revocations failed.
pub async fn revoke_addresses(
    backend: &dyn EnforcementBackend,
    addresses: impl IntoIterator<Item = IpAddr>,
    reason: &str,
) -> usize {
    let mut failures = 0;
    for address in addresses {
        if let Err(e) = backend.revoke(address).await {
            failures += 1;
            warn!(%address, reason, "Revoke failed, rule may be left behind: {e}");
        }
    }
    failures
}
