//! `iptables`-backed enforcement.
//!
//! Every rule is addressed by its full match specification, so "is it
//! installed" is a single `-C` check. Installs are check-then-insert and
//! removals are check-then-delete (looped, in case an older process inserted
//! duplicates), which makes both idempotent. IPv6 clients use `ip6tables`.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::command::{self, Invocation};
use super::{EnforcementBackend, RuleKind};
use crate::config::FirewallConfig;
use crate::error::EnforcementError;

/// Upper bound on duplicate deletions per rule.
const MAX_DUPLICATE_DELETES: usize = 8;

/// Where a new rule lands in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    /// `-I <chain> 1`: ahead of the portal's catch-all rules.
    Top,
    /// `-A <chain>`.
    Append,
}

/// One fully specified rule.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    table: &'static str,
    chain: &'static str,
    spec: Vec<String>,
    position: Position,
}

impl Rule {
    fn args(&self, op: &str) -> Vec<String> {
        let mut args = vec!["-t".to_string(), self.table.to_string(), op.to_string()];
        args.push(self.chain.to_string());
        if op == "-I" && self.position == Position::Top {
            args.push("1".to_string());
        }
        args.extend(self.spec.iter().cloned());
        args
    }

    fn check_args(&self) -> Vec<String> {
        self.args("-C")
    }

    fn install_args(&self) -> Vec<String> {
        match self.position {
            Position::Top => self.args("-I"),
            Position::Append => self.args("-A"),
        }
    }

    fn delete_args(&self) -> Vec<String> {
        self.args("-D")
    }

    fn describe(&self) -> String {
        format!("{}/{} {}", self.table, self.chain, self.spec.join(" "))
    }
}

fn strs(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// `FORWARD -s <addr> -j ACCEPT`.
fn forward_rule(address: IpAddr) -> Rule {
    Rule {
        table: "filter",
        chain: "FORWARD",
        spec: vec![
            "-s".to_string(),
            address.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ],
        position: Position::Top,
    }
}

/// `nat PREROUTING -s <addr> -j ACCEPT`: matched before the portal DNAT.
fn bypass_rule(address: IpAddr) -> Rule {
    Rule {
        table: "nat",
        chain: "PREROUTING",
        spec: vec![
            "-s".to_string(),
            address.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ],
        position: Position::Top,
    }
}

fn rule_for(kind: RuleKind, address: IpAddr) -> Rule {
    match kind {
        RuleKind::Forward => forward_rule(address),
        RuleKind::PortalBypass => bypass_rule(address),
    }
}

/// Portal plumbing installed once at startup (IPv4 only).
fn base_rules(cfg: &FirewallConfig, gateway: &str, portal_port: u16) -> Vec<Rule> {
    let lan = cfg.lan_interface.as_str();
    let wan = cfg.wan_interface.as_str();
    let port = portal_port.to_string();
    vec![
        Rule {
            table: "filter",
            chain: "FORWARD",
            spec: strs(&[
                "-i", wan, "-o", lan, "-m", "state", "--state", "RELATED,ESTABLISHED", "-j",
                "ACCEPT",
            ]),
            position: Position::Append,
        },
        Rule {
            table: "nat",
            chain: "PREROUTING",
            spec: strs(&[
                "-i",
                lan,
                "-p",
                "tcp",
                "--dport",
                "80",
                "-j",
                "DNAT",
                "--to-destination",
                &format!("{gateway}:{port}"),
            ]),
            position: Position::Append,
        },
        Rule {
            table: "nat",
            chain: "PREROUTING",
            spec: strs(&[
                "-i",
                lan,
                "-p",
                "udp",
                "--dport",
                "53",
                "-j",
                "DNAT",
                "--to-destination",
                &format!("{gateway}:53"),
            ]),
            position: Position::Append,
        },
        Rule {
            table: "filter",
            chain: "INPUT",
            spec: strs(&["-i", lan, "-p", "tcp", "--dport", &port, "-j", "ACCEPT"]),
            position: Position::Append,
        },
    ]
}

/// Enforcement through the host's `iptables` binaries.
pub struct IptablesBackend {
    config: FirewallConfig,
    gateway: String,
    portal_port: u16,
    timeout: Duration,
}

impl IptablesBackend {
    pub fn new(config: FirewallConfig, gateway: String, portal_port: u16) -> Self {
        let timeout = Duration::from_millis(config.command_timeout_ms);
        Self {
            config,
            gateway,
            portal_port,
            timeout,
        }
    }

    fn binary_for(&self, address: IpAddr) -> &str {
        match address {
            IpAddr::V4(_) => &self.config.iptables,
            IpAddr::V6(_) => &self.config.ip6tables,
        }
    }

    async fn exec(
        &self,
        program: &str,
        args: Vec<String>,
    ) -> Result<command::CommandOutput, EnforcementError> {
        let invocation = Invocation::new(program, args, self.config.use_sudo);
        debug!("firewall: {}", invocation.display());
        command::run(&invocation, self.timeout).await
    }

    async fn is_installed(&self, program: &str, rule: &Rule) -> Result<bool, EnforcementError> {
        Ok(self.exec(program, rule.check_args()).await?.success())
    }

    /// Install `rule` unless it is already present.
    async fn ensure(&self, program: &str, rule: &Rule) -> Result<(), String> {
        match self.is_installed(program, rule).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => return Err(e.to_string()),
        }
        match self.exec(program, rule.install_args()).await {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(out.detail()),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Delete every copy of `rule`. Only an execution failure is an error.
    async fn remove(&self, program: &str, rule: &Rule) -> Result<(), EnforcementError> {
        for _ in 0..MAX_DUPLICATE_DELETES {
            if !self.is_installed(program, rule).await? {
                return Ok(());
            }
            let out = self.exec(program, rule.delete_args()).await?;
            if !out.success() {
                warn!("firewall: delete of {} refused: {}", rule.describe(), out.detail());
                return Ok(());
            }
        }
        warn!(
            "firewall: {} still present after {MAX_DUPLICATE_DELETES} deletes",
            rule.describe()
        );
        Ok(())
    }

    async fn ensure_kind(&self, kind: RuleKind, address: IpAddr) -> Result<(), EnforcementError> {
        let program = self.binary_for(address).to_string();
        self.ensure(&program, &rule_for(kind, address))
            .await
            .map_err(|detail| EnforcementError::Rejected {
                rule: kind,
                address,
                detail,
            })
    }

    async fn remove_kind(&self, kind: RuleKind, address: IpAddr) -> Result<(), EnforcementError> {
        let program = self.binary_for(address).to_string();
        self.remove(&program, &rule_for(kind, address)).await
    }

    async fn set_forward_policy(&self, policy: &str) -> Result<(), EnforcementError> {
        let out = self
            .exec(&self.config.iptables, strs(&["-P", "FORWARD", policy]))
            .await?;
        if out.success() {
            Ok(())
        } else {
            Err(EnforcementError::BaseRule {
                rule: format!("FORWARD policy {policy}"),
                detail: out.detail(),
            })
        }
    }

    async fn set_ip_forward(&self, enabled: bool) -> Result<(), EnforcementError> {
        let value = if enabled { "1" } else { "0" };
        let out = self
            .exec(
                &self.config.sysctl,
                vec!["-w".to_string(), format!("net.ipv4.ip_forward={value}")],
            )
            .await?;
        if out.success() {
            Ok(())
        } else {
            Err(EnforcementError::BaseRule {
                rule: "net.ipv4.ip_forward".to_string(),
                detail: out.detail(),
            })
        }
    }
}

#[async_trait]
impl EnforcementBackend for IptablesBackend {
    async fn grant(&self, address: IpAddr) -> Result<(), EnforcementError> {
        self.ensure_kind(RuleKind::Forward, address).await?;
        if let Err(e) = self.ensure_kind(RuleKind::PortalBypass, address).await {
            if let Err(undo) = self.remove_kind(RuleKind::Forward, address).await {
                warn!(%address, "firewall: could not roll back forward rule: {undo}");
            }
            return Err(e);
        }
        info!(%address, "Granted network access");
        Ok(())
    }

    async fn revoke(&self, address: IpAddr) -> Result<(), EnforcementError> {
        // Both removals run even if the first fails.
        let forward = self.remove_kind(RuleKind::Forward, address).await;
        let bypass = self.remove_kind(RuleKind::PortalBypass, address).await;
        forward?;
        bypass?;
        info!(%address, "Revoked network access");
        Ok(())
    }

    async fn install_base_rules(&self) -> Result<(), EnforcementError> {
        info!("Installing captive portal base rules");
        let mut first_error = None;

        if let Err(e) = self.set_forward_policy("DROP").await {
            warn!("firewall: {e}");
            first_error.get_or_insert(e);
        }
        for rule in base_rules(&self.config, &self.gateway, self.portal_port) {
            if let Err(detail) = self.ensure(&self.config.iptables, &rule).await {
                warn!("firewall: base rule {} failed: {detail}", rule.describe());
                first_error.get_or_insert(EnforcementError::BaseRule {
                    rule: rule.describe(),
                    detail,
                });
            }
        }
        if let Err(e) = self.set_ip_forward(true).await {
            warn!("firewall: {e}");
            first_error.get_or_insert(e);
        }

        match first_error {
            None => {
                info!("Captive portal base rules installed");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    async fn remove_base_rules(&self) -> Result<(), EnforcementError> {
        info!("Removing captive portal base rules");
        let mut first_error = None;
        for rule in base_rules(&self.config, &self.gateway, self.portal_port) {
            if let Err(e) = self.remove(&self.config.iptables, &rule).await {
                warn!("firewall: {e}");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.set_forward_policy("ACCEPT").await {
            warn!("firewall: {e}");
            first_error.get_or_insert(e);
        }
        first_error.map_or(Ok(()), Err)
    }

    fn name(&self) -> &'static str {
        "iptables"
    }
}
