//! Authentication: turning `(token, device, address)` into network access.
//!
//! Every attempt follows the same shape: decide inside a store transaction,
//! act on the firewall after the lock is released, and if the firewall
//! refuses, undo the decision with a second transaction. The store is never
//! locked across an `.await`.
//!
//! | Situation                                   | Outcome                                |
//! |---------------------------------------------|----------------------------------------|
//! | token live on this device                   | reconnect (no validator call)          |
//! | token live on another device                | `TokenInUse`, no validator call        |
//! | device holds an expired session             | retired, then fresh authentication     |
//! | device holds a live session, other token    | validated; newest token wins           |
//! | no session                                  | validated, session created and granted |

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::activity::{ActivityKind, ActivityLog, Subject};
use crate::enforcement::{self, EnforcementBackend};
use crate::error::AccessError;
use crate::store::{AddressChange, Handover, Session, SessionIndices, SessionStore};
use crate::util::{truncate_token, Clock};
use crate::validator::BackendValidator;

/// Successful authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// A new session was created.
    Authenticated,
    /// An existing session was recognised. `address_added` is false when the
    /// address was already covered and nothing changed.
    Reconnected { address_added: bool },
}

impl AuthOutcome {
    pub fn message(self) -> &'static str {
        match self {
            Self::Authenticated => "Authentication successful",
            Self::Reconnected { .. } => "Reconnected successfully",
        }
    }
}

/// First decision, taken before the validator is consulted.
enum Plan {
    Reconnect(AddressChange),
    Fresh { retired: Vec<Session> },
}

/// Second decision, taken after a positive verdict.
enum Commit {
    /// A concurrent request created the same session meanwhile.
    Joined(AddressChange),
    Created {
        displaced: Vec<Session>,
        handovers: Vec<Handover>,
    },
}

/// Owns the authentication flow and operator revocation.
#[derive(Clone)]
pub struct AccessController {
    store: SessionStore,
    enforcement: Arc<dyn EnforcementBackend>,
    validator: Arc<dyn BackendValidator>,
    activity: Arc<ActivityLog>,
    clock: Clock,
}

impl AccessController {
    pub fn new(
        store: SessionStore,
        enforcement: Arc<dyn EnforcementBackend>,
        validator: Arc<dyn BackendValidator>,
        activity: Arc<ActivityLog>,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            enforcement,
            validator,
            activity,
            clock,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn enforcement(&self) -> &Arc<dyn EnforcementBackend> {
        &self.enforcement
    }

    /// Authenticate `token` for `device_id` at `address`.
    pub async fn authenticate(
        &self,
        token: &str,
        device_id: &str,
        address: IpAddr,
    ) -> Result<AuthOutcome, AccessError> {
        let token = token.trim();
        let device_id = device_id.trim();
        if token.is_empty() {
            return Err(AccessError::MissingField("token"));
        }
        if device_id.is_empty() {
            return Err(AccessError::MissingField("deviceId"));
        }
        let subject = Subject::new(device_id, address, token);

        let now = self.clock.now();
        let plan = self
            .store
            .transaction(|idx| decide_plan(idx, token, device_id, address, now))
            .await;
        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                self.reject(subject, &e).await;
                return Err(e);
            }
        };

        match plan {
            Plan::Reconnect(change) => {
                self.finish_reconnect(token, device_id, address, change)
                    .await
            }
            Plan::Fresh { retired } => {
                for session in &retired {
                    self.retire(session, ActivityKind::Expired, "expired session retired")
                        .await;
                }
                self.authenticate_fresh(token, device_id, address).await
            }
        }
    }

    async fn authenticate_fresh(
        &self,
        token: &str,
        device_id: &str,
        address: IpAddr,
    ) -> Result<AuthOutcome, AccessError> {
        let subject = Subject::new(device_id, address, token);

        let verdict = match self.validator.validate(token).await {
            Ok(v) => v,
            Err(e) => {
                warn!(device = %device_id, %address, "Token validation failed: {e}");
                let err = AccessError::ValidationRejected(e.to_string());
                self.reject(subject, &err).await;
                return Err(err);
            }
        };

        let granted_at = self.clock.now();
        let Some(expires_at) = verdict.expiry(granted_at) else {
            let reason = if verdict.message.is_empty() {
                "token not valid".to_string()
            } else {
                verdict.message.clone()
            };
            let err = AccessError::ValidationRejected(reason);
            self.reject(subject, &err).await;
            return Err(err);
        };

        let session = Session {
            token: token.to_string(),
            device_id: device_id.to_string(),
            active_addresses: [address].into_iter().collect(),
            granted_at,
            expires_at,
            duration_minutes: verdict.effective_duration(granted_at, expires_at),
            principal_id: verdict.principal_id.clone(),
            grant_id: verdict.grant_id.clone(),
        };

        let commit = self
            .store
            .transaction(|idx| decide_commit(idx, session, address, granted_at))
            .await;
        let (displaced, handovers) = match commit {
            Ok(Commit::Joined(change)) => {
                return self
                    .finish_reconnect(token, device_id, address, change)
                    .await
            }
            Ok(Commit::Created {
                displaced,
                handovers,
            }) => (displaced, handovers),
            Err(e) => {
                self.reject(subject, &e).await;
                return Err(e);
            }
        };

        for handover in &handovers {
            info!(
                %address,
                from = %truncate_token(&handover.previous),
                to = %truncate_token(token),
                "Address handed over to new session"
            );
        }
        for old in &displaced {
            let (kind, summary) = if old.is_expired(granted_at) {
                (ActivityKind::Expired, "expired session retired")
            } else {
                (ActivityKind::Superseded, "session replaced by a newer token")
            };
            self.retire(old, kind, summary).await;
        }

        if let Err(e) = self.enforcement.grant(address).await {
            warn!(
                device = %device_id,
                %address,
                token = %truncate_token(token),
                "Grant failed, rolling back session: {e}"
            );
            let removed = self
                .store
                .transaction(|idx| Ok::<_, AccessError>(idx.remove(token)))
                .await
                .ok()
                .flatten();
            let mut addresses: Vec<IpAddr> = removed
                .map(|s| s.active_addresses.into_iter().collect())
                .unwrap_or_default();
            if !addresses.contains(&address) {
                addresses.push(address);
            }
            self.revoke_unowned(addresses, "rollback").await;
            self.activity
                .log(ActivityKind::EnforcementFailed, subject, e.to_string())
                .await;
            return Err(AccessError::Enforcement(e));
        }

        info!(
            device = %device_id,
            %address,
            token = %truncate_token(token),
            principal = %verdict.principal_id,
            minutes = verdict.effective_duration(granted_at, expires_at),
            "Authenticated"
        );
        self.activity
            .log(
                ActivityKind::Authenticated,
                subject,
                format!("session granted until {expires_at}"),
            )
            .await;
        Ok(AuthOutcome::Authenticated)
    }

    async fn finish_reconnect(
        &self,
        token: &str,
        device_id: &str,
        address: IpAddr,
        change: AddressChange,
    ) -> Result<AuthOutcome, AccessError> {
        let subject = Subject::new(device_id, address, token);

        let previous = match change {
            AddressChange::AlreadyPresent => {
                info!(device = %device_id, %address, "Reconnected, address already active");
                self.activity
                    .log(ActivityKind::Reconnected, subject, "address already active")
                    .await;
                return Ok(AuthOutcome::Reconnected {
                    address_added: false,
                });
            }
            AddressChange::Claimed { previous } => previous,
        };

        if let Err(e) = self.enforcement.grant(address).await {
            warn!(
                device = %device_id,
                %address,
                "Grant on reconnect failed, detaching address: {e}"
            );
            let _ = self
                .store
                .transaction(|idx| Ok::<_, AccessError>(idx.detach_address(token, address)))
                .await;
            self.revoke_unowned([address], "rollback").await;
            self.activity
                .log(ActivityKind::EnforcementFailed, subject, e.to_string())
                .await;
            return Err(AccessError::Enforcement(e));
        }

        if let Some(previous) = previous {
            info!(%address, from = %truncate_token(&previous), "Address handed over on reconnect");
        }
        info!(
            device = %device_id,
            %address,
            token = %truncate_token(token),
            "Reconnected with new address"
        );
        self.activity
            .log(ActivityKind::Reconnected, subject, "address added to session")
            .await;
        Ok(AuthOutcome::Reconnected {
            address_added: true,
        })
    }

    /// Remove the session bound to `device_id`, revoking its addresses.
    pub async fn revoke_device(&self, device_id: &str) -> Option<Session> {
        let removed = self
            .store
            .transaction(|idx| {
                let token = idx.session_for_device(device_id).map(|s| s.token.clone());
                Ok::<_, AccessError>(token.and_then(|t| idx.remove(&t)))
            })
            .await
            .ok()
            .flatten()?;
        self.retire(&removed, ActivityKind::Revoked, "revoked by operator")
            .await;
        Some(removed)
    }

    /// Remove every session and revoke all addresses. Used at shutdown.
    pub async fn revoke_all(&self, reason: &str) -> usize {
        let removed = self
            .store
            .transaction(|idx| Ok::<_, AccessError>(idx.drain()))
            .await
            .unwrap_or_default();
        let mut failures = 0;
        for session in &removed {
            failures +=
                enforcement::revoke_session(self.enforcement.as_ref(), session, reason).await;
        }
        if !removed.is_empty() {
            info!(sessions = removed.len(), failures, reason, "Revoked all sessions");
        }
        removed.len()
    }

    /// Revoke a removed session's addresses and journal why it went.
    async fn retire(&self, session: &Session, kind: ActivityKind, summary: &str) {
        info!(
            device = %session.device_id,
            token = %truncate_token(&session.token),
            addresses = session.active_addresses.len(),
            "{summary}"
        );
        self.revoke_unowned(session.active_addresses.iter().copied(), summary)
            .await;
        self.activity
            .log(
                kind,
                Subject::device(&session.device_id, &session.token),
                summary,
            )
            .await;
    }

    async fn revoke_unowned(
        &self,
        addresses: impl IntoIterator<Item = IpAddr>,
        reason: &str,
    ) -> usize {
        revoke_unowned(&self.store, self.enforcement.as_ref(), addresses, reason).await
    }

    async fn reject(&self, subject: Subject<'_>, err: &AccessError) {
        info!(
            device = subject.device_id.unwrap_or_default(),
            token = %subject.token.map(truncate_token).unwrap_or_default(),
            "Authentication refused: {err}"
        );
        self.activity
            .log(ActivityKind::Rejected, subject, err.user_message())
            .await;
    }
}

/// Revoke each address that no session owns any more. Addresses claimed by
/// a session in the meantime are left alone. Returns the failure count.
pub async fn revoke_unowned(
    store: &SessionStore,
    backend: &dyn EnforcementBackend,
    addresses: impl IntoIterator<Item = IpAddr>,
    reason: &str,
) -> usize {
    let mut orphaned = Vec::new();
    for address in addresses {
        if store.lookup_by_address(address).await.is_none() {
            orphaned.push(address);
        }
    }
    enforcement::revoke_addresses(backend, orphaned, reason).await
}

fn decide_plan(
    idx: &mut SessionIndices,
    token: &str,
    device_id: &str,
    address: IpAddr,
    now: u64,
) -> Result<Plan, AccessError> {
    let mut retired = Vec::new();

    if let Some(existing) = idx.get(token) {
        if existing.is_expired(now) {
            retired.extend(idx.remove(token));
        } else if existing.device_id != device_id {
            return Err(AccessError::TokenInUse {
                device: existing.device_id.clone(),
            });
        } else {
            return Ok(Plan::Reconnect(idx.attach_address(token, address)?));
        }
    }

    let expired_device_token = idx
        .session_for_device(device_id)
        .filter(|s| s.is_expired(now))
        .map(|s| s.token.clone());
    if let Some(old) = expired_device_token {
        retired.extend(idx.remove(&old));
    }

    Ok(Plan::Fresh { retired })
}

fn decide_commit(
    idx: &mut SessionIndices,
    session: Session,
    address: IpAddr,
    now: u64,
) -> Result<Commit, AccessError> {
    let mut displaced = Vec::new();

    if let Some(existing) = idx.get(&session.token) {
        if existing.is_expired(now) {
            displaced.extend(idx.remove(&session.token));
        } else if existing.device_id != session.device_id {
            return Err(AccessError::TokenInUse {
                device: existing.device_id.clone(),
            });
        } else {
            return Ok(Commit::Joined(idx.attach_address(&session.token, address)?));
        }
    }

    // Newest token wins: whatever the device held before goes.
    let previous = idx
        .session_for_device(&session.device_id)
        .map(|s| s.token.clone());
    if let Some(previous) = previous {
        displaced.extend(idx.remove(&previous));
    }

    let handovers = idx.insert(session)?;
    Ok(Commit::Created {
        displaced,
        handovers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::memory::{EnforcementCall, MemoryBackend};
    use crate::enforcement::RuleKind;
    use crate::validator::testing::StaticValidator;
    use crate::validator::ValidationVerdict;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::broadcast;

    const START: u64 = 1_000_000;
    const MINUTE: u64 = 60_000;

    struct Harness {
        access: AccessController,
        backend: Arc<MemoryBackend>,
        validator: Arc<StaticValidator>,
        activity: Arc<ActivityLog>,
        time: Arc<AtomicU64>,
    }

    impl Harness {
        fn new() -> Self {
            let backend = Arc::new(MemoryBackend::new());
            let validator = Arc::new(StaticValidator::new());
            let (tx, _) = broadcast::channel(64);
            let activity = Arc::new(ActivityLog::new(200, tx));
            let time = Arc::new(AtomicU64::new(START));
            let access = AccessController::new(
                SessionStore::new(),
                backend.clone(),
                validator.clone(),
                activity.clone(),
                Clock::manual(time.clone()),
            );
            Self {
                access,
                backend,
                validator,
                activity,
                time,
            }
        }

        fn advance(&self, ms: u64) {
            self.time.fetch_add(ms, Ordering::SeqCst);
        }

        fn store(&self) -> &SessionStore {
            self.access.store()
        }

        async fn kinds(&self) -> Vec<ActivityKind> {
            self.activity
                .read_since_filtered(0, 100, None, None)
                .await
                .into_iter()
                .map(|e| e.kind)
                .collect()
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_first_authentication_grants_once() {
        let h = Harness::new();
        h.validator.accept("T1", 10);

        let out = h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap();
        assert_eq!(out, AuthOutcome::Authenticated);
        assert_eq!(out.message(), "Authentication successful");

        let session = h.store().lookup_by_token("T1").await.unwrap();
        assert_eq!(session.device_id, "D1");
        assert_eq!(session.expires_at, START + 10 * MINUTE);
        assert_eq!(session.duration_minutes, 10);
        assert_eq!(h.store().lookup_by_device("D1").await.unwrap().token, "T1");
        assert_eq!(h.store().lookup_by_address(ip("10.0.0.5")).await.unwrap().token, "T1");
        assert_eq!(h.backend.grants().await, vec![ip("10.0.0.5")]);
        assert!(h.backend.is_granted(ip("10.0.0.5")).await);
        assert_eq!(h.kinds().await, vec![ActivityKind::Authenticated]);
    }

    #[tokio::test]
    async fn test_reconnect_from_new_address() {
        let h = Harness::new();
        h.validator.accept("T1", 10);
        h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap();
        h.advance(MINUTE);

        let out = h.access.authenticate("T1", "D1", ip("10.0.0.6")).await.unwrap();
        assert_eq!(
            out,
            AuthOutcome::Reconnected {
                address_added: true
            }
        );
        assert_ne!(out.message(), AuthOutcome::Authenticated.message());

        let session = h.store().lookup_by_token("T1").await.unwrap();
        assert_eq!(
            session.active_addresses,
            [ip("10.0.0.5"), ip("10.0.0.6")].into_iter().collect()
        );
        assert_eq!(h.backend.grants().await, vec![ip("10.0.0.5"), ip("10.0.0.6")]);
        assert_eq!(h.validator.calls(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_same_address_is_noop() {
        let h = Harness::new();
        h.validator.accept("T1", 10);
        h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap();

        for _ in 0..2 {
            let out = h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap();
            assert_eq!(
                out,
                AuthOutcome::Reconnected {
                    address_added: false
                }
            );
        }
        assert_eq!(h.backend.grants().await.len(), 1);
        let session = h.store().lookup_by_token("T1").await.unwrap();
        assert_eq!(session.active_addresses.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_token_creates_nothing() {
        let h = Harness::new();
        h.validator.set("BAD", ValidationVerdict::rejected("expired pin"));

        let err = h.access.authenticate("BAD", "D1", ip("10.0.0.5")).await.unwrap_err();
        assert!(matches!(err, AccessError::ValidationRejected(ref m) if m == "expired pin"));
        assert_eq!(err.user_message(), "Invalid or expired token");
        assert!(h.store().is_empty().await);
        assert!(h.backend.calls().await.is_empty());
        assert_eq!(h.kinds().await, vec![ActivityKind::Rejected]);
    }

    #[tokio::test]
    async fn test_unreachable_validator_is_rejection() {
        let h = Harness::new();
        h.validator.accept("T1", 10);
        h.validator.set_unreachable(true);

        let err = h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap_err();
        assert!(matches!(err, AccessError::ValidationRejected(_)));
        assert!(h.store().is_empty().await);
        assert!(h.backend.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_expiry_in_past_is_rejected() {
        let h = Harness::new();
        h.validator.set(
            "OLD",
            ValidationVerdict {
                valid: true,
                expires_at: Some(START - 1),
                ..ValidationVerdict::default()
            },
        );
        let err = h.access.authenticate("OLD", "D1", ip("10.0.0.5")).await.unwrap_err();
        assert!(matches!(err, AccessError::ValidationRejected(_)));
        assert!(h.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_explicit_expiry_wins_over_duration() {
        let h = Harness::new();
        h.validator.set(
            "T1",
            ValidationVerdict {
                valid: true,
                duration_minutes: 10,
                expires_at: Some(START + 3 * MINUTE),
                ..ValidationVerdict::default()
            },
        );
        h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap();
        let session = h.store().lookup_by_token("T1").await.unwrap();
        assert_eq!(session.expires_at, START + 3 * MINUTE);
    }

    #[tokio::test]
    async fn test_missing_fields() {
        let h = Harness::new();
        assert!(matches!(
            h.access.authenticate("", "D1", ip("10.0.0.5")).await,
            Err(AccessError::MissingField("token"))
        ));
        assert!(matches!(
            h.access.authenticate("T1", "  ", ip("10.0.0.5")).await,
            Err(AccessError::MissingField("deviceId"))
        ));
        assert_eq!(h.validator.calls(), 0);
    }

    #[tokio::test]
    async fn test_token_swap_newest_wins() {
        let h = Harness::new();
        h.validator.accept("T1", 10);
        h.validator.accept("T2", 20);
        h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap();

        let out = h.access.authenticate("T2", "D1", ip("10.0.0.6")).await.unwrap();
        assert_eq!(out, AuthOutcome::Authenticated);

        assert!(h.store().lookup_by_token("T1").await.is_none());
        assert!(h.store().lookup_by_address(ip("10.0.0.5")).await.is_none());
        assert_eq!(h.store().lookup_by_device("D1").await.unwrap().token, "T2");
        assert_eq!(h.store().len().await, 1);
        assert_eq!(h.backend.revokes().await, vec![ip("10.0.0.5")]);
        assert!(h.backend.is_granted(ip("10.0.0.6")).await);
        assert!(h.kinds().await.contains(&ActivityKind::Superseded));
    }

    #[tokio::test]
    async fn test_token_swap_same_address_keeps_access() {
        let h = Harness::new();
        h.validator.accept("T1", 10);
        h.validator.accept("T2", 10);
        h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap();
        h.access.authenticate("T2", "D1", ip("10.0.0.5")).await.unwrap();

        assert!(h.backend.revokes().await.is_empty());
        assert!(h.backend.is_granted(ip("10.0.0.5")).await);
        assert_eq!(h.store().lookup_by_address(ip("10.0.0.5")).await.unwrap().token, "T2");
    }

    #[tokio::test]
    async fn test_rejected_swap_leaves_old_session() {
        let h = Harness::new();
        h.validator.accept("T1", 10);
        h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap();

        assert!(h.access.authenticate("T2", "D1", ip("10.0.0.5")).await.is_err());
        assert_eq!(h.store().lookup_by_device("D1").await.unwrap().token, "T1");
        assert!(h.backend.is_granted(ip("10.0.0.5")).await);
    }

    #[tokio::test]
    async fn test_token_in_use_on_other_device() {
        let h = Harness::new();
        h.validator.accept("T1", 10);
        h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap();

        let err = h.access.authenticate("T1", "D2", ip("10.0.0.9")).await.unwrap_err();
        assert!(matches!(err, AccessError::TokenInUse { ref device } if device == "D1"));
        assert_eq!(h.validator.calls(), 1);
        assert!(h.store().lookup_by_device("D2").await.is_none());
        assert_eq!(h.backend.grants().await, vec![ip("10.0.0.5")]);
    }

    #[tokio::test]
    async fn test_expired_token_on_other_device_is_retired() {
        let h = Harness::new();
        h.validator.accept("T1", 10);
        h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap();
        h.advance(10 * MINUTE);

        let out = h.access.authenticate("T1", "D2", ip("10.0.0.9")).await.unwrap();
        assert_eq!(out, AuthOutcome::Authenticated);
        assert!(h.store().lookup_by_device("D1").await.is_none());
        assert_eq!(h.store().lookup_by_device("D2").await.unwrap().token, "T1");
        assert_eq!(h.backend.revokes().await, vec![ip("10.0.0.5")]);
        assert_eq!(h.validator.calls(), 2);
    }

    #[tokio::test]
    async fn test_expired_device_session_retired_before_new_one() {
        let h = Harness::new();
        h.validator.accept("T1", 10);
        h.validator.accept("T2", 10);
        h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap();
        h.advance(11 * MINUTE);

        h.access.authenticate("T2", "D1", ip("10.0.0.7")).await.unwrap();
        assert!(h.store().lookup_by_token("T1").await.is_none());
        assert_eq!(h.backend.revokes().await, vec![ip("10.0.0.5")]);
        let calls = h.backend.calls().await;
        assert_eq!(calls.last(), Some(&EnforcementCall::Grant(ip("10.0.0.7"))));
        let kinds = h.kinds().await;
        assert!(kinds.contains(&ActivityKind::Expired));
        assert!(!kinds.contains(&ActivityKind::Superseded));
    }

    #[tokio::test]
    async fn test_expired_own_token_is_revalidated() {
        let h = Harness::new();
        h.validator.accept("T1", 10);
        h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap();
        h.advance(10 * MINUTE);
        h.validator.set("T1", ValidationVerdict::rejected("used up"));

        let err = h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap_err();
        assert!(matches!(err, AccessError::ValidationRejected(_)));
        assert!(h.store().is_empty().await);
        assert!(!h.backend.is_granted(ip("10.0.0.5")).await);
    }

    #[tokio::test]
    async fn test_grant_failure_rolls_back_new_session() {
        let h = Harness::new();
        h.validator.accept("T1", 10);
        h.backend.fail_step(ip("10.0.0.5"), RuleKind::PortalBypass).await;

        let err = h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap_err();
        assert!(matches!(err, AccessError::Enforcement(_)));
        assert!(h.store().is_empty().await);
        assert!(h.store().lookup_by_device("D1").await.is_none());
        assert!(!h.backend.has_forward_rule(ip("10.0.0.5")).await);
        assert!(h.kinds().await.contains(&ActivityKind::EnforcementFailed));

        // Retrying once the firewall recovers works.
        h.backend.clear_failure(ip("10.0.0.5")).await;
        let out = h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap();
        assert_eq!(out, AuthOutcome::Authenticated);
    }

    #[tokio::test]
    async fn test_grant_failure_on_reconnect_detaches_address() {
        let h = Harness::new();
        h.validator.accept("T1", 10);
        h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap();
        h.backend.fail_step(ip("10.0.0.6"), RuleKind::Forward).await;

        let err = h.access.authenticate("T1", "D1", ip("10.0.0.6")).await.unwrap_err();
        assert!(matches!(err, AccessError::Enforcement(_)));
        let session = h.store().lookup_by_token("T1").await.unwrap();
        assert_eq!(session.active_addresses, [ip("10.0.0.5")].into_iter().collect());
        assert!(h.store().lookup_by_address(ip("10.0.0.6")).await.is_none());
        assert!(h.backend.is_granted(ip("10.0.0.5")).await);
    }

    #[tokio::test]
    async fn test_address_handover_between_devices() {
        let h = Harness::new();
        h.validator.accept("T1", 10);
        h.validator.accept("T2", 10);
        h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap();
        h.access.authenticate("T2", "D2", ip("10.0.0.5")).await.unwrap();

        assert_eq!(h.store().lookup_by_address(ip("10.0.0.5")).await.unwrap().token, "T2");
        let old = h.store().lookup_by_token("T1").await.unwrap();
        assert!(old.active_addresses.is_empty());
        assert!(h.backend.revokes().await.is_empty());

        // D1 coming back on a fresh address is still a reconnection.
        let out = h.access.authenticate("T1", "D1", ip("10.0.0.8")).await.unwrap();
        assert_eq!(
            out,
            AuthOutcome::Reconnected {
                address_added: true
            }
        );
    }

    #[tokio::test]
    async fn test_revoke_device() {
        let h = Harness::new();
        h.validator.accept("T1", 10);
        h.access.authenticate("T1", "D1", ip("10.0.0.5")).await.unwrap();
        h.access.authenticate("T1", "D1", ip("10.0.0.6")).await.unwrap();

        let removed = h.access.revoke_device("D1").await.unwrap();
        assert_eq!(removed.token, "T1");
        assert!(h.store().is_empty().await);
        let mut revokes = h.backend.revokes().await;
        revokes.sort();
        assert_eq!(revokes, vec![ip("10.0.0.5"), ip("10.0.0.6")]);
        assert!(h.access.revoke_device("D1").await.is_none());
        assert!(h.kinds().await.contains(&ActivityKind::Revoked));
    }

    #[tokio::test]
    async fn test_revoke_all() {
        let h = Harness::new();
        for i in 0..3 {
            let token = format!("T{i}");
            h.validator.accept(&token, 10);
            h.access
                .authenticate(&token, &format!("D{i}"), ip(&format!("10.0.0.{}", 10 + i)))
                .await
                .unwrap();
        }
        assert_eq!(h.access.revoke_all("shutdown").await, 3);
        assert!(h.store().is_empty().await);
        assert!(h.backend.granted_addresses().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_authentications() {
        let h = Harness::new();
        for i in 0..16 {
            h.validator.accept(&format!("T{i}"), 10);
        }
        let mut handles = Vec::new();
        for i in 0..16 {
            let access = h.access.clone();
            handles.push(tokio::spawn(async move {
                access
                    .authenticate(
                        &format!("T{i}"),
                        &format!("D{i}"),
                        format!("10.0.1.{i}").parse().unwrap(),
                    )
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), AuthOutcome::Authenticated);
        }
        assert_eq!(h.store().len().await, 16);
        assert_eq!(h.backend.granted_addresses().await.len(), 16);
    }
}
