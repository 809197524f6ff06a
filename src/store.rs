//! Session store with token, device and address indices.
//!
//! [`SessionStore`] is the single authority for who currently has network
//! access. It keeps three maps that must agree with each other:
//!
//! - **token → session**: the primary record
//! - **device → token**: recognizes a device that comes back on a new address
//! - **address → token**: what the captive detector and the firewall care about
//!
//! ## Concurrency
//!
//! All three maps live behind one `RwLock`. Lookups take a read lock and clone
//! the session out. Mutations go through [`SessionStore::transaction`], which
//! takes the write lock, runs a *synchronous* closure against a staged copy of
//! the indices and swaps the copy in only if the closure returns `Ok`. Because
//! the closure cannot `.await`, nothing slow (firewall commands, the backend
//! validator) can run while the lock is held, and a cancelled caller can only
//! be dropped before the transaction starts or after it has fully committed.
//!
//! Session counts on an edge hotspot are in the tens; each transaction copies
//! the indices.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::StoreError;

/// One authenticated grant of network access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub active_addresses: BTreeSet<IpAddr>,
    /// Epoch milliseconds.
    pub granted_at: u64,
    /// Epoch milliseconds. Always greater than `granted_at`.
    pub expires_at: u64,
    pub duration_minutes: u32,
    pub principal_id: String,
    pub grant_id: String,
}

impl Session {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Whole minutes left before expiry (0 once expired).
    pub fn minutes_left(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now) / 60_000
    }
}

/// Result of [`SessionIndices::attach_address`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressChange {
    /// The address was already covered by this session; nothing changed.
    AlreadyPresent,
    /// The address now belongs to this session. `previous` is the token that
    /// owned it before, if it was moved away from another live session.
    Claimed { previous: Option<String> },
}

/// An address moved from one session to another by [`SessionIndices::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handover {
    pub address: IpAddr,
    pub previous: String,
}

/// The three indices. Only reachable mutably from inside
/// [`SessionStore::transaction`].
#[derive(Debug, Clone, Default)]
pub struct SessionIndices {
    by_token: HashMap<String, Session>,
    by_device: HashMap<String, String>,
    by_address: HashMap<IpAddr, String>,
}

impl SessionIndices {
    pub fn get(&self, token: &str) -> Option<&Session> {
        self.by_token.get(token)
    }

    pub fn session_for_device(&self, device_id: &str) -> Option<&Session> {
        self.by_device
            .get(device_id)
            .and_then(|token| self.by_token.get(token))
    }

    pub fn session_for_address(&self, address: IpAddr) -> Option<&Session> {
        self.by_address
            .get(&address)
            .and_then(|token| self.by_token.get(token))
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.by_token.values()
    }

    /// Tokens of every session expired at `now`.
    pub fn expired_tokens(&self, now: u64) -> Vec<String> {
        self.by_token
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.token.clone())
            .collect()
    }

    /// Insert a new session into all three indices.
    ///
    /// The token must be unused and the device must not be bound to another
    /// session (callers retire the old one first). Addresses owned by other
    /// sessions are moved over; each move is reported as a [`Handover`].
    pub fn insert(&mut self, session: Session) -> Result<Vec<Handover>, StoreError> {
        if self.by_token.contains_key(&session.token) {
            return Err(StoreError::DuplicateToken(session.token));
        }
        if self.by_device.contains_key(&session.device_id) {
            return Err(StoreError::DeviceBound(session.device_id));
        }
        if session.expires_at <= session.granted_at {
            return Err(StoreError::EmptyWindow {
                granted_at: session.granted_at,
                expires_at: session.expires_at,
            });
        }

        let mut handovers = Vec::new();
        for address in &session.active_addresses {
            if let Some(previous) = self.release_address(*address) {
                handovers.push(Handover {
                    address: *address,
                    previous,
                });
            }
            self.by_address.insert(*address, session.token.clone());
        }
        self.by_device
            .insert(session.device_id.clone(), session.token.clone());
        self.by_token.insert(session.token.clone(), session);
        Ok(handovers)
    }

    /// Remove a session and every index entry pointing at it.
    pub fn remove(&mut self, token: &str) -> Option<Session> {
        let session = self.by_token.remove(token)?;
        for address in &session.active_addresses {
            if self.by_address.get(address).is_some_and(|t| t == token) {
                self.by_address.remove(address);
            }
        }
        if self
            .by_device
            .get(&session.device_id)
            .is_some_and(|t| t == token)
        {
            self.by_device.remove(&session.device_id);
        }
        Some(session)
    }

    /// Remove every session, leaving all three indices empty.
    pub fn drain(&mut self) -> Vec<Session> {
        self.by_device.clear();
        self.by_address.clear();
        self.by_token.drain().map(|(_, s)| s).collect()
    }

    /// Add `address` to the session's active set, taking it from whichever
    /// session held it before.
    pub fn attach_address(
        &mut self,
        token: &str,
        address: IpAddr,
    ) -> Result<AddressChange, StoreError> {
        match self.by_token.get(token) {
            None => return Err(StoreError::UnknownSession(token.to_string())),
            Some(s) if s.active_addresses.contains(&address) => {
                return Ok(AddressChange::AlreadyPresent);
            }
            Some(_) => {}
        }

        let previous = self.release_address(address);
        if let Some(session) = self.by_token.get_mut(token) {
            session.active_addresses.insert(address);
        }
        self.by_address.insert(address, token.to_string());
        Ok(AddressChange::Claimed { previous })
    }

    /// Drop `address` from the session if it is there. Returns whether
    /// anything changed.
    pub fn detach_address(&mut self, token: &str, address: IpAddr) -> bool {
        let Some(session) = self.by_token.get_mut(token) else {
            return false;
        };
        if !session.active_addresses.remove(&address) {
            return false;
        }
        if self.by_address.get(&address).is_some_and(|t| t == token) {
            self.by_address.remove(&address);
        }
        true
    }

    /// Unlink `address` from its current owner. Returns the owner's token.
    fn release_address(&mut self, address: IpAddr) -> Option<String> {
        let owner = self.by_address.remove(&address)?;
        if let Some(session) = self.by_token.get_mut(&owner) {
            session.active_addresses.remove(&address);
        }
        Some(owner)
    }

    /// Check that the three indices agree.
    pub fn verify(&self) -> Result<(), String> {
        for (token, session) in &self.by_token {
            if &session.token != token {
                return Err(format!("session keyed by {token} carries token {}", session.token));
            }
            if session.expires_at <= session.granted_at {
                return Err(format!("session {token} has an empty window"));
            }
            if self.by_device.get(&session.device_id) != Some(token) {
                return Err(format!(
                    "device {} does not map back to its session",
                    session.device_id
                ));
            }
            for address in &session.active_addresses {
                if self.by_address.get(address) != Some(token) {
                    return Err(format!("address {address} of {token} missing from index"));
                }
            }
        }
        for (device, token) in &self.by_device {
            match self.by_token.get(token) {
                Some(s) if &s.device_id == device => {}
                _ => return Err(format!("device {device} maps to stale token {token}")),
            }
        }
        for (address, token) in &self.by_address {
            match self.by_token.get(token) {
                Some(s) if s.active_addresses.contains(address) => {}
                _ => return Err(format!("address {address} maps to stale token {token}")),
            }
        }
        Ok(())
    }
}

/// Shared handle to the session indices.
///
/// Cloneable; all clones share the same inner `Arc<RwLock<...>>`.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<SessionIndices>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lookup_by_token(&self, token: &str) -> Option<Session> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn lookup_by_device(&self, device_id: &str) -> Option<Session> {
        self.inner
            .read()
            .await
            .session_for_device(device_id)
            .cloned()
    }

    pub async fn lookup_by_address(&self, address: IpAddr) -> Option<Session> {
        self.inner
            .read()
            .await
            .session_for_address(address)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Clone of every live session.
    pub async fn snapshot(&self) -> Vec<Session> {
        self.inner.read().await.sessions().cloned().collect()
    }

    /// Run `f` with exclusive access to the indices.
    ///
    /// `f` works on a staged copy: if it returns `Err`, nothing it did is
    /// kept. Readers never observe a partially applied transaction.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if `f` leaves the indices inconsistent. That is
    /// a bug in the index code, not a runtime condition.
    pub async fn transaction<R, E>(
        &self,
        f: impl FnOnce(&mut SessionIndices) -> Result<R, E>,
    ) -> Result<R, E> {
        let mut guard = self.inner.write().await;
        let mut staged = guard.clone();
        let out = f(&mut staged)?;
        #[cfg(debug_assertions)]
        if let Err(violation) = staged.verify() {
            tracing::error!("session store invariant violated: {violation}");
            panic!("session store invariant violated: {violation}");
        }
        *guard = staged;
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) fn test_session(
    token: &str,
    device: &str,
    addresses: &[&str],
    expires_at: u64,
) -> Session {
    Session {
        token: token.to_string(),
        device_id: device.to_string(),
        active_addresses: addresses.iter().map(|a| a.parse().unwrap()).collect(),
        granted_at: 0,
        expires_at,
        duration_minutes: 10,
        principal_id: "user-1".to_string(),
        grant_id: "pin-1".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_insert_populates_all_indices() {
        let store = SessionStore::new();
        store
            .transaction(|idx| idx.insert(test_session("T1", "D1", &["10.0.0.5"], 600_000)))
            .await
            .unwrap();

        assert_eq!(store.lookup_by_token("T1").await.unwrap().device_id, "D1");
        assert_eq!(store.lookup_by_device("D1").await.unwrap().token, "T1");
        assert_eq!(
            store.lookup_by_address(ip("10.0.0.5")).await.unwrap().token,
            "T1"
        );
        assert!(store.lookup_by_address(ip("10.0.0.6")).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_transaction_leaves_no_trace() {
        let store = SessionStore::new();
        store
            .transaction(|idx| idx.insert(test_session("T1", "D1", &["10.0.0.5"], 600_000)))
            .await
            .unwrap();

        // Removes T1, then fails on a duplicate: the removal must not stick.
        let result = store
            .transaction(|idx| {
                idx.remove("T1");
                idx.insert(test_session("T2", "D2", &["10.0.0.9"], 600_000))?;
                idx.insert(test_session("T2", "D3", &["10.0.0.10"], 600_000))
            })
            .await;
        assert_eq!(result, Err(StoreError::DuplicateToken("T2".into())));
        assert!(store.lookup_by_token("T1").await.is_some());
        assert!(store.lookup_by_token("T2").await.is_none());
        assert!(store.lookup_by_address(ip("10.0.0.9")).await.is_none());
    }

    #[test]
    fn test_insert_rejects_bound_device() {
        let mut idx = SessionIndices::default();
        idx.insert(test_session("T1", "D1", &["10.0.0.5"], 600_000))
            .unwrap();
        let err = idx
            .insert(test_session("T2", "D1", &["10.0.0.6"], 600_000))
            .unwrap_err();
        assert_eq!(err, StoreError::DeviceBound("D1".into()));
    }

    #[test]
    fn test_insert_rejects_empty_window() {
        let mut idx = SessionIndices::default();
        let session = test_session("T1", "D1", &["10.0.0.5"], 0);
        assert!(matches!(
            idx.insert(session),
            Err(StoreError::EmptyWindow { .. })
        ));
    }

    #[test]
    fn test_insert_takes_address_from_other_session() {
        let mut idx = SessionIndices::default();
        idx.insert(test_session("T1", "D1", &["10.0.0.5", "10.0.0.6"], 600_000))
            .unwrap();
        let handovers = idx
            .insert(test_session("T2", "D2", &["10.0.0.6"], 600_000))
            .unwrap();

        assert_eq!(
            handovers,
            vec![Handover {
                address: ip("10.0.0.6"),
                previous: "T1".into()
            }]
        );
        assert_eq!(idx.session_for_address(ip("10.0.0.6")).unwrap().token, "T2");
        let t1 = idx.get("T1").unwrap();
        assert_eq!(t1.active_addresses.len(), 1);
        assert!(t1.active_addresses.contains(&ip("10.0.0.5")));
        idx.verify().unwrap();
    }

    #[test]
    fn test_attach_address_is_idempotent() {
        let mut idx = SessionIndices::default();
        idx.insert(test_session("T1", "D1", &["10.0.0.5"], 600_000))
            .unwrap();

        assert_eq!(
            idx.attach_address("T1", ip("10.0.0.6")).unwrap(),
            AddressChange::Claimed { previous: None }
        );
        assert_eq!(
            idx.attach_address("T1", ip("10.0.0.6")).unwrap(),
            AddressChange::AlreadyPresent
        );
        assert_eq!(idx.get("T1").unwrap().active_addresses.len(), 2);
        assert_eq!(idx.by_address.len(), 2);
        idx.verify().unwrap();
    }

    #[test]
    fn test_attach_address_unknown_session() {
        let mut idx = SessionIndices::default();
        assert_eq!(
            idx.attach_address("nope", ip("10.0.0.1")),
            Err(StoreError::UnknownSession("nope".into()))
        );
    }

    #[test]
    fn test_attach_moves_address_between_sessions() {
        let mut idx = SessionIndices::default();
        idx.insert(test_session("T1", "D1", &["10.0.0.5"], 600_000))
            .unwrap();
        idx.insert(test_session("T2", "D2", &["10.0.0.7"], 600_000))
            .unwrap();

        assert_eq!(
            idx.attach_address("T2", ip("10.0.0.5")).unwrap(),
            AddressChange::Claimed {
                previous: Some("T1".into())
            }
        );
        assert!(idx.get("T1").unwrap().active_addresses.is_empty());
        assert_eq!(idx.session_for_address(ip("10.0.0.5")).unwrap().token, "T2");
        idx.verify().unwrap();
    }

    #[test]
    fn test_remove_clears_every_index() {
        let mut idx = SessionIndices::default();
        idx.insert(test_session("T1", "D1", &["10.0.0.5", "10.0.0.6"], 600_000))
            .unwrap();
        let removed = idx.remove("T1").unwrap();

        assert_eq!(removed.active_addresses.len(), 2);
        assert!(idx.is_empty());
        assert!(idx.session_for_device("D1").is_none());
        assert!(idx.session_for_address(ip("10.0.0.5")).is_none());
        assert!(idx.session_for_address(ip("10.0.0.6")).is_none());
        assert!(idx.remove("T1").is_none());
        idx.verify().unwrap();
    }

    #[test]
    fn test_detach_address() {
        let mut idx = SessionIndices::default();
        idx.insert(test_session("T1", "D1", &["10.0.0.5", "10.0.0.6"], 600_000))
            .unwrap();
        assert!(idx.detach_address("T1", ip("10.0.0.6")));
        assert!(!idx.detach_address("T1", ip("10.0.0.6")));
        assert!(idx.session_for_address(ip("10.0.0.6")).is_none());
        idx.verify().unwrap();
    }

    #[test]
    fn test_expired_tokens() {
        let mut idx = SessionIndices::default();
        idx.insert(test_session("T1", "D1", &["10.0.0.5"], 1_000))
            .unwrap();
        idx.insert(test_session("T2", "D2", &["10.0.0.6"], 5_000))
            .unwrap();
        assert!(idx.expired_tokens(999).is_empty());
        assert_eq!(idx.expired_tokens(1_000), vec!["T1".to_string()]);
        let mut both = idx.expired_tokens(10_000);
        both.sort();
        assert_eq!(both, vec!["T1".to_string(), "T2".to_string()]);
    }

    #[test]
    fn test_verify_detects_stale_address() {
        let mut idx = SessionIndices::default();
        idx.insert(test_session("T1", "D1", &["10.0.0.5"], 600_000))
            .unwrap();
        idx.by_address.insert(ip("10.0.0.99"), "T1".into());
        assert!(idx.verify().is_err());
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let session = test_session("T1", "D1", &["10.0.0.5"], 600_000);
        let v = serde_json::to_value(&session).unwrap();
        assert_eq!(v["deviceId"], "D1");
        assert_eq!(v["activeAddresses"][0], "10.0.0.5");
        assert_eq!(v["expiresAt"], 600_000);
        assert_eq!(v["principalId"], "user-1");
    }

    #[tokio::test]
    async fn test_concurrent_transactions_stay_consistent() {
        let store = SessionStore::new();
        let mut tasks = Vec::new();
        for i in 0..32u32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let token = format!("T{i}");
                // Half of the devices collide on the same address.
                let address = format!("10.0.0.{}", i % 16);
                store
                    .transaction(|idx| {
                        idx.insert(test_session(&token, &format!("D{i}"), &[&address], 600_000))
                    })
                    .await
                    .unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(store.len().await, 32);
        store
            .transaction(|idx| idx.verify())
            .await
            .unwrap();
        let owned: usize = store
            .snapshot()
            .await
            .iter()
            .map(|s| s.active_addresses.len())
            .sum();
        assert_eq!(owned, 16);
    }
}
