//! In-memory access journal with real-time broadcast.
//!
//! Records every access decision the gateway makes (authentications,
//! reconnections, rejections, expiries, revocations) in a fixed-size ring
//! buffer and broadcasts each new entry to `/api/events` subscribers.
//!
//! ## Design
//!
//! - **Ring buffer**: `VecDeque<ActivityEntry>` capped at `max_entries` (default 200).
//!   Old entries are silently dropped when the buffer is full.
//! - **Monotonic IDs**: Each entry gets a unique, always-increasing `id` so clients
//!   can request "everything since ID N" without gaps.
//! - **Tokens are never journaled in full**, only their first 8 characters.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};

use crate::util::{now_ms, truncate_token};

/// Default journal capacity.
pub const DEFAULT_CAPACITY: usize = 200;

/// Kinds of access decisions tracked by the journal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// Fresh session created after a positive verdict.
    Authenticated,
    /// Live session re-presented, possibly from a new address.
    Reconnected,
    /// Authentication refused (validator, conflict or bad request).
    Rejected,
    /// Session replaced by a newer token on the same device.
    Superseded,
    /// Session removed by the sweeper.
    Expired,
    /// Session removed by an operator.
    Revoked,
    /// A firewall grant failed and the attempt was rolled back.
    EnforcementFailed,
}

impl ActivityKind {
    /// Parse from the serde rename value (e.g. `"authenticated"`).
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "authenticated" => Some(Self::Authenticated),
            "reconnected" => Some(Self::Reconnected),
            "rejected" => Some(Self::Rejected),
            "superseded" => Some(Self::Superseded),
            "expired" => Some(Self::Expired),
            "revoked" => Some(Self::Revoked),
            "enforcement_failed" => Some(Self::EnforcementFailed),
            _ => None,
        }
    }
}

/// Who an entry is about. Any part may be unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct Subject<'a> {
    pub device_id: Option<&'a str>,
    pub address: Option<IpAddr>,
    pub token: Option<&'a str>,
}

impl<'a> Subject<'a> {
    pub fn new(device_id: &'a str, address: IpAddr, token: &'a str) -> Self {
        Self {
            device_id: Some(device_id),
            address: Some(address),
            token: Some(token),
        }
    }

    pub fn device(device_id: &'a str, token: &'a str) -> Self {
        Self {
            device_id: Some(device_id),
            address: None,
            token: Some(token),
        }
    }
}

/// A single journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: u64,
    pub timestamp: u64,
    pub kind: ActivityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,
    /// Truncated token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub summary: String,
}

/// In-memory ring buffer of journal entries with broadcast support.
pub struct ActivityLog {
    entries: RwLock<VecDeque<ActivityEntry>>,
    next_id: AtomicU64,
    max_entries: usize,
    broadcast_tx: broadcast::Sender<Value>,
}

impl ActivityLog {
    /// Create a new journal that broadcasts via the given channel.
    pub fn new(max_entries: usize, broadcast_tx: broadcast::Sender<Value>) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_entries)),
            next_id: AtomicU64::new(1),
            max_entries,
            broadcast_tx,
        }
    }

    /// Append an entry, broadcast it, and return the assigned ID.
    pub async fn log(
        &self,
        kind: ActivityKind,
        subject: Subject<'_>,
        summary: impl Into<String>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = ActivityEntry {
            id,
            timestamp: now_ms(),
            kind,
            device_id: subject.device_id.map(str::to_string),
            address: subject.address,
            token: subject.token.map(truncate_token),
            summary: summary.into(),
        };

        // No subscribers is fine.
        let _ = self.broadcast_tx.send(json!({
            "type": "activity.new",
            "entry": &entry,
        }));

        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);

        id
    }

    /// Read entries with `id > since_id`, up to `limit`, optionally narrowed
    /// by kind and device (AND logic).
    pub async fn read_since_filtered(
        &self,
        since_id: u64,
        limit: usize,
        kind: Option<ActivityKind>,
        device_id: Option<&str>,
    ) -> Vec<ActivityEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.id > since_id)
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .filter(|e| device_id.map_or(true, |d| e.device_id.as_deref() == Some(d)))
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal(cap: usize) -> (ActivityLog, broadcast::Receiver<Value>) {
        let (tx, rx) = broadcast::channel(16);
        (ActivityLog::new(cap, tx), rx)
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_ring_drops_oldest() {
        let (log, _rx) = journal(3);
        for i in 0..5 {
            let id = log
                .log(ActivityKind::Rejected, Subject::default(), format!("attempt {i}"))
                .await;
            assert_eq!(id, i + 1);
        }
        let entries = log.read_since_filtered(0, 100, None, None).await;
        assert_eq!(entries.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_token_truncated_and_broadcast() {
        let (log, mut rx) = journal(10);
        let addr: IpAddr = "10.0.0.5".parse().unwrap();
        log.log(
            ActivityKind::Authenticated,
            Subject::new("phone-a", addr, "0123456789abcdef"),
            "Authenticated",
        )
        .await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg["type"], "activity.new");
        assert_eq!(msg["entry"]["token"], "01234567...");
        assert_eq!(msg["entry"]["kind"], "authenticated");
        assert_eq!(msg["entry"]["address"], "10.0.0.5");
    }

    #[tokio::test]
    async fn test_filters() {
        let (log, _rx) = journal(10);
        log.log(ActivityKind::Authenticated, Subject::device("a", "t1"), "").await;
        log.log(ActivityKind::Expired, Subject::device("a", "t1"), "").await;
        log.log(ActivityKind::Authenticated, Subject::device("b", "t2"), "").await;

        let auths = log
            .read_since_filtered(0, 10, Some(ActivityKind::Authenticated), None)
            .await;
        assert_eq!(auths.len(), 2);

        let device_a = log.read_since_filtered(0, 10, None, Some("a")).await;
        assert_eq!(device_a.len(), 2);

        let after = log.read_since_filtered(2, 10, None, None).await;
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].device_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(
            ActivityKind::from_str_opt("enforcement_failed"),
            Some(ActivityKind::EnforcementFailed)
        );
        assert_eq!(ActivityKind::from_str_opt("exec"), None);
    }
}
