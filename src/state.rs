//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::access::AccessController;
use crate::activity::{ActivityLog, DEFAULT_CAPACITY};
use crate::captive::CaptivePortalDetector;
use crate::config::Config;
use crate::enforcement::EnforcementBackend;
use crate::store::SessionStore;
use crate::sweeper::ExpirySweeper;
use crate::util::Clock;
use crate::validator::BackendValidator;

/// Shared application state for the edgegate server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Token, device and address indices.
    pub store: SessionStore,
    /// Authentication flow and operator revocation.
    pub access: AccessController,
    /// Answers captive-detection probes.
    pub detector: CaptivePortalDetector,
    /// In-memory journal of access decisions.
    pub activity_log: Arc<ActivityLog>,
    /// Broadcast channel feeding `/api/events`.
    pub events: broadcast::Sender<Value>,
    /// Current number of SSE connections (for connection limiting).
    pub sse_connections: Arc<AtomicU32>,
    pub clock: Clock,
    /// Fired when the server starts shutting down. Long-lived responses
    /// (SSE streams) and the sweeper stop on it.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire the engine together around one session store.
    pub fn new(
        config: Config,
        enforcement: Arc<dyn EnforcementBackend>,
        validator: Arc<dyn BackendValidator>,
        clock: Clock,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let activity_log = Arc::new(ActivityLog::new(DEFAULT_CAPACITY, events.clone()));
        let store = SessionStore::new();
        let access = AccessController::new(
            store.clone(),
            enforcement,
            validator,
            activity_log.clone(),
            clock.clone(),
        );
        let detector =
            CaptivePortalDetector::new(store.clone(), clock.clone(), config.portal.splash_url());

        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            store,
            access,
            detector,
            activity_log,
            events,
            sse_connections: Arc::new(AtomicU32::new(0)),
            clock,
            shutdown: CancellationToken::new(),
        }
    }

    /// Sweeper over this state's store, ticking at `[sweeper] interval_secs`.
    pub fn sweeper(&self) -> ExpirySweeper {
        ExpirySweeper::new(
            self.store.clone(),
            self.access.enforcement().clone(),
            self.activity_log.clone(),
            self.clock.clone(),
            Duration::from_secs(self.config.sweeper.interval_secs),
        )
    }
}
