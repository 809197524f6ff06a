//! Error types for the access-control engine.
//!
//! Each layer has its own enum; [`AccessError`] is what the authentication
//! path surfaces to the HTTP layer, and [`AccessError::user_message`] is the
//! only text a client ever sees.

use std::net::IpAddr;

use thiserror::Error;

use crate::enforcement::RuleKind;

/// Failures from the host firewall layer.
#[derive(Debug, Error)]
pub enum EnforcementError {
    /// The firewall binary could not be started at all.
    #[error("failed to run {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// The command did not finish within `firewall.command_timeout_ms`.
    #[error("{program} timed out")]
    Timeout { program: String },

    /// The command ran but refused to install the rule.
    #[error("{rule} rule for {address} not installed: {detail}")]
    Rejected {
        rule: RuleKind,
        address: IpAddr,
        detail: String,
    },

    /// A base (global) rule could not be applied at setup or teardown.
    #[error("base rule `{rule}` failed: {detail}")]
    BaseRule { rule: String, detail: String },
}

impl EnforcementError {
    /// Whether the host command itself could not run (as opposed to running
    /// and reporting a non-zero status).
    pub fn is_execution_failure(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::Timeout { .. })
    }
}

/// Failures talking to the backend token validator.
#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("validator request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid validator URL {0}")]
    Url(String),

    #[error("validator returned HTTP {status}")]
    Status { status: u16 },

    #[error("validator response not understood: {0}")]
    Decode(String),
}

/// Violations of the session store's structural rules, raised from inside a
/// transaction (which aborts it).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("token {0} already has a session")]
    DuplicateToken(String),

    #[error("device {0} is still bound to another live session")]
    DeviceBound(String),

    #[error("no session for token {0}")]
    UnknownSession(String),

    #[error("session window is empty (expires at {expires_at}, granted at {granted_at})")]
    EmptyWindow { granted_at: u64, expires_at: u64 },
}

/// Outcome failures of an authentication attempt.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("validation rejected: {0}")]
    ValidationRejected(String),

    #[error("token already bound to device {device}")]
    TokenInUse { device: String },

    #[error("enforcement failed: {0}")]
    Enforcement(#[from] EnforcementError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AccessError {
    /// Short reason shown to the client. Never includes internal detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::MissingField(_) => "token and deviceId are required",
            Self::ValidationRejected(_) => "Invalid or expired token",
            Self::TokenInUse { .. } => "Token already in use on another device",
            Self::Enforcement(_) => "Could not enable network access, please retry",
            Self::Store(_) => "Session conflict, please retry",
        }
    }
}

/// Failures loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}
