//! Token validation against the central backend.
//!
//! The gateway never decides on its own whether a token is good; it asks the
//! backend once per fresh authentication. Reconnections of a live session do
//! not go back to the backend.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::config::BackendConfig;
use crate::error::ValidatorError;
use crate::util::truncate_token;

/// Header carrying this gateway's identity on validation requests.
pub const EDGE_DEVICE_HEADER: &str = "x-edge-device";

/// Backend answer for one token.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationVerdict {
    pub valid: bool,
    #[serde(
        default,
        rename = "userId",
        alias = "principalId",
        deserialize_with = "null_as_default"
    )]
    pub principal_id: String,
    #[serde(
        default,
        rename = "pinId",
        alias = "grantId",
        deserialize_with = "null_as_default"
    )]
    pub grant_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub duration_minutes: u32,
    /// Explicit expiry in epoch milliseconds. `0` means unset.
    #[serde(default, rename = "expiresAt", alias = "expiresAtEpochMillis")]
    pub expires_at: Option<u64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
}

/// The backend sends `null` for fields it has no value for (a principal with
/// no linked account, for one).
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl ValidationVerdict {
    /// Expiry of a session granted at `now`, or `None` if the verdict does
    /// not grant access: negative, no usable expiry, or an expiry that is not
    /// after `now`.
    pub fn expiry(&self, now: u64) -> Option<u64> {
        if !self.valid {
            return None;
        }
        let expires_at = match self.expires_at {
            Some(at) if at > 0 => at,
            _ if self.duration_minutes > 0 => {
                now.saturating_add(u64::from(self.duration_minutes) * 60_000)
            }
            _ => return None,
        };
        (expires_at > now).then_some(expires_at)
    }

    /// Grant length for reporting; derived from the window when the backend
    /// only sent an explicit expiry.
    pub fn effective_duration(&self, now: u64, expires_at: u64) -> u32 {
        if self.duration_minutes > 0 {
            self.duration_minutes
        } else {
            u32::try_from(expires_at.saturating_sub(now).div_ceil(60_000)).unwrap_or(u32::MAX)
        }
    }

    pub fn rejected(message: &str) -> Self {
        Self {
            valid: false,
            message: message.to_string(),
            ..Self::default()
        }
    }
}

/// External authority on token legitimacy.
#[async_trait]
pub trait BackendValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<ValidationVerdict, ValidatorError>;
}

/// Validator that calls `GET {url}{validate_path}?token=...` on the backend.
pub struct HttpValidator {
    http: reqwest::Client,
    endpoint: reqwest::Url,
}

impl HttpValidator {
    pub fn new(config: &BackendConfig) -> Result<Self, ValidatorError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let device = reqwest::header::HeaderValue::from_str(&config.device_id)
            .map_err(|_| ValidatorError::Url(format!("bad device id {:?}", config.device_id)))?;
        headers.insert(
            reqwest::header::HeaderName::from_static(EDGE_DEVICE_HEADER),
            device,
        );
        let timeout = Duration::from_millis(config.timeout_ms);
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;

        let base = config.url.trim_end_matches('/');
        let raw = format!("{base}{}", config.validate_path);
        let endpoint = reqwest::Url::parse(&raw).map_err(|_| ValidatorError::Url(raw))?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &reqwest::Url {
        &self.endpoint
    }
}

#[async_trait]
impl BackendValidator for HttpValidator {
    async fn validate(&self, token: &str) -> Result<ValidationVerdict, ValidatorError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("token", token);

        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        debug!(token = %truncate_token(token), status = status.as_u16(), "Validator responded");

        if status.is_success() {
            return serde_json::from_str(&body).map_err(|e| ValidatorError::Decode(e.to_string()));
        }
        // The backend answers 401/403/404 for tokens it does not honour,
        // usually with a verdict body explaining why.
        if matches!(status.as_u16(), 401 | 403 | 404) {
            let verdict = serde_json::from_str::<ValidationVerdict>(&body)
                .map(|v| ValidationVerdict { valid: false, ..v })
                .unwrap_or_else(|_| ValidationVerdict::rejected("token not accepted"));
            return Ok(verdict);
        }
        warn!(status = status.as_u16(), "Validator returned unexpected status");
        Err(ValidatorError::Status {
            status: status.as_u16(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Validator with canned verdicts. Unknown tokens are rejected.
    #[derive(Default)]
    pub struct StaticValidator {
        verdicts: Mutex<HashMap<String, ValidationVerdict>>,
        unreachable: Mutex<bool>,
        calls: AtomicUsize,
    }

    impl StaticValidator {
        pub fn new() -> Self {
            Self::default()
        }

        /// Accept `token` for `minutes`.
        pub fn accept(&self, token: &str, minutes: u32) {
            self.set(
                token,
                ValidationVerdict {
                    valid: true,
                    principal_id: "user-1".into(),
                    grant_id: "pin-1".into(),
                    duration_minutes: minutes,
                    expires_at: None,
                    message: "ok".into(),
                },
            );
        }

        pub fn set(&self, token: &str, verdict: ValidationVerdict) {
            self.verdicts
                .lock()
                .unwrap()
                .insert(token.to_string(), verdict);
        }

        /// Simulate a transport failure on every call.
        pub fn set_unreachable(&self, unreachable: bool) {
            *self.unreachable.lock().unwrap() = unreachable;
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackendValidator for StaticValidator {
        async fn validate(&self, token: &str) -> Result<ValidationVerdict, ValidatorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if *self.unreachable.lock().unwrap() {
                return Err(ValidatorError::Status { status: 503 });
            }
            Ok(self
                .verdicts
                .lock()
                .unwrap()
                .get(token)
                .cloned()
                .unwrap_or_else(|| ValidationVerdict::rejected("unknown token")))
        }
    }
}
