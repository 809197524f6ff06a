//! Captive-portal detection.
//!
//! Phones and laptops probe a well-known URL right after joining a network.
//! Whatever they get back decides whether the OS pops up its sign-in sheet.
//! Clients with a live session get the exact answer their OS expects; every
//! other client is redirected to the splash page on this gateway.
//!
//! Detection is read-only: it never touches the store's write side or the
//! firewall.

use std::net::IpAddr;

use tracing::debug;

use crate::store::SessionStore;
use crate::util::Clock;

/// Well-known probe paths, one or more per OS convention.
pub const PROBE_PATHS: &[&str] = &[
    "/hotspot-detect.html",
    "/generate_204",
    "/gen_204",
    "/connecttest.txt",
    "/ncsi.txt",
    "/redirect",
    "/success.txt",
    "/canonical.html",
];

const SUCCESS_HTML: &str = "<HTML><HEAD><TITLE>Success</TITLE></HEAD><BODY>Success</BODY></HTML>";
const FIREFOX_CANONICAL: &str =
    "<meta http-equiv=\"refresh\" content=\"0;url=https://support.mozilla.org/kb/captive-portal\"/>";

/// Which OS convention a probe follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Apple `hotspot-detect.html`.
    Apple,
    /// Android / ChromeOS `generate_204` and `gen_204`.
    NoContent,
    /// Windows `connecttest.txt`.
    WindowsConnectTest,
    /// Windows `ncsi.txt`.
    WindowsNcsi,
    /// Firefox `success.txt`.
    FirefoxSuccess,
    /// Firefox `canonical.html`.
    FirefoxCanonical,
    /// Anything else routed here, including `/redirect`.
    Generic,
}

impl ProbeKind {
    pub fn from_path(path: &str) -> Self {
        match path.rsplit('/').next().unwrap_or_default() {
            "hotspot-detect.html" => Self::Apple,
            "generate_204" | "gen_204" => Self::NoContent,
            "connecttest.txt" => Self::WindowsConnectTest,
            "ncsi.txt" => Self::WindowsNcsi,
            "success.txt" => Self::FirefoxSuccess,
            "canonical.html" => Self::FirefoxCanonical,
            _ => Self::Generic,
        }
    }

    /// The "you are online" answer this OS expects.
    pub fn success_response(self) -> ProbeResponse {
        match self {
            Self::NoContent => ProbeResponse::NoContent,
            Self::Apple | Self::Generic => ProbeResponse::Body {
                content_type: "text/html",
                body: SUCCESS_HTML,
            },
            Self::WindowsConnectTest => ProbeResponse::Body {
                content_type: "text/plain",
                body: "Microsoft Connect Test",
            },
            Self::WindowsNcsi => ProbeResponse::Body {
                content_type: "text/plain",
                body: "Microsoft NCSI",
            },
            Self::FirefoxSuccess => ProbeResponse::Body {
                content_type: "text/plain",
                body: "success\n",
            },
            Self::FirefoxCanonical => ProbeResponse::Body {
                content_type: "text/html",
                body: FIREFOX_CANONICAL,
            },
        }
    }
}

/// Body of an "already connected" answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResponse {
    NoContent,
    Body {
        content_type: &'static str,
        body: &'static str,
    },
}

/// What to tell a probing client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    Connected(ProbeResponse),
    Redirect(String),
}

/// Answers captive-detection probes from the address index.
#[derive(Clone)]
pub struct CaptivePortalDetector {
    store: SessionStore,
    clock: Clock,
    splash_url: String,
}

impl CaptivePortalDetector {
    pub fn new(store: SessionStore, clock: Clock, splash_url: String) -> Self {
        Self {
            store,
            clock,
            splash_url,
        }
    }

    pub fn splash_url(&self) -> &str {
        &self.splash_url
    }

    /// Classify a probe on `path` from `address`. Sessions that have expired
    /// but not yet been swept count as absent.
    pub async fn classify(&self, path: &str, address: IpAddr) -> ProbeVerdict {
        let now = self.clock.now();
        let live = self
            .store
            .lookup_by_address(address)
            .await
            .is_some_and(|s| !s.is_expired(now));
        debug!(%address, path, authenticated = live, "Captive probe");
        if live {
            ProbeVerdict::Connected(ProbeKind::from_path(path).success_response())
        } else {
            ProbeVerdict::Redirect(self.splash_url.clone())
        }
    }
}
