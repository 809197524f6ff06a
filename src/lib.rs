#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! edgegate library: the captive-portal engine behind the `edgegate` binary.
//!
//! - `store`: session indices (token, device, address) with transactions
//! - `enforcement`: firewall backends (`iptables`, in-memory dry run)
//! - `validator`: token validation against the central backend
//! - `access`: the authentication flow and operator revocation
//! - `captive`: captive-detection probe classification
//! - `sweeper`: periodic expiry of sessions
//! - `activity`: in-memory access journal
//! - `routes`: HTTP handlers and router
//! - `auth`: operator API key middleware
//! - `config`: configuration loading

pub mod access;
pub mod activity;
pub mod auth;
pub mod captive;
pub mod config;
pub mod enforcement;
pub mod error;
pub mod routes;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod sweeper;
pub mod util;
pub mod validator;
