#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! haxorport client library — the building blocks of the tunnel client.
//!
//! - `supervisor` — tunnel lifecycle across both connection modes
//! - `session` — WebSocket session, tunnel registry, HTTP request proxy
//! - `direct` — direct-TCP reverse tunnel and its repository
//! - `auth` — token validation and subscription limits
//! - `protocol` — control-channel message codec
//! - `backoff` — shared retry policy
//! - `config` — configuration loading
//! - `tunnel` — tunnel domain model
//! - `util` — socket tuning and address helpers

pub mod auth;
pub mod backoff;
pub mod config;
pub mod direct;
pub mod protocol;
pub mod session;
pub mod supervisor;
pub mod tunnel;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use supervisor::{TunnelError, TunnelSupervisor};
pub use tunnel::{Tunnel, TunnelConfig, TunnelType};
