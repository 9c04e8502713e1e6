//! Kage Shadowsocks 2022 Client Library
//!
//! Accepts inbound connections from local applications (SOCKS5 or a fixed
//! tunnel target) and relays them over an authenticated, encrypted channel
//! to a remote Shadowsocks 2022 server, for both TCP and UDP transports.

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod shadowsocks;

pub use client::Client;
pub use config::Config;
pub use error::{Error, Result};

/// Client version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
