#![forbid(unsafe_code)]

pub mod config;
pub mod server;

pub use server::relay::{RelayHandle, RelaySettings, RelayStats, start_relay};
