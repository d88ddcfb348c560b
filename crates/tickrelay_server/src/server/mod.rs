#![forbid(unsafe_code)]

pub mod admission;
pub mod connection;
pub mod health;
pub mod listener;
pub mod relay;
pub mod session;
pub mod sync;
pub mod token_bucket;
pub mod usage;
