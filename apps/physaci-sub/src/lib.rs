//! Node-side subscription client for the physaCI registrar.
//!
//! Reads the layered INI configuration, mints a replacement HMAC signing key,
//! probes the local node server for busy state, and registers the node with
//! the remote registrar. The new key is written back to the operator's config
//! file only once the registrar has accepted it.

pub mod cli;
pub mod config;
pub mod logging;
pub mod signature;
pub mod subscribe;

pub use config::{ConfigError, ConfigResolver, NodeConfig};
pub use subscribe::{SubscribeError, SubscriptionClient, SubscriptionMessage};
