//! Bridges pull-based metrics scrapers to peers that are only reachable over a public-key
//! addressed overlay network.
//!
//! Peers register an alias for themselves over the `register-alias` protocol. The bridge keeps
//! a connection to every registered peer and turns `GET /scrape/{alias}/metrics` into a
//! `metrics` call over the `prometheus-metrics` protocol. Registered aliases are written to a
//! file-based service discovery file so the collector learns which paths to scrape.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod alias_client;
pub mod alias_server;
pub mod config;
pub mod http;
pub mod key;
pub mod metrics;
pub mod registry;
pub mod responder;
pub mod rpc;
pub mod scraper;
pub mod server;
pub mod targets;
pub mod transport;
pub mod wire;

pub use self::{
    key::{PeerKey, SharedSecret},
    registry::{AliasRegistry, RegistryEvent},
    server::Bridge,
};

/// Protocol name of the alias registration protocol.
pub const REGISTER_PROTOCOL: &str = "register-alias";
/// ALPN of the alias registration protocol.
pub const REGISTER_ALPN: &[u8] = REGISTER_PROTOCOL.as_bytes();
/// Method name of an alias registration.
pub const ALIAS_METHOD: &str = "alias";

/// Protocol name of the metrics protocol.
pub const METRICS_PROTOCOL: &str = "prometheus-metrics";
/// ALPN of the metrics protocol.
pub const METRICS_ALPN: &[u8] = METRICS_PROTOCOL.as_bytes();
/// Method name of a metrics fetch.
pub const METRICS_METHOD: &str = "metrics";
