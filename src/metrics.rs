//! Metrics for the bridge.

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics tracked by the bridge.
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "scrape_bridge")]
pub struct Metrics {
    /*
     * Registration protocol
     */
    /// Registration requests received.
    pub register_requests: Counter,
    /// Registration requests refused because of a wrong secret.
    pub register_unauthorised: Counter,
    /// Registration requests applied.
    pub register_success: Counter,
    /// Registration requests whose registration failed.
    pub register_failures: Counter,
    /// Registration requests that could not be decoded.
    pub register_malformed: Counter,

    /*
     * Alias registry
     */
    /// Aliases added for the first time.
    pub aliases_added: Counter,
    /// Aliases renewed with the same target.
    pub aliases_renewed: Counter,
    /// Aliases pointed at a different target.
    pub aliases_replaced: Counter,
    /// Aliases removed after their expiry.
    pub aliases_expired: Counter,
    /// Target file writes.
    #[metrics(help = "Number of times the target file was written.")]
    pub targets_written: Counter,
    /// Target file writes that failed.
    pub targets_write_failures: Counter,

    /*
     * Scraper connections
     */
    /// Sockets to a scrape target accepted as the current connection.
    pub scraper_conns_accepted: Counter,
    /// Sockets from peers that are not the expected target.
    pub scraper_conns_ignored: Counter,
    /// Scraper connections closed.
    pub scraper_conns_closed: Counter,

    /*
     * HTTP gateway
     */
    /// Scrapes answered with the upstream's metrics.
    pub scrapes_ok: Counter,
    /// Scrapes for an alias that is not registered.
    pub scrapes_unknown_alias: Counter,
    /// Scrapes that failed because the upstream was not reachable.
    pub scrapes_upstream_unavailable: Counter,
    /// Scrapes where the upstream reported an error.
    pub scrapes_upstream_error: Counter,
}
