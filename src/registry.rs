//! The alias registry, mapping aliases to the peers they are scraped from.
//!
//! Every entry owns a [`ScraperClient`] for its target and expires unless it is renewed. The
//! registry persists its entries to the target file through a debounced writer task, reloads
//! them on [`AliasRegistry::start`], and evicts expired entries on a fixed interval.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use n0_future::time::Duration;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::{
    sync::{broadcast, mpsc},
    task::{JoinHandle, JoinSet},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, debug_span, info, warn};

use crate::{
    alias_server::PutAlias,
    key::{KeyParsingError, PeerKey},
    metrics::Metrics,
    scraper::ScraperClient,
    targets::{self, TargetEntry, TargetsError},
    transport::Transport,
};

/// Default time after which an alias that was not renewed is evicted.
pub const DEFAULT_ENTRY_EXPIRY: Duration = Duration::from_secs(3 * 60 * 60);
/// Default interval between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

const EVENT_CAPACITY: usize = 128;

/// Errors of [`AliasRegistry::put`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum PutError {
    #[snafu(display("Registry is not started, cannot persist"))]
    NotReady {},
    #[snafu(display("Registry is closed"))]
    Closed {},
    #[snafu(display("Invalid alias {alias:?}"))]
    InvalidAlias { alias: String },
    #[snafu(display("Invalid {field} {value:?}, must not contain ':'"))]
    InvalidMetadata { field: &'static str, value: String },
    #[snafu(display("Invalid target key"))]
    InvalidKey { source: KeyParsingError },
}

/// Options for an [`AliasRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Time after which an alias that was not renewed is evicted.
    pub entry_expiry: Duration,
    /// Interval between expiry sweeps.
    pub sweep_interval: Duration,
    /// Location of the target file.
    pub targets_path: PathBuf,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            entry_expiry: DEFAULT_ENTRY_EXPIRY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            targets_path: PathBuf::from("prometheus").join("targets.json"),
        }
    }
}

/// Options for a single [`AliasRegistry::put`].
#[derive(Debug, Clone, Copy)]
pub struct PutOptions {
    /// Whether to schedule a write of the target file.
    pub persist: bool,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self { persist: true }
    }
}

/// A registered alias.
#[derive(Debug, Clone)]
pub struct AliasEntry {
    /// The alias.
    pub alias: String,
    /// The peer scraped for this alias.
    pub target: PeerKey,
    /// Descriptive host name.
    pub hostname: String,
    /// Descriptive service name.
    pub service: String,
    /// When the entry becomes evictable.
    pub expiry: Instant,
    /// The client fetching metrics from `target`.
    pub client: Arc<ScraperClient>,
}

impl AliasEntry {
    /// Whether the entry is evictable at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expiry
    }

    fn to_target(&self) -> TargetEntry {
        TargetEntry {
            alias: self.alias.clone(),
            target: self.target,
            hostname: self.hostname.clone(),
            service: self.service.clone(),
        }
    }
}

/// Changes of the registry, see [`AliasRegistry::subscribe`].
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// An alias was added, renewed or replaced.
    AliasSet {
        /// The entry after the change.
        entry: AliasEntry,
        /// Whether the alias now points at a new client.
        updated: bool,
    },
    /// An alias was evicted after its expiry.
    AliasExpired {
        /// The evicted alias.
        alias: String,
        /// The peer it pointed at.
        target: PeerKey,
    },
    /// The target file was written.
    AliasesWritten {
        /// Location of the target file.
        path: PathBuf,
    },
    /// Writing the target file failed.
    WriteFailed {
        /// The failure.
        error: Arc<TargetsError>,
    },
    /// Reading the target file on start failed.
    LoadFailed {
        /// The failure. [`TargetsError::is_not_found`] on first start.
        error: Arc<TargetsError>,
    },
}

type Entries = Arc<Mutex<BTreeMap<String, AliasEntry>>>;

/// The alias registry.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Debug, Clone)]
pub struct AliasRegistry {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    transport: Arc<dyn Transport>,
    options: RegistryOptions,
    metrics: Arc<Metrics>,
    entries: Entries,
    persister: Arc<Persister>,
    ready: AtomicBool,
    closed: AtomicBool,
    writes: Mutex<Option<mpsc::Sender<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    sweeper: CancellationToken,
    sweeper_task: Mutex<Option<JoinHandle<()>>>,
    disposals: TaskTracker,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

impl AliasRegistry {
    /// Creates a registry whose scraper clients connect over `transport`.
    ///
    /// The registry is not ready until [`Self::start`] completed. Must be called from within
    /// a tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        options: RegistryOptions,
        metrics: Arc<Metrics>,
    ) -> Self {
        let entries = Entries::default();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let persister = Arc::new(Persister {
            entries: entries.clone(),
            path: options.targets_path.clone(),
            events,
            metrics: metrics.clone(),
        });
        // one slot: a request during a write queues exactly one follow-up write
        let (writes_tx, writes_rx) = mpsc::channel(1);
        let writer = tokio::spawn(
            persister
                .clone()
                .run(writes_rx)
                .instrument(debug_span!("targets-writer")),
        );
        Self {
            inner: Arc::new(Inner {
                transport,
                options,
                metrics,
                entries,
                persister,
                ready: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                writes: Mutex::new(Some(writes_tx)),
                writer: Mutex::new(Some(writer)),
                sweeper: CancellationToken::new(),
                sweeper_task: Mutex::new(None),
                disposals: TaskTracker::new(),
            }),
        }
    }

    /// Reloads the target file and starts the expiry sweep.
    ///
    /// A missing or unreadable file is reported as [`RegistryEvent::LoadFailed`] and leaves
    /// the registry empty. Registrations must not be accepted before this returns.
    pub async fn start(&self) -> Result<(), PutError> {
        snafu::ensure!(!self.inner.closed.load(Ordering::SeqCst), ClosedSnafu);
        if self.is_ready() {
            return Ok(());
        }
        let path = &self.inner.options.targets_path;
        match targets::read_targets(path).await {
            Ok(entries) => {
                let count = entries.len();
                for entry in entries {
                    let TargetEntry {
                        alias,
                        target,
                        hostname,
                        service,
                    } = entry;
                    let opts = PutOptions { persist: false };
                    if let Err(err) = self.put(&alias, target, &hostname, &service, opts) {
                        warn!(%alias, "skipping persisted alias: {err:#}");
                    }
                }
                info!(count, path = %path.display(), "aliases-loaded");
            }
            Err(err) => {
                if err.is_not_found() {
                    info!(path = %path.display(), "no target file yet");
                } else {
                    warn!(path = %path.display(), "targets-load-failed: {err:#}");
                }
                self.send_event(RegistryEvent::LoadFailed {
                    error: Arc::new(err),
                });
            }
        }
        self.inner.ready.store(true, Ordering::SeqCst);
        self.spawn_sweeper();
        Ok(())
    }

    /// Whether [`Self::start`] completed.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// The options the registry was created with.
    pub fn options(&self) -> &RegistryOptions {
        &self.inner.options
    }

    /// Subscribes to registry changes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.persister.events.subscribe()
    }

    /// Maps `alias` to `target`. Returns whether the alias now points at a new client.
    ///
    /// Putting the target an alias already points at only renews its expiry; `hostname`
    /// and `service` are kept from the first registration. Neither may contain `:`, which
    /// separates the fields of a target string. Putting a different target
    /// replaces the entry and closes the old client in the background.
    pub fn put<K>(
        &self,
        alias: &str,
        target: K,
        hostname: &str,
        service: &str,
        opts: PutOptions,
    ) -> Result<bool, PutError>
    where
        K: TryInto<PeerKey>,
        K::Error: Into<KeyParsingError>,
    {
        snafu::ensure!(!self.inner.closed.load(Ordering::SeqCst), ClosedSnafu);
        snafu::ensure!(!opts.persist || self.is_ready(), NotReadySnafu);
        snafu::ensure!(
            !alias.is_empty() && !alias.contains([':', '/']),
            InvalidAliasSnafu { alias }
        );
        for (field, value) in [("hostname", hostname), ("service", service)] {
            snafu::ensure!(!value.contains(':'), InvalidMetadataSnafu { field, value });
        }
        let target: PeerKey = target
            .try_into()
            .map_err(Into::<KeyParsingError>::into)
            .context(InvalidKeySnafu)?;

        let expiry = Instant::now() + self.inner.options.entry_expiry;
        let (entry, change) = {
            let mut entries = self.inner.entries.lock().expect("poisoned");
            let renewed = entries
                .get_mut(alias)
                .filter(|entry| entry.target == target)
                .map(|entry| {
                    entry.expiry = expiry;
                    entry.clone()
                });
            match renewed {
                Some(entry) => (entry, Change::Renewed),
                None => {
                    let client = entries
                        .values()
                        .find(|entry| entry.target == target && !entry.client.is_closing())
                        .map(|entry| entry.client.clone())
                        .unwrap_or_else(|| {
                            Arc::new(ScraperClient::new(
                                self.inner.transport.clone(),
                                target,
                                self.inner.metrics.clone(),
                            ))
                        });
                    let entry = AliasEntry {
                        alias: alias.to_string(),
                        target,
                        hostname: hostname.to_string(),
                        service: service.to_string(),
                        expiry,
                        client,
                    };
                    match entries.insert(alias.to_string(), entry.clone()) {
                        None => (entry, Change::Added),
                        Some(previous) => {
                            let released = unreferenced(&entries, [previous.client]);
                            (entry, Change::Replaced(previous.target, released))
                        }
                    }
                }
            }
        };

        let updated = match change {
            Change::Renewed => {
                debug!(%alias, %target, "alias-renewed");
                self.inner.metrics.aliases_renewed.inc();
                false
            }
            Change::Added => {
                info!(%alias, %target, "alias-added");
                self.inner.metrics.aliases_added.inc();
                true
            }
            Change::Replaced(previous, released) => {
                info!(%alias, %target, %previous, "alias-replaced");
                self.inner.metrics.aliases_replaced.inc();
                self.dispose(released);
                true
            }
        };
        self.send_event(RegistryEvent::AliasSet { entry, updated });
        if opts.persist {
            self.request_write();
        }
        Ok(updated)
    }

    /// Returns the entry for `alias`.
    pub fn lookup(&self, alias: &str) -> Option<AliasEntry> {
        self.inner
            .entries
            .lock()
            .expect("poisoned")
            .get(alias)
            .cloned()
    }

    /// Returns all entries, ordered by alias.
    pub fn entries(&self) -> Vec<AliasEntry> {
        self.inner
            .entries
            .lock()
            .expect("poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Evicts all expired entries and returns how many were evicted.
    ///
    /// Runs on every sweep. The clients of evicted entries are closed in the background.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let (expired, released) = {
            let mut entries = self.inner.entries.lock().expect("poisoned");
            let aliases: Vec<String> = entries
                .values()
                .filter(|entry| entry.is_expired(now))
                .map(|entry| entry.alias.clone())
                .collect();
            let expired: Vec<AliasEntry> = aliases
                .iter()
                .filter_map(|alias| entries.remove(alias))
                .collect();
            let released = unreferenced(&entries, expired.iter().map(|e| e.client.clone()));
            (expired, released)
        };
        for AliasEntry { alias, target, .. } in &expired {
            info!(%alias, %target, "alias-expired");
            self.inner.metrics.aliases_expired.inc();
            self.send_event(RegistryEvent::AliasExpired {
                alias: alias.clone(),
                target: *target,
            });
        }
        self.dispose(released);
        if !expired.is_empty() {
            self.request_write();
        }
        expired.len()
    }

    /// Stops the expiry sweep. A sweep in progress completes.
    pub fn stop_expiry(&self) {
        self.inner.sweeper.cancel();
    }

    /// Closes the registry.
    ///
    /// Stops the expiry sweep, closes all scraper clients and the transport, then writes the
    /// target file one last time if the registry was started.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_expiry();
        let sweeper = self.inner.sweeper_task.lock().expect("poisoned").take();
        if let Some(sweeper) = sweeper {
            sweeper.await.ok();
        }

        let clients = {
            let entries = self.inner.entries.lock().expect("poisoned");
            unreferenced(&BTreeMap::new(), entries.values().map(|e| e.client.clone()))
        };
        let mut closing = JoinSet::new();
        for client in clients {
            closing.spawn(async move { client.close().await });
        }
        while closing.join_next().await.is_some() {}
        self.inner.disposals.close();
        self.inner.disposals.wait().await;
        self.inner.transport.shutdown().await;

        // dropping the sender lets the writer finish a pending write and exit
        drop(self.inner.writes.lock().expect("poisoned").take());
        let writer = self.inner.writer.lock().expect("poisoned").take();
        if let Some(writer) = writer {
            writer.await.ok();
        }
        if self.is_ready() {
            self.inner.persister.write_all().await;
        }
        debug!("registry closed");
    }

    fn request_write(&self) {
        if let Some(writes) = self.inner.writes.lock().expect("poisoned").as_ref() {
            // a full slot means a write is already pending and will see this change
            writes.try_send(()).ok();
        }
    }

    fn dispose(&self, clients: Vec<Arc<ScraperClient>>) {
        for client in clients {
            let target = client.target();
            self.inner.disposals.spawn(
                async move {
                    client.close().await;
                    debug!("scraper closed");
                }
                .instrument(debug_span!("dispose", target = %target.fmt_short())),
            );
        }
    }

    fn spawn_sweeper(&self) {
        let registry = Arc::downgrade(&self.inner);
        let cancel = self.inner.sweeper.clone();
        let period = self.inner.options.sweep_interval;
        let task = tokio::spawn(
            async move {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {}
                    }
                    let Some(inner) = registry.upgrade() else {
                        break;
                    };
                    let expired = AliasRegistry { inner }.cleanup_expired();
                    debug!(expired, "sweep done");
                }
            }
            .instrument(debug_span!("expiry-sweep")),
        );
        *self.inner.sweeper_task.lock().expect("poisoned") = Some(task);
    }

    fn send_event(&self, event: RegistryEvent) {
        self.inner.persister.events.send(event).ok();
    }
}

impl PutAlias for AliasRegistry {
    type Error = PutError;

    async fn put_alias(&self, alias: String, target: PeerKey) -> Result<bool, PutError> {
        self.put(&alias, target, "", "", PutOptions::default())
    }
}

enum Change {
    Added,
    Renewed,
    Replaced(PeerKey, Vec<Arc<ScraperClient>>),
}

/// Returns the distinct `clients` that no entry in `entries` uses.
fn unreferenced(
    entries: &BTreeMap<String, AliasEntry>,
    clients: impl IntoIterator<Item = Arc<ScraperClient>>,
) -> Vec<Arc<ScraperClient>> {
    let mut out: Vec<Arc<ScraperClient>> = Vec::new();
    for client in clients {
        let in_use = entries
            .values()
            .any(|entry| Arc::ptr_eq(&entry.client, &client))
            || out.iter().any(|other| Arc::ptr_eq(other, &client));
        if !in_use {
            out.push(client);
        }
    }
    out
}

#[derive(Debug)]
struct Persister {
    entries: Entries,
    path: PathBuf,
    events: broadcast::Sender<RegistryEvent>,
    metrics: Arc<Metrics>,
}

impl Persister {
    async fn run(self: Arc<Self>, mut writes: mpsc::Receiver<()>) {
        while writes.recv().await.is_some() {
            self.write_all().await;
        }
    }

    async fn write_all(&self) {
        let targets: Vec<TargetEntry> = self
            .entries
            .lock()
            .expect("poisoned")
            .values()
            .map(AliasEntry::to_target)
            .collect();
        match targets::write_targets(&self.path, &targets).await {
            Ok(()) => {
                debug!(count = targets.len(), path = %self.path.display(), "targets-written");
                self.metrics.targets_written.inc();
                self.events
                    .send(RegistryEvent::AliasesWritten {
                        path: self.path.clone(),
                    })
                    .ok();
            }
            Err(err) => {
                warn!(path = %self.path.display(), "targets-write-failed: {err:#}");
                self.metrics.targets_write_failures.inc();
                self.events
                    .send(RegistryEvent::WriteFailed {
                        error: Arc::new(err),
                    })
                    .ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use n0_snafu::{Result, ResultExt};
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        METRICS_ALPN,
        scraper::{ConnState, FetchError},
        transport::memory::MemoryNetwork,
    };

    fn key(n: u8) -> PeerKey {
        PeerKey::from_bytes([n; 32])
    }

    struct Setup {
        registry: AliasRegistry,
        path: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn setup(entry_expiry: Duration, sweep_interval: Duration) -> Result<Setup> {
        let dir = tempfile::tempdir().e()?;
        let path = dir.path().join("targets.json");
        let network = MemoryNetwork::new();
        let transport = Arc::new(network.bind(key(0), [METRICS_ALPN]));
        let options = RegistryOptions {
            entry_expiry,
            sweep_interval,
            targets_path: path.clone(),
        };
        let registry = AliasRegistry::new(transport, options, Arc::new(Metrics::default()));
        Ok(Setup {
            registry,
            path,
            _dir: dir,
        })
    }

    fn setup_default() -> Result<Setup> {
        setup(DEFAULT_ENTRY_EXPIRY, DEFAULT_SWEEP_INTERVAL)
    }

    async fn next_event(
        events: &mut broadcast::Receiver<RegistryEvent>,
        matches: impl Fn(&RegistryEvent) -> bool,
    ) -> Result<RegistryEvent> {
        let wait = async {
            loop {
                let event = events.recv().await.e()?;
                if matches(&event) {
                    return Ok::<_, n0_snafu::Error>(event);
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.e()?
    }

    fn persisted_aliases(path: &std::path::Path) -> Result<Vec<String>> {
        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).e()?).e()?;
        let targets = json[0]["targets"].as_array().cloned().unwrap_or_default();
        Ok(targets
            .iter()
            .filter_map(|target| target.as_str())
            .filter_map(|target| target.split(':').next())
            .map(ToString::to_string)
            .collect())
    }

    #[tokio::test]
    #[traced_test]
    async fn persisting_put_requires_start() -> Result {
        let setup = setup_default()?;
        let res = setup
            .registry
            .put("a", key(1), "", "", PutOptions::default());
        assert!(matches!(res, Err(PutError::NotReady { .. })));
        assert!(
            setup
                .registry
                .put("a", key(1), "", "", PutOptions { persist: false })?
        );

        setup.registry.start().await?;
        assert!(
            setup
                .registry
                .put("b", key(2), "", "", PutOptions::default())?
        );
        setup.registry.close().await;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn rejects_invalid_input() -> Result {
        let setup = setup_default()?;
        setup.registry.start().await?;
        for alias in ["", "a:b", "a/b"] {
            let res = setup
                .registry
                .put(alias, key(1), "", "", PutOptions::default());
            assert!(matches!(res, Err(PutError::InvalidAlias { .. })), "{alias}");
        }
        let res = setup
            .registry
            .put("a", "not a key", "", "", PutOptions::default());
        assert!(matches!(res, Err(PutError::InvalidKey { .. })));
        for (hostname, service) in [("host:8080", "svc"), ("host", "svc:1")] {
            let res = setup
                .registry
                .put("a", key(1), hostname, service, PutOptions::default());
            assert!(
                matches!(res, Err(PutError::InvalidMetadata { .. })),
                "{hostname} {service}"
            );
        }
        assert!(setup.registry.entries().is_empty());

        let z32 = key(1).to_string();
        assert!(
            setup
                .registry
                .put("a", z32.as_str(), "", "", PutOptions::default())?
        );
        assert_eq!(setup.registry.lookup("a").expect("present").target, key(1));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn put_is_idempotent() -> Result {
        let setup = setup_default()?;
        setup.registry.start().await?;
        let registry = &setup.registry;

        assert!(registry.put("a", key(1), "host", "svc", PutOptions::default())?);
        let first = registry.lookup("a").expect("present");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!registry.put("a", key(1), "other", "other", PutOptions::default())?);
        let second = registry.lookup("a").expect("present");

        assert!(Arc::ptr_eq(&first.client, &second.client));
        assert!(second.expiry > first.expiry);
        assert_eq!(second.hostname, "host");
        assert_eq!(second.service, "svc");
        assert_eq!(registry.inner.metrics.aliases_added.get(), 1);
        assert_eq!(registry.inner.metrics.aliases_renewed.get(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn put_replaces_target() -> Result {
        let setup = setup_default()?;
        setup.registry.start().await?;
        let registry = &setup.registry;

        assert!(registry.put("a", key(1), "", "", PutOptions::default())?);
        let old = registry.lookup("a").expect("present");
        assert!(registry.put("a", key(2), "", "", PutOptions::default())?);

        let new = registry.lookup("a").expect("present");
        assert_eq!(new.target, key(2));
        assert_eq!(new.client.target(), key(2));
        assert!(!Arc::ptr_eq(&old.client, &new.client));
        let res = tokio::time::timeout(Duration::from_secs(1), old.client.wait_open())
            .await
            .e()?;
        assert!(matches!(res, Err(FetchError::ClientClosed { .. })));
        assert_eq!(old.client.state(), ConnState::Closing);
        assert_eq!(registry.inner.metrics.aliases_replaced.get(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn aliases_share_a_target() -> Result {
        let setup = setup_default()?;
        setup.registry.start().await?;
        let registry = &setup.registry;

        registry.put("a", key(1), "", "", PutOptions::default())?;
        registry.put("b", key(1), "", "", PutOptions::default())?;
        let a = registry.lookup("a").expect("present");
        let b = registry.lookup("b").expect("present");
        assert!(Arc::ptr_eq(&a.client, &b.client));

        registry.put("a", key(2), "", "", PutOptions::default())?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!b.client.is_closing());
        assert_ne!(b.client.state(), ConnState::Closing);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn expired_aliases_are_evicted() -> Result {
        let setup = setup(Duration::from_millis(500), Duration::from_millis(100))?;
        setup.registry.start().await?;
        let mut events = setup.registry.subscribe();

        let start = Instant::now();
        setup
            .registry
            .put("a", key(1), "", "", PutOptions::default())?;
        let client = setup.registry.lookup("a").expect("present").client;

        let event = next_event(&mut events, |event| {
            matches!(event, RegistryEvent::AliasExpired { .. })
        })
        .await?;
        assert!(start.elapsed() >= Duration::from_millis(500));
        let RegistryEvent::AliasExpired { alias, target } = event else {
            unreachable!()
        };
        assert_eq!(alias, "a");
        assert_eq!(target, key(1));
        assert!(setup.registry.lookup("a").is_none());

        next_event(&mut events, |event| {
            matches!(event, RegistryEvent::AliasesWritten { .. })
        })
        .await?;
        assert!(persisted_aliases(&setup.path)?.is_empty());

        let res = tokio::time::timeout(Duration::from_secs(1), client.wait_open())
            .await
            .e()?;
        assert!(matches!(res, Err(FetchError::ClientClosed { .. })));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn renewal_prevents_expiry() -> Result {
        let setup = setup(Duration::from_millis(1000), Duration::from_millis(100))?;
        setup.registry.start().await?;
        let registry = &setup.registry;

        registry.put("a", key(1), "", "", PutOptions::default())?;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!registry.put("a", key(1), "", "", PutOptions::default())?);
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(registry.lookup("a").is_some());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn writes_are_coalesced() -> Result {
        let setup = setup_default()?;
        setup.registry.start().await?;
        let mut events = setup.registry.subscribe();

        for n in 0..10u8 {
            setup
                .registry
                .put(&format!("alias-{n}"), key(n + 1), "", "", PutOptions::default())?;
        }
        next_event(&mut events, |event| {
            matches!(event, RegistryEvent::AliasesWritten { .. })
        })
        .await?;
        let more = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
        assert!(more.is_err(), "unexpected event {more:?}");
        assert_eq!(persisted_aliases(&setup.path)?.len(), 10);
        assert_eq!(setup.registry.inner.metrics.targets_written.get(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn write_during_write_queues_one_more() -> Result {
        let setup = setup_default()?;
        setup.registry.start().await?;
        let mut events = setup.registry.subscribe();
        let registry = &setup.registry;

        registry.put("first", key(1), "", "", PutOptions::default())?;
        // the slot frees up once the writer took the request and started writing
        let writes = registry
            .inner
            .writes
            .lock()
            .expect("poisoned")
            .clone()
            .expect("writer running");
        while writes.capacity() == 0 {
            tokio::task::yield_now().await;
        }
        drop(writes);
        for n in 0..5u8 {
            registry.put(&format!("alias-{n}"), key(n + 2), "", "", PutOptions::default())?;
        }

        for _ in 0..2 {
            next_event(&mut events, |event| {
                matches!(event, RegistryEvent::AliasesWritten { .. })
            })
            .await?;
        }
        let more = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
        assert!(more.is_err(), "unexpected event {more:?}");
        assert_eq!(registry.inner.metrics.targets_written.get(), 2);
        assert_eq!(persisted_aliases(&setup.path)?.len(), 6);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn write_failure_is_reported() -> Result {
        let dir = tempfile::tempdir().e()?;
        // a file where the target directory should be
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").e()?;
        let network = MemoryNetwork::new();
        let metrics = Arc::new(Metrics::default());
        let options = RegistryOptions {
            targets_path: blocker.join("targets.json"),
            ..Default::default()
        };
        let registry = AliasRegistry::new(
            Arc::new(network.bind(key(0), [METRICS_ALPN])),
            options,
            metrics.clone(),
        );
        registry.start().await?;
        let mut events = registry.subscribe();

        assert!(registry.put("a", key(1), "", "", PutOptions::default())?);
        let event = next_event(&mut events, |event| {
            matches!(event, RegistryEvent::WriteFailed { .. })
        })
        .await?;
        let RegistryEvent::WriteFailed { error } = event else {
            unreachable!()
        };
        assert!(matches!(*error, TargetsError::CreateDir { .. }), "{error:?}");
        assert_eq!(metrics.targets_write_failures.get(), 1);
        assert!(registry.lookup("a").is_some());

        // the final write fails the same way without affecting shutdown
        registry.close().await;
        assert_eq!(metrics.targets_write_failures.get(), 2);
        assert_eq!(metrics.targets_written.get(), 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn metadata_survives_reload() -> Result {
        let setup = setup_default()?;
        setup.registry.start().await?;
        setup
            .registry
            .put("a", key(1), "host.example", "node-exporter", PutOptions::default())?;
        setup.registry.close().await;

        let network = MemoryNetwork::new();
        let options = RegistryOptions {
            targets_path: setup.path.clone(),
            ..Default::default()
        };
        let registry = AliasRegistry::new(
            Arc::new(network.bind(key(0), [METRICS_ALPN])),
            options,
            Arc::new(Metrics::default()),
        );
        registry.start().await?;
        let entry = registry.lookup("a").expect("reloaded");
        assert_eq!(entry.target, key(1));
        assert_eq!(entry.hostname, "host.example");
        assert_eq!(entry.service, "node-exporter");
        registry.close().await;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn start_reloads_target_file() -> Result {
        let setup = setup_default()?;
        let persisted = vec![
            TargetEntry {
                alias: "a".to_string(),
                target: key(1),
                hostname: String::new(),
                service: String::new(),
            },
            TargetEntry {
                alias: "b".to_string(),
                target: key(2),
                hostname: "host".to_string(),
                service: "svc".to_string(),
            },
        ];
        targets::write_targets(&setup.path, &persisted).await?;
        let mut events = setup.registry.subscribe();

        setup.registry.start().await?;
        assert!(setup.registry.is_ready());
        let b = setup.registry.lookup("b").expect("reloaded");
        assert_eq!(b.target, key(2));
        assert_eq!(b.hostname, "host");
        assert_eq!(setup.registry.entries().len(), 2);

        // a reload does not write the file back
        let more = tokio::time::timeout(Duration::from_millis(100), async {
            loop {
                if let Ok(RegistryEvent::AliasesWritten { .. }) = events.recv().await {
                    break;
                }
            }
        })
        .await;
        assert!(more.is_err());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_target_file_is_reported() -> Result {
        let setup = setup_default()?;
        let mut events = setup.registry.subscribe();
        setup.registry.start().await?;
        let event = next_event(&mut events, |event| {
            matches!(event, RegistryEvent::LoadFailed { .. })
        })
        .await?;
        let RegistryEvent::LoadFailed { error } = event else {
            unreachable!()
        };
        assert!(error.is_not_found());
        assert!(setup.registry.is_ready());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn close_persists_and_stops() -> Result {
        let setup = setup_default()?;
        setup.registry.start().await?;
        let registry = &setup.registry;
        registry.put("a", key(1), "", "", PutOptions::default())?;
        registry.put("b", key(2), "", "", PutOptions::default())?;
        let clients: Vec<_> = registry.entries().into_iter().map(|e| e.client).collect();

        registry.close().await;
        for client in clients {
            assert!(client.is_closing());
            assert_eq!(client.state(), ConnState::Closing);
        }
        assert_eq!(persisted_aliases(&setup.path)?, vec!["a", "b"]);
        let res = registry.put("c", key(3), "", "", PutOptions::default());
        assert!(matches!(res, Err(PutError::Closed { .. })));
        assert!(matches!(registry.start().await, Err(PutError::Closed { .. })));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn close_before_start_does_not_write() -> Result {
        let setup = setup_default()?;
        setup
            .registry
            .put("a", key(1), "", "", PutOptions { persist: false })?;
        setup.registry.close().await;
        assert!(!setup.path.exists());
        Ok(())
    }
}
