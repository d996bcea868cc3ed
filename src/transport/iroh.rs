//! The overlay transport over an iroh [`Endpoint`].
//!
//! Every socket is one QUIC connection carrying a single bidirectional stream. Joined peers
//! are dialed in a loop that reconnects with exponential backoff after the connection drops.

use std::sync::{Arc, Mutex};

use backon::{Backoff, BackoffBuilder, ExponentialBuilder};
use iroh::{
    Endpoint, NodeAddr, PublicKey, SecretKey,
    endpoint::{BindError, ConnectError, Connection, ConnectionError},
};
use n0_future::{boxed::BoxFuture, time, time::Duration};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, info_span, trace, warn};

use super::{Joins, PeerSocket, Subscribers, Transport};
use crate::key::PeerKey;

/// Errors when establishing a socket to a joined peer.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum DialError {
    #[snafu(display("Key is not a valid overlay identity"))]
    InvalidKey {},
    #[snafu(display("Failed to connect"))]
    Connect { source: ConnectError },
    #[snafu(display("Failed to open stream"))]
    OpenStream { source: ConnectionError },
}

/// A [`Transport`] backed by an iroh [`Endpoint`].
#[derive(Debug, Clone)]
pub struct IrohTransport {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    endpoint: Endpoint,
    key: PeerKey,
    subscribers: Subscribers,
    joins: Mutex<Joins<CancellationToken>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl IrohTransport {
    /// Binds an endpoint with n0 discovery, accepting connections for `alpns`.
    pub async fn bind(
        secret_key: SecretKey,
        alpns: impl IntoIterator<Item = &'static [u8]>,
    ) -> Result<Self, BindError> {
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(alpns.into_iter().map(|alpn| alpn.to_vec()).collect())
            .discovery_n0()
            .bind()
            .await?;
        Ok(Self::from_endpoint(endpoint))
    }

    /// Wraps an already bound endpoint and starts accepting connections on it.
    ///
    /// The endpoint must be configured with the protocols it should accept.
    pub fn from_endpoint(endpoint: Endpoint) -> Self {
        let key = PeerKey::from_bytes(*endpoint.node_id().as_bytes());
        let inner = Arc::new(Inner {
            endpoint,
            key,
            subscribers: Subscribers::default(),
            joins: Mutex::new(Joins::default()),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        inner.tasks.spawn(
            inner
                .clone()
                .accept_loop()
                .instrument(info_span!("iroh-accept", me = %key.fmt_short())),
        );
        Self { inner }
    }

    /// The underlying endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }
}

impl Inner {
    async fn accept_loop(self: Arc<Self>) {
        loop {
            let incoming = tokio::select! {
                _ = self.cancel.cancelled() => break,
                incoming = self.endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };
            let this = self.clone();
            self.tasks.spawn(
                async move {
                    let conn = match incoming.await {
                        Ok(conn) => conn,
                        Err(err) => {
                            debug!("incoming connection failed: {err:#}");
                            return;
                        }
                    };
                    if let Err(err) = this.handle_incoming(conn).await {
                        debug!("inbound connection failed: {err:#}");
                    }
                }
                .instrument(info_span!("iroh-conn")),
            );
        }
        debug!("accept loop stopped");
    }

    async fn handle_incoming(&self, conn: Connection) -> Result<(), ConnectionError> {
        let Ok(remote) = conn.remote_node_id() else {
            debug!("connection without remote identity");
            return Ok(());
        };
        let Some(alpn) = conn.alpn() else {
            debug!("connection without protocol");
            return Ok(());
        };
        let (send, recv) = conn.accept_bi().await?;
        let cancel = self.cancel.child_token();
        let remote = PeerKey::from_bytes(*remote.as_bytes());
        debug!(remote = %remote.fmt_short(), alpn = %String::from_utf8_lossy(&alpn), "accepted");
        self.subscribers.emit(PeerSocket::new(
            remote,
            alpn,
            tokio::io::join(recv, send),
            cancel.clone(),
        ));
        tokio::select! {
            _ = cancel.cancelled() => conn.close(0u32.into(), b"closed"),
            err = conn.closed() => {
                trace!("connection closed: {err:#}");
                cancel.cancel();
            }
        }
        Ok(())
    }

    async fn dial_loop(
        self: Arc<Self>,
        remote: PeerKey,
        alpn: &'static [u8],
        cancel: CancellationToken,
    ) {
        let mut backoff = build_backoff();
        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.dial(remote, alpn) => res,
            };
            match attempt {
                Ok(conn) => {
                    backoff = build_backoff();
                    self.run_connected(conn, remote, alpn, &cancel).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                }
                Err(DialError::InvalidKey { .. }) => {
                    warn!("cannot dial, not a valid overlay key");
                    break;
                }
                Err(err) => debug!("dial failed: {err:#}"),
            }
            let delay = backoff.next().unwrap_or(Duration::from_secs(16));
            trace!(?delay, "redialing after delay");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = time::sleep(delay) => {}
            }
        }
        debug!("dial loop stopped");
    }

    async fn dial(&self, remote: PeerKey, alpn: &'static [u8]) -> Result<Connection, DialError> {
        let node_id = PublicKey::from_bytes(remote.as_bytes())
            .ok()
            .context(InvalidKeySnafu)?;
        self.endpoint
            .connect(NodeAddr::new(node_id), alpn)
            .await
            .context(ConnectSnafu)
    }

    async fn run_connected(
        &self,
        conn: Connection,
        remote: PeerKey,
        alpn: &'static [u8],
        cancel: &CancellationToken,
    ) {
        let (send, recv) = match conn.open_bi().await.context(OpenStreamSnafu) {
            Ok(streams) => streams,
            Err(err) => {
                debug!("{err:#}");
                return;
            }
        };
        let socket_cancel = cancel.child_token();
        self.subscribers.emit(PeerSocket::new(
            remote,
            alpn.to_vec(),
            tokio::io::join(recv, send),
            socket_cancel.clone(),
        ));
        tokio::select! {
            _ = socket_cancel.cancelled() => conn.close(0u32.into(), b"closed"),
            err = conn.closed() => {
                debug!("connection closed: {err:#}");
                socket_cancel.cancel();
            }
        }
    }
}

fn build_backoff() -> impl Backoff {
    ExponentialBuilder::new()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(16))
        .with_jitter()
        .without_max_times()
        .build()
}

impl Transport for IrohTransport {
    fn public_key(&self) -> PeerKey {
        self.inner.key
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerSocket> {
        self.inner.subscribers.subscribe()
    }

    fn join_peer(&self, key: PeerKey, alpn: &'static [u8]) {
        let mut joins = self.inner.joins.lock().expect("poisoned");
        joins.join(key, alpn, || {
            let cancel = self.inner.cancel.child_token();
            self.inner.tasks.spawn(
                self.inner.clone().dial_loop(key, alpn, cancel.clone()).instrument(info_span!(
                    "iroh-dial",
                    remote = %key.fmt_short(),
                    alpn = %String::from_utf8_lossy(alpn),
                )),
            );
            cancel
        });
    }

    fn leave_peer(&self, key: PeerKey, alpn: &'static [u8]) {
        let left = self.inner.joins.lock().expect("poisoned").leave(key, alpn);
        if let Some(cancel) = left {
            cancel.cancel();
        }
    }

    fn shutdown(&self) -> BoxFuture<()> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.cancel.cancel();
            inner.subscribers.clear();
            inner.joins.lock().expect("poisoned").drain().for_each(drop);
            inner.tasks.close();
            inner.endpoint.close().await;
            inner.tasks.wait().await;
        })
    }
}
