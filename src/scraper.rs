//! Keeps a request channel to one scrape target.
//!
//! A [`ScraperClient`] asks the transport to stay connected to its target and turns every
//! socket from that target into the current [`RpcChannel`]. Each accepted socket starts a
//! new generation; events of superseded generations never touch the state.

use std::sync::Arc;

use bytes::Bytes;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, trace};

use crate::{
    METRICS_ALPN, METRICS_METHOD, METRICS_PROTOCOL,
    key::PeerKey,
    metrics::Metrics,
    rpc::{RpcChannel, RpcError},
    transport::{PeerSocket, Transport},
    wire::{DecodeError, MetricsResponse, WireMessage},
};

/// Errors when fetching metrics from a scrape target.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum FetchError {
    #[snafu(display("Not connected to the target"))]
    NotConnected {},
    #[snafu(display("Client is closed"))]
    ClientClosed {},
    #[snafu(display("Metrics request failed"))]
    Rpc { source: RpcError },
    #[snafu(display("Invalid metrics response"))]
    Decode { source: DecodeError },
}

/// Connection state of a [`ScraperClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No socket to the target.
    Idle,
    /// A socket was accepted and its channel is opening.
    Connecting,
    /// The channel is open.
    Open,
    /// The client is shutting down.
    Closing,
}

/// A client for the metrics protocol of one target.
#[derive(Debug)]
pub struct ScraperClient {
    target: PeerKey,
    msgs: mpsc::Sender<ActorMessage>,
    state: watch::Receiver<ConnState>,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl ScraperClient {
    /// Starts tracking `target`. Must be called from within a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, target: PeerKey, metrics: Arc<Metrics>) -> Self {
        // subscribe before joining so the first socket is not missed
        let sockets = transport.subscribe();
        transport.join_peer(target, METRICS_ALPN);

        let (msgs_tx, msgs_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(ConnState::Idle);
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let actor = Actor {
            target,
            transport,
            sockets,
            msgs: msgs_rx,
            state: state_tx,
            generation: 0,
            current: None,
            transitions: JoinSet::new(),
            metrics,
        };
        tokio::spawn(
            actor
                .run(cancel.clone(), done.clone())
                .instrument(debug_span!("scraper", target = %target.fmt_short())),
        );
        Self {
            target,
            msgs: msgs_tx,
            state: state_rx,
            cancel,
            done,
        }
    }

    /// The target this client scrapes.
    pub fn target(&self) -> PeerKey {
        self.target
    }

    /// The current connection state.
    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    /// Whether [`Self::close`] was called.
    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits until a channel to the target is open.
    pub async fn wait_open(&self) -> Result<(), FetchError> {
        let mut state = self.state.clone();
        let state = state
            .wait_for(|state| matches!(state, ConnState::Open | ConnState::Closing))
            .await
            .map(|state| *state)
            .unwrap_or(ConnState::Closing);
        snafu::ensure!(state == ConnState::Open, ClientClosedSnafu);
        Ok(())
    }

    /// Fetches the target's metrics over the current channel.
    ///
    /// Fails with [`FetchError::NotConnected`] if there is no channel. There is no retry and
    /// no timeout; a channel closing mid-call fails the call.
    pub async fn fetch_metrics(&self) -> Result<MetricsResponse, FetchError> {
        let channel = self.channel().await?.context(NotConnectedSnafu)?;
        channel.opened().await.context(RpcSnafu)?;
        let bytes = channel
            .request(METRICS_METHOD, Bytes::new())
            .await
            .context(RpcSnafu)?;
        MetricsResponse::decode(&bytes).context(DecodeSnafu)
    }

    async fn channel(&self) -> Result<Option<RpcChannel>, FetchError> {
        let (reply, reply_rx) = oneshot::channel();
        self.msgs
            .send(ActorMessage::GetChannel { reply })
            .await
            .map_err(|_| ClientClosedSnafu.build())?;
        reply_rx.await.map_err(|_| ClientClosedSnafu.build())
    }

    /// Stops tracking the target and closes the current channel.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.done.cancelled().await;
    }
}

impl Drop for ScraperClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug)]
enum ActorMessage {
    GetChannel {
        reply: oneshot::Sender<Option<RpcChannel>>,
    },
}

#[derive(Debug)]
enum Transition {
    Opened(u64),
    Closed(u64),
}

struct Current {
    generation: u64,
    channel: RpcChannel,
}

struct Actor {
    target: PeerKey,
    transport: Arc<dyn Transport>,
    sockets: mpsc::UnboundedReceiver<PeerSocket>,
    msgs: mpsc::Receiver<ActorMessage>,
    state: watch::Sender<ConnState>,
    generation: u64,
    current: Option<Current>,
    transitions: JoinSet<Transition>,
    metrics: Arc<Metrics>,
}

impl Actor {
    async fn run(mut self, cancel: CancellationToken, done: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(transition) = self.transitions.join_next(), if !self.transitions.is_empty() => {
                    if let Ok(transition) = transition {
                        self.handle_transition(transition);
                    }
                }
                socket = self.sockets.recv() => match socket {
                    Some(socket) => self.handle_socket(socket),
                    None => {
                        debug!("transport closed");
                        break;
                    }
                },
                Some(msg) = self.msgs.recv() => match msg {
                    ActorMessage::GetChannel { reply } => {
                        let channel = self.current.as_ref().map(|current| current.channel.clone());
                        reply.send(channel).ok();
                    }
                },
            }
        }
        self.state.send_replace(ConnState::Closing);
        if let Some(current) = self.current.take() {
            current.channel.close();
        }
        self.transitions.abort_all();
        self.transport.leave_peer(self.target, METRICS_ALPN);
        debug!("closed");
        done.cancel();
    }

    fn handle_socket(&mut self, socket: PeerSocket) {
        if socket.alpn() != METRICS_ALPN {
            return;
        }
        if socket.remote() != self.target {
            debug!(remote = %socket.remote().fmt_short(), "connection-ignore");
            self.metrics.scraper_conns_ignored.inc();
            return;
        }
        let channel = match RpcChannel::builder(METRICS_PROTOCOL).spawn(&socket) {
            Ok(channel) => channel,
            Err(err) => {
                // another client for the same target claimed the socket
                debug!("connection-error: {err:#}");
                return;
            }
        };
        self.generation += 1;
        let generation = self.generation;
        info!(generation, "connection-open");
        self.metrics.scraper_conns_accepted.inc();
        if let Some(previous) = self.current.replace(Current {
            generation,
            channel: channel.clone(),
        }) {
            trace!(previous = previous.generation, "superseded");
            previous.channel.close();
        }
        self.state.send_replace(ConnState::Connecting);

        let opening = channel.clone();
        self.transitions.spawn(async move {
            match opening.opened().await {
                Ok(()) => Transition::Opened(generation),
                Err(_) => Transition::Closed(generation),
            }
        });
        self.transitions.spawn(async move {
            channel.closed().await;
            Transition::Closed(generation)
        });
    }

    fn handle_transition(&mut self, transition: Transition) {
        let current = self.current.as_ref().map(|current| current.generation);
        match transition {
            Transition::Opened(generation) if current == Some(generation) => {
                trace!(generation, "opened");
                self.state.send_replace(ConnState::Open);
            }
            Transition::Closed(generation) if current == Some(generation) => {
                info!(generation, "connection-close");
                self.metrics.scraper_conns_closed.inc();
                if let Some(current) = self.current.take() {
                    current.channel.close();
                }
                self.state.send_replace(ConnState::Idle);
            }
            transition => trace!(?transition, ?current, "stale transition"),
        }
    }
}
