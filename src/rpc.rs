//! Named-method request/response over one [`PeerSocket`].
//!
//! Frames are length delimited and postcard encoded. Both sides start by sending an `Open`
//! frame naming the protocol; the channel is open once the remote's `Open` arrived with the
//! same name. Requests are multiplexed by id and handlers run concurrently.

use std::{collections::HashMap, future::Future, sync::Arc};

use bytes::Bytes;
use n0_future::{SinkExt, StreamExt, boxed::BoxFuture, task::AbortOnDropHandle};
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinSet,
};
use tokio_util::{
    codec::{Framed, LengthDelimitedCodec},
    sync::CancellationToken,
};
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::{
    key::PeerKey,
    transport::{BoxedIo, PeerSocket},
};

/// Largest frame accepted from a peer.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Capacity of the request queue of a channel.
const REQUEST_QUEUE: usize = 32;

/// Errors of an [`RpcChannel`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum RpcError {
    #[snafu(display("Channel closed"))]
    Closed {},
    #[snafu(display("Remote error: {message}"))]
    Remote { message: String },
    #[snafu(display("Protocol mismatch: expected {expected}, remote speaks {actual}"))]
    ProtocolMismatch { expected: String, actual: String },
    #[snafu(display("Socket is already used by another channel"))]
    SocketClaimed {},
    #[snafu(display("Request before the channel was opened"))]
    NotOpened {},
    #[snafu(display("Failed to encode frame"))]
    Encode { source: postcard::Error },
    #[snafu(display("Failed to decode frame"))]
    Decode { source: postcard::Error },
    #[snafu(display("Socket I/O failed"))]
    Io { source: std::io::Error },
}

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Open {
        protocol: String,
    },
    Request {
        id: u64,
        method: String,
        payload: Vec<u8>,
    },
    Response {
        id: u64,
        result: Result<Vec<u8>, String>,
    },
}

/// Lifecycle of an [`RpcChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for the remote's open handshake.
    Opening,
    /// Both sides opened the protocol.
    Open,
    /// The channel or its socket closed.
    Closed,
}

type Handler = Arc<dyn Fn(Bytes) -> BoxFuture<Result<Bytes, String>> + Send + Sync>;

/// Configures the methods a channel answers before spawning it.
pub struct RpcChannelBuilder {
    protocol: String,
    handlers: HashMap<String, Handler>,
}

impl std::fmt::Debug for RpcChannelBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannelBuilder")
            .field("protocol", &self.protocol)
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RpcChannelBuilder {
    /// Answers requests for `method` with `handler`.
    ///
    /// An `Err` returned by the handler reaches the caller as [`RpcError::Remote`].
    pub fn respond<F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, String>> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |payload| -> BoxFuture<Result<Bytes, String>> {
                Box::pin(handler(payload))
            });
        self.handlers.insert(method.to_string(), handler);
        self
    }

    /// Claims the byte stream of `socket` and starts the channel.
    pub fn spawn(self, socket: &PeerSocket) -> Result<RpcChannel, RpcError> {
        let io = socket.take_io().ok_or_else(|| SocketClaimedSnafu.build())?;
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_SIZE)
            .new_codec();
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let (state_tx, state_rx) = watch::channel(ChannelState::Opening);
        let cancel = socket.cancel_token();
        let remote = socket.remote();
        let span = debug_span!(
            "rpc",
            remote = %remote.fmt_short(),
            protocol = %self.protocol,
        );
        let actor = Actor {
            protocol: self.protocol,
            framed: Framed::new(io, codec),
            handlers: self.handlers,
            pending: HashMap::new(),
            next_id: 0,
            opened: false,
            msgs: rx,
            state: state_tx,
            cancel: cancel.clone(),
            handler_tasks: JoinSet::new(),
        };
        let task = tokio::spawn(actor.run().instrument(span));
        Ok(RpcChannel {
            inner: Arc::new(ChannelInner {
                remote,
                tx,
                state: state_rx,
                cancel,
                _task: AbortOnDropHandle::new(task),
            }),
        })
    }
}

/// A request/response channel to one peer.
///
/// Clones share the channel. It closes when [`RpcChannel::close`] is called, when the socket
/// closes, or when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct RpcChannel {
    inner: Arc<ChannelInner>,
}

#[derive(Debug)]
struct ChannelInner {
    remote: PeerKey,
    tx: mpsc::Sender<ActorMessage>,
    state: watch::Receiver<ChannelState>,
    cancel: CancellationToken,
    _task: AbortOnDropHandle<()>,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl RpcChannel {
    /// Starts configuring a channel speaking `protocol`.
    pub fn builder(protocol: impl Into<String>) -> RpcChannelBuilder {
        RpcChannelBuilder {
            protocol: protocol.into(),
            handlers: HashMap::new(),
        }
    }

    /// The peer at the other end.
    pub fn remote(&self) -> PeerKey {
        self.inner.remote
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    /// Waits for the open handshake to complete.
    pub async fn opened(&self) -> Result<(), RpcError> {
        let mut state = self.inner.state.clone();
        let state = state
            .wait_for(|state| *state != ChannelState::Opening)
            .await
            .map(|state| *state)
            .unwrap_or(ChannelState::Closed);
        match state {
            ChannelState::Open => Ok(()),
            _ => Err(ClosedSnafu.build()),
        }
    }

    /// Calls `method` on the remote and waits for its response.
    pub async fn request(&self, method: &str, payload: Bytes) -> Result<Bytes, RpcError> {
        let (reply, reply_rx) = oneshot::channel();
        self.inner
            .tx
            .send(ActorMessage::Request {
                method: method.to_string(),
                payload,
                reply,
            })
            .await
            .map_err(|_| ClosedSnafu.build())?;
        reply_rx.await.map_err(|_| ClosedSnafu.build())?
    }

    /// Closes the channel and its socket. Pending requests fail with [`RpcError::Closed`].
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    /// Whether the channel is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }
}

#[derive(Debug)]
enum ActorMessage {
    Request {
        method: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<Bytes, RpcError>>,
    },
}

struct Actor {
    protocol: String,
    framed: Framed<BoxedIo, LengthDelimitedCodec>,
    handlers: HashMap<String, Handler>,
    pending: HashMap<u64, oneshot::Sender<Result<Bytes, RpcError>>>,
    next_id: u64,
    opened: bool,
    msgs: mpsc::Receiver<ActorMessage>,
    state: watch::Sender<ChannelState>,
    cancel: CancellationToken,
    handler_tasks: JoinSet<(u64, Result<Bytes, String>)>,
}

impl Actor {
    async fn run(mut self) {
        match self.run_inner().await {
            Ok(()) => trace!("channel closed"),
            Err(err @ RpcError::ProtocolMismatch { .. }) => warn!("{err}"),
            Err(err) => debug!("channel failed: {err:#}"),
        }
        self.state.send_replace(ChannelState::Closed);
        self.cancel.cancel();
        self.handler_tasks.abort_all();
        // dropping the pending senders fails outstanding requests with `Closed`
        self.pending.clear();
    }

    async fn run_inner(&mut self) -> Result<(), RpcError> {
        self.send(Frame::Open {
            protocol: self.protocol.clone(),
        })
        .await?;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                frame = self.framed.next() => match frame {
                    Some(frame) => {
                        let frame = frame.context(IoSnafu)?;
                        let frame: Frame = postcard::from_bytes(&frame).context(DecodeSnafu)?;
                        self.handle_frame(frame).await?;
                    }
                    None => return Ok(()),
                },
                Some(msg) = self.msgs.recv() => self.handle_message(msg).await?,
                Some(res) = self.handler_tasks.join_next(), if !self.handler_tasks.is_empty() => {
                    let Ok((id, result)) = res else {
                        continue;
                    };
                    self.send(Frame::Response {
                        id,
                        result: result.map(|bytes| bytes.to_vec()),
                    })
                    .await?;
                }
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), RpcError> {
        let bytes = postcard::to_stdvec(&frame).context(EncodeSnafu)?;
        self.framed.send(Bytes::from(bytes)).await.context(IoSnafu)
    }

    async fn handle_message(&mut self, msg: ActorMessage) -> Result<(), RpcError> {
        match msg {
            ActorMessage::Request {
                method,
                payload,
                reply,
            } => {
                let id = self.next_id;
                self.next_id += 1;
                trace!(id, %method, "request");
                self.pending.insert(id, reply);
                self.send(Frame::Request {
                    id,
                    method,
                    payload: payload.to_vec(),
                })
                .await
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), RpcError> {
        match frame {
            Frame::Open { protocol } => {
                snafu::ensure!(
                    protocol == self.protocol,
                    ProtocolMismatchSnafu {
                        expected: self.protocol.clone(),
                        actual: protocol,
                    }
                );
                if !self.opened {
                    self.opened = true;
                    self.state.send_replace(ChannelState::Open);
                    trace!("opened");
                }
            }
            Frame::Request {
                id,
                method,
                payload,
            } => {
                snafu::ensure!(self.opened, NotOpenedSnafu);
                match self.handlers.get(&method) {
                    Some(handler) => {
                        let fut = handler(Bytes::from(payload));
                        self.handler_tasks.spawn(async move { (id, fut.await) });
                    }
                    None => {
                        debug!(id, %method, "unknown method");
                        self.send(Frame::Response {
                            id,
                            result: Err(format!("unknown method {method}")),
                        })
                        .await?;
                    }
                }
            }
            Frame::Response { id, result } => match self.pending.remove(&id) {
                Some(reply) => {
                    let result = result
                        .map(Bytes::from)
                        .map_err(|message| RemoteSnafu { message }.build());
                    reply.send(result).ok();
                }
                None => debug!(id, "response for unknown request"),
            },
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use n0_future::time::Duration;
    use n0_snafu::{Result, ResultExt};
    use tracing_test::traced_test;

    use super::*;

    fn socket_pair() -> (PeerSocket, PeerSocket) {
        let (a, b) = tokio::io::duplex(1024);
        (
            PeerSocket::new(
                PeerKey::from_bytes([2; 32]),
                b"rpc".to_vec(),
                a,
                CancellationToken::new(),
            ),
            PeerSocket::new(
                PeerKey::from_bytes([1; 32]),
                b"rpc".to_vec(),
                b,
                CancellationToken::new(),
            ),
        )
    }

    fn echo_server(socket: &PeerSocket) -> Result<RpcChannel> {
        let channel = RpcChannel::builder("test")
            .respond("echo", |payload| async move { Ok(payload) })
            .respond("fail", |_| async move { Err("nope".to_string()) })
            .respond("hang", |_| std::future::pending())
            .spawn(socket)?;
        Ok(channel)
    }

    #[tokio::test]
    #[traced_test]
    async fn request_response() -> Result {
        let (a, b) = socket_pair();
        let _server = echo_server(&b)?;
        let client = RpcChannel::builder("test").spawn(&a)?;
        client.opened().await?;
        assert_eq!(client.state(), ChannelState::Open);
        assert_eq!(client.remote(), PeerKey::from_bytes([2; 32]));

        let big = Bytes::from(vec![7u8; 100_000]);
        let (small, big_echo) = tokio::join!(
            client.request("echo", Bytes::from_static(b"hi")),
            client.request("echo", big.clone()),
        );
        assert_eq!(small?, Bytes::from_static(b"hi"));
        assert_eq!(big_echo?, big);

        let err = client.request("fail", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote { ref message, .. } if message == "nope"));

        let err = client.request("missing", Bytes::new()).await.unwrap_err();
        assert!(
            matches!(err, RpcError::Remote { ref message, .. } if message.contains("unknown method"))
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn close_fails_pending_requests() -> Result {
        let (a, b) = socket_pair();
        let server = echo_server(&b)?;
        let client = RpcChannel::builder("test").spawn(&a)?;
        client.opened().await?;

        let request = tokio::spawn({
            let client = client.clone();
            async move { client.request("hang", Bytes::new()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.close();
        let res = request.await.e()?;
        assert!(matches!(res, Err(RpcError::Closed { .. })), "{res:?}");

        client.closed().await;
        assert!(a.is_closed());
        assert!(matches!(
            client.request("echo", Bytes::new()).await,
            Err(RpcError::Closed { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn protocol_mismatch_never_opens() -> Result {
        let (a, b) = socket_pair();
        let _server = echo_server(&b)?;
        let client = RpcChannel::builder("other").spawn(&a)?;
        assert!(matches!(client.opened().await, Err(RpcError::Closed { .. })));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn socket_is_claimed_once() -> Result {
        let (a, _b) = socket_pair();
        let _first = RpcChannel::builder("test").spawn(&a)?;
        let second = RpcChannel::builder("test").spawn(&a);
        assert!(matches!(second, Err(RpcError::SocketClaimed { .. })));
        Ok(())
    }
}
