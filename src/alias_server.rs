//! Serves the alias registration protocol.
//!
//! Every inbound `register-alias` socket gets an [`RpcChannel`] answering the `alias` method.
//! A request is only forwarded to the [`PutAlias`] callback if it carries the shared secret.

use std::{future::Future, sync::Arc};

use bytes::Bytes;
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    ALIAS_METHOD, REGISTER_ALPN, REGISTER_PROTOCOL,
    key::{PeerKey, SharedSecret},
    metrics::Metrics,
    rpc::RpcChannel,
    transport::{PeerSocket, Transport},
    wire::{RegisterRequest, RegisterResponse, WireMessage},
};

/// Error message returned for a wrong secret.
pub const UNAUTHORISED: &str = "unauthorised";

/// Applies an authorized registration.
pub trait PutAlias: Send + Sync + 'static {
    /// Error of a failed registration. Only logged, never sent to the peer.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Maps `alias` to `target`. Returns whether the mapping changed.
    fn put_alias(
        &self,
        alias: String,
        target: PeerKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;
}

/// Generates a correlation id for logs.
pub(crate) fn correlation_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// The registration server.
#[derive(Debug)]
pub struct AliasRpcServer {
    cancel: CancellationToken,
    done: CancellationToken,
}

impl AliasRpcServer {
    /// Starts answering registrations on `transport`. Must be called from within a tokio
    /// runtime.
    pub fn spawn<P: PutAlias>(
        transport: Arc<dyn Transport>,
        secret: SharedSecret,
        put: P,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let actor = Actor {
            sockets: transport.subscribe(),
            handler: Arc::new(Handler {
                secret,
                put,
                metrics,
            }),
            connections: JoinSet::new(),
        };
        let me = transport.public_key();
        tokio::spawn(
            actor
                .run(cancel.clone(), done.clone())
                .instrument(info_span!("alias-server", me = %me.fmt_short())),
        );
        Self { cancel, done }
    }

    /// Stops accepting registrations and closes all registration channels.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.done.cancelled().await;
    }
}

impl Drop for AliasRpcServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Actor<P> {
    sockets: mpsc::UnboundedReceiver<PeerSocket>,
    handler: Arc<Handler<P>>,
    connections: JoinSet<()>,
}

impl<P: PutAlias> Actor<P> {
    async fn run(mut self, cancel: CancellationToken, done: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                socket = self.sockets.recv() => match socket {
                    Some(socket) => self.handle_socket(socket, &cancel),
                    None => break,
                },
                Some(_) = self.connections.join_next(), if !self.connections.is_empty() => {}
            }
        }
        cancel.cancel();
        while self.connections.join_next().await.is_some() {}
        debug!("stopped");
        done.cancel();
    }

    fn handle_socket(&mut self, socket: PeerSocket, cancel: &CancellationToken) {
        if socket.alpn() != REGISTER_ALPN {
            return;
        }
        let uid = correlation_id();
        let remote = socket.remote();
        let span = info_span!("conn", %uid, remote = %remote.fmt_short());
        let handler = self.handler.clone();
        let conn_uid = uid.clone();
        let channel = RpcChannel::builder(REGISTER_PROTOCOL)
            .respond(ALIAS_METHOD, move |payload| {
                let handler = handler.clone();
                let uid = conn_uid.clone();
                async move { handler.handle(&uid, remote, payload).await }
            })
            .spawn(&socket);
        let channel = match channel {
            Ok(channel) => channel,
            Err(err) => {
                span.in_scope(|| warn!("socket-error: {err:#}"));
                return;
            }
        };
        span.in_scope(|| debug!("connection-open"));
        let cancel = cancel.clone();
        self.connections.spawn(
            async move {
                tokio::select! {
                    _ = channel.closed() => debug!("connection-close"),
                    _ = cancel.cancelled() => channel.close(),
                }
            }
            .instrument(span),
        );
    }
}

struct Handler<P> {
    secret: SharedSecret,
    put: P,
    metrics: Arc<Metrics>,
}

impl<P: PutAlias> Handler<P> {
    async fn handle(&self, uid: &str, remote: PeerKey, payload: Bytes) -> Result<Bytes, String> {
        self.metrics.register_requests.inc();
        let request = match RegisterRequest::decode(&payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(%uid, "malformed registration: {err:#}");
                self.metrics.register_malformed.inc();
                return Err(err.to_string());
            }
        };
        Ok(self.register(uid, remote, request).await.encode())
    }

    async fn register(&self, uid: &str, remote: PeerKey, request: RegisterRequest) -> RegisterResponse {
        let RegisterRequest {
            secret,
            alias,
            target,
        } = request;
        if !self.secret.matches(secret.as_bytes()) {
            warn!(%uid, remote = %remote.fmt_short(), %alias, "unauthorised registration");
            self.metrics.register_unauthorised.inc();
            return RegisterResponse::Failure {
                error_message: UNAUTHORISED.to_string(),
            };
        }
        let request_id = correlation_id();
        info!(%uid, %request_id, remote = %remote.fmt_short(), %alias, %target, "alias-request");
        match self.put.put_alias(alias.clone(), target).await {
            Ok(updated) => {
                info!(%uid, %request_id, %alias, %target, updated, "register-success");
                self.metrics.register_success.inc();
                RegisterResponse::Success { updated }
            }
            Err(err) => {
                warn!(%uid, %request_id, %alias, "register-error: {err:#}");
                self.metrics.register_failures.inc();
                RegisterResponse::Failure {
                    error_message: format!("registration failed (correlation id {request_id})"),
                }
            }
        }
    }
}
