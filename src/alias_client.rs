//! The peer side of the registration protocol.

use std::sync::Arc;

use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::{
    ALIAS_METHOD, REGISTER_ALPN, REGISTER_PROTOCOL,
    key::{PeerKey, SharedSecret},
    rpc::{RpcChannel, RpcError},
    transport::{PeerSocket, Transport},
    wire::{DecodeError, RegisterRequest, RegisterResponse, WireMessage},
};

/// Errors when registering an alias with a bridge.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum RegisterError {
    #[snafu(display("Transport closed before the bridge was reached"))]
    TransportClosed {},
    #[snafu(display("Registration request failed"))]
    Rpc { source: RpcError },
    #[snafu(display("Invalid registration response"))]
    Decode { source: DecodeError },
}

/// Registers aliases with one bridge.
#[derive(Debug, Clone)]
pub struct AliasClient {
    transport: Arc<dyn Transport>,
    bridge: PeerKey,
    secret: SharedSecret,
}

impl AliasClient {
    /// Creates a client for the bridge with identity `bridge`.
    pub fn new(transport: Arc<dyn Transport>, bridge: PeerKey, secret: SharedSecret) -> Self {
        Self {
            transport,
            bridge,
            secret,
        }
    }

    /// Asks the bridge to scrape `target` under `alias`.
    ///
    /// Waits until the bridge is reachable; wrap in a timeout to bound the wait. A refused
    /// registration is a [`RegisterResponse::Failure`], not an error.
    #[instrument(skip(self), fields(bridge = %self.bridge.fmt_short()))]
    pub async fn register(
        &self,
        alias: &str,
        target: PeerKey,
    ) -> Result<RegisterResponse, RegisterError> {
        let mut sockets = self.transport.subscribe();
        self.transport.join_peer(self.bridge, REGISTER_ALPN);
        let res = self.register_inner(&mut sockets, alias, target).await;
        self.transport.leave_peer(self.bridge, REGISTER_ALPN);
        res
    }

    async fn register_inner(
        &self,
        sockets: &mut mpsc::UnboundedReceiver<PeerSocket>,
        alias: &str,
        target: PeerKey,
    ) -> Result<RegisterResponse, RegisterError> {
        let socket = loop {
            match sockets.recv().await {
                Some(socket) if socket.remote() == self.bridge && socket.alpn() == REGISTER_ALPN => {
                    break socket;
                }
                Some(_) => continue,
                None => return Err(TransportClosedSnafu.build()),
            }
        };
        let channel = RpcChannel::builder(REGISTER_PROTOCOL)
            .spawn(&socket)
            .context(RpcSnafu)?;
        channel.opened().await.context(RpcSnafu)?;
        let request = RegisterRequest {
            secret: self.secret.clone(),
            alias: alias.to_string(),
            target,
        };
        let res = channel.request(ALIAS_METHOD, request.encode()).await;
        channel.close();
        let response = RegisterResponse::decode(&res.context(RpcSnafu)?).context(DecodeSnafu)?;
        debug!(?response, "registered");
        Ok(response)
    }
}
