//! The scraped peer's side of the metrics protocol.

use std::{future::Future, sync::Arc};

use bytes::Bytes;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, warn};

use crate::{
    METRICS_ALPN, METRICS_METHOD, METRICS_PROTOCOL,
    rpc::RpcChannel,
    transport::{PeerSocket, Transport},
    wire::{MetricsResponse, WireMessage},
};

/// Answers metrics requests from bridges with the output of a collect function.
#[derive(Debug)]
pub struct MetricsResponder {
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl MetricsResponder {
    /// Starts answering metrics requests on `transport`.
    ///
    /// `collect` returns the metrics text, or an error message that is passed on to the
    /// scraper. Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(transport: Arc<dyn Transport>, collect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let mut sockets = transport.subscribe();
        let collect = Arc::new(collect);
        let task_cancel = cancel.clone();
        let task_done = done.clone();
        let me = transport.public_key();
        tokio::spawn(
            async move {
                let mut channels = JoinSet::new();
                loop {
                    tokio::select! {
                        _ = task_cancel.cancelled() => break,
                        socket = sockets.recv() => match socket {
                            Some(socket) => {
                                if let Some(channel) = serve(&socket, collect.clone()) {
                                    let cancel = task_cancel.clone();
                                    channels.spawn(async move {
                                        tokio::select! {
                                            _ = channel.closed() => {}
                                            _ = cancel.cancelled() => channel.close(),
                                        }
                                    });
                                }
                            }
                            None => break,
                        },
                        Some(_) = channels.join_next(), if !channels.is_empty() => {}
                    }
                }
                task_cancel.cancel();
                while channels.join_next().await.is_some() {}
                task_done.cancel();
            }
            .instrument(debug_span!("metrics-responder", me = %me.fmt_short())),
        );
        Self {
            transport,
            cancel,
            done,
        }
    }

    /// Stops answering and shuts the transport down.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.done.cancelled().await;
        self.transport.shutdown().await;
    }
}

impl Drop for MetricsResponder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn serve<F, Fut>(socket: &PeerSocket, collect: Arc<F>) -> Option<RpcChannel>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    if socket.alpn() != METRICS_ALPN {
        return None;
    }
    let remote = socket.remote();
    let channel = RpcChannel::builder(METRICS_PROTOCOL)
        .respond(METRICS_METHOD, move |_| {
            let collect = collect.clone();
            async move {
                let response = match collect().await {
                    Ok(metrics) => MetricsResponse::Success { metrics },
                    Err(error_message) => MetricsResponse::Failure { error_message },
                };
                Ok::<Bytes, String>(response.encode())
            }
        })
        .spawn(socket);
    match channel {
        Ok(channel) => {
            debug!(remote = %remote.fmt_short(), "serving metrics");
            Some(channel)
        }
        Err(err) => {
            warn!(remote = %remote.fmt_short(), "cannot serve metrics: {err:#}");
            None
        }
    }
}
