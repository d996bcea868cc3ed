//! The overlay transport seam.
//!
//! A [`Transport`] hands out [`PeerSocket`]s whenever a connection to or from a peer is
//! established, and keeps dialing the peers it was asked to join. Everything above this
//! module only reacts to sockets; reconnecting is the transport's job.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use n0_future::boxed::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::key::PeerKey;

pub mod iroh;
pub mod memory;

/// A byte stream carried by a [`PeerSocket`].
pub trait SocketIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> SocketIo for T {}

/// A boxed [`SocketIo`].
pub type BoxedIo = Box<dyn SocketIo>;

/// The overlay network as seen by the bridge.
pub trait Transport: fmt::Debug + Send + Sync + 'static {
    /// Our own overlay identity.
    fn public_key(&self) -> PeerKey;

    /// Receives every socket established from now on, inbound and outbound.
    ///
    /// Subscribers that are not interested in a socket simply drop it. A socket whose byte
    /// stream was never claimed is closed once every subscriber dropped it.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerSocket>;

    /// Keeps a connection to `key` speaking `alpn` alive until a matching [`Self::leave_peer`].
    ///
    /// Joins are reference counted.
    fn join_peer(&self, key: PeerKey, alpn: &'static [u8]);

    /// Releases one [`Self::join_peer`].
    fn leave_peer(&self, key: PeerKey, alpn: &'static [u8]);

    /// Closes all sockets and stops dialing.
    fn shutdown(&self) -> BoxFuture<()>;
}

/// An established connection to a peer, carrying one byte stream.
///
/// Cloning is cheap. The byte stream can be claimed exactly once, by [`PeerSocket::take_io`];
/// whoever claims it is responsible for closing the socket when done.
#[derive(Clone)]
pub struct PeerSocket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    remote: PeerKey,
    alpn: Vec<u8>,
    io: Mutex<Option<BoxedIo>>,
    cancel: CancellationToken,
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        let unclaimed = self.io.get_mut().map(|io| io.is_some()).unwrap_or(true);
        if unclaimed {
            trace!(remote = %self.remote.fmt_short(), "dropping unclaimed socket");
            self.cancel.cancel();
        }
    }
}

impl fmt::Debug for PeerSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSocket")
            .field("remote", &self.inner.remote.fmt_short())
            .field("alpn", &String::from_utf8_lossy(&self.inner.alpn))
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerSocket {
    pub(crate) fn new(
        remote: PeerKey,
        alpn: Vec<u8>,
        io: impl SocketIo,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                remote,
                alpn,
                io: Mutex::new(Some(Box::new(io))),
                cancel,
            }),
        }
    }

    /// The identity of the remote peer.
    pub fn remote(&self) -> PeerKey {
        self.inner.remote
    }

    /// The protocol negotiated for this socket.
    pub fn alpn(&self) -> &[u8] {
        &self.inner.alpn
    }

    /// Claims the byte stream. Returns `None` if it was claimed before.
    pub fn take_io(&self) -> Option<BoxedIo> {
        self.inner.io.lock().expect("poisoned").take()
    }

    /// Closes the socket.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        drop(self.take_io());
    }

    /// Whether the socket was closed by either side.
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once the socket is closed.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}

/// Fans sockets out to subscribers, pruning subscribers that went away.
#[derive(Debug, Default, Clone)]
pub(crate) struct Subscribers {
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<PeerSocket>>>>,
}

impl Subscribers {
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerSocket> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().expect("poisoned").push(tx);
        rx
    }

    pub(crate) fn emit(&self, socket: PeerSocket) {
        self.senders
            .lock()
            .expect("poisoned")
            .retain(|tx| tx.send(socket.clone()).is_ok());
    }

    pub(crate) fn clear(&self) {
        self.senders.lock().expect("poisoned").clear();
    }
}

/// Reference counts of joined peers.
#[derive(Debug)]
pub(crate) struct Joins<T> {
    peers: HashMap<(PeerKey, &'static [u8]), (usize, T)>,
}

impl<T> Default for Joins<T> {
    fn default() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }
}

impl<T> Joins<T> {
    /// Increments the count, creating the value with `f` on the first join.
    pub(crate) fn join(&mut self, key: PeerKey, alpn: &'static [u8], f: impl FnOnce() -> T) {
        self.peers
            .entry((key, alpn))
            .and_modify(|(count, _)| *count += 1)
            .or_insert_with(|| (1, f()));
    }

    /// Decrements the count, returning the value when it reaches zero.
    pub(crate) fn leave(&mut self, key: PeerKey, alpn: &'static [u8]) -> Option<T> {
        let (count, _) = self.peers.get_mut(&(key, alpn))?;
        *count -= 1;
        if *count == 0 {
            self.peers.remove(&(key, alpn)).map(|(_, value)| value)
        } else {
            None
        }
    }

    pub(crate) fn get(&self, key: PeerKey, alpn: &'static [u8]) -> Option<&T> {
        self.peers.get(&(key, alpn)).map(|(_, value)| value)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (PeerKey, &'static [u8], &T)> + '_ {
        self.peers
            .iter()
            .map(|((key, alpn), (_, value))| (*key, *alpn, value))
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.peers.drain().map(|(_, (_, value))| value)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    fn socket() -> (PeerSocket, CancellationToken) {
        let cancel = CancellationToken::new();
        let (io, _other) = duplex(64);
        let socket = PeerSocket::new(
            PeerKey::from_bytes([1; 32]),
            b"test".to_vec(),
            io,
            cancel.clone(),
        );
        (socket, cancel)
    }

    #[test]
    fn io_is_claimed_once() {
        let (socket, cancel) = socket();
        let clone = socket.clone();
        assert!(socket.take_io().is_some());
        assert!(clone.take_io().is_none());
        drop(socket);
        drop(clone);
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn unclaimed_socket_closes_on_drop() {
        let (socket, cancel) = socket();
        let subscribers = Subscribers::default();
        let mut rx = subscribers.subscribe();
        subscribers.emit(socket);
        assert!(!cancel.is_cancelled());
        let received = rx.try_recv().expect("emitted");
        assert_eq!(received.alpn(), b"test");
        drop(received);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn joins_are_counted() {
        let key = PeerKey::from_bytes([2; 32]);
        let mut joins = Joins::default();
        joins.join(key, b"a", || 1);
        joins.join(key, b"a", || 2);
        joins.join(key, b"b", || 3);
        assert_eq!(joins.get(key, b"a"), Some(&1));
        assert_eq!(joins.leave(key, b"a"), None);
        assert_eq!(joins.leave(key, b"a"), Some(1));
        assert_eq!(joins.get(key, b"a"), None);
        assert_eq!(joins.leave(key, b"a"), None);
        assert_eq!(joins.drain().collect::<Vec<_>>(), vec![3]);
    }
}
