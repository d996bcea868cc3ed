//! An in-process overlay network.
//!
//! Nodes bound to the same [`MemoryNetwork`] reach each other through [`tokio::io::duplex`]
//! pipes. Joined peers are redialed after a connection closes, and as soon as they bind.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use n0_future::{boxed::BoxFuture, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, trace};

use super::{Joins, PeerSocket, Subscribers, Transport};
use crate::key::PeerKey;

/// Capacity of each direction of a connection pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Pause before redialing a joined peer after its connection closed.
const REDIAL_DELAY: Duration = Duration::from_millis(50);

/// A set of in-process nodes that can connect to each other.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Debug, Default)]
struct NetworkState {
    nodes: HashMap<PeerKey, Node>,
    /// Shared sequence of node instances and joins.
    next_instance: u64,
}

#[derive(Debug)]
struct Node {
    instance: u64,
    alpns: Vec<&'static [u8]>,
    subscribers: Subscribers,
    joins: Joins<Join>,
    shutdown: CancellationToken,
}

#[derive(Debug)]
struct Join {
    cancel: CancellationToken,
    /// Sequence number, ordered with node instances.
    seq: u64,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node with identity `key` that accepts connections for `alpns`.
    ///
    /// A node previously bound with the same key is shut down. Peers that joined `key` dial
    /// it as soon as the caller yields to the runtime, so subscribing right after binding
    /// sees those sockets. Must be called from within a tokio runtime.
    pub fn bind(
        &self,
        key: PeerKey,
        alpns: impl IntoIterator<Item = &'static [u8]>,
    ) -> MemoryTransport {
        let mut state = self.state.lock().expect("poisoned");
        state.next_instance += 1;
        let instance = state.next_instance;
        let node = Node {
            instance,
            alpns: alpns.into_iter().collect(),
            subscribers: Subscribers::default(),
            joins: Joins::default(),
            shutdown: CancellationToken::new(),
        };
        if let Some(previous) = state.nodes.insert(key, node) {
            debug!(node = %key.fmt_short(), "replacing bound node");
            previous.close();
        }
        drop(state);
        // dial once the caller had a chance to subscribe
        let network = self.clone();
        tokio::spawn(async move { network.dial_joined(key, instance) });
        MemoryTransport {
            key,
            instance,
            network: self.clone(),
        }
    }

    fn dial_joined(&self, key: PeerKey, instance: u64) {
        let state = self.state.lock().expect("poisoned");
        if state.nodes.get(&key).map(|node| node.instance) != Some(instance) {
            return;
        }
        let dials: Vec<_> = state
            .nodes
            .iter()
            .filter(|(from, _)| **from != key)
            .flat_map(|(from, node)| {
                // joins made after the bind already dialed
                node.joins
                    .iter()
                    .filter(move |(to, _, join)| *to == key && join.seq < instance)
                    .map(move |(_, alpn, _)| (*from, alpn))
            })
            .collect();
        for (from, alpn) in dials {
            self.connect(&state, from, key, alpn);
        }
    }

    fn connect(&self, state: &NetworkState, from: PeerKey, to: PeerKey, alpn: &'static [u8]) {
        let Some(remote) = state.nodes.get(&to) else {
            trace!(to = %to.fmt_short(), "peer not bound");
            return;
        };
        if !remote.alpns.contains(&alpn) {
            debug!(
                to = %to.fmt_short(),
                alpn = %String::from_utf8_lossy(alpn),
                "peer does not accept protocol"
            );
            return;
        }
        let Some(local) = state.nodes.get(&from) else {
            return;
        };
        let Some(join) = local.joins.get(to, alpn) else {
            return;
        };

        let (local_io, remote_io) = tokio::io::duplex(PIPE_CAPACITY);
        let local_cancel = join.cancel.child_token();
        let remote_cancel = remote.shutdown.child_token();
        let instances = (local.instance, remote.instance);
        let join = join.cancel.clone();
        local.subscribers.emit(PeerSocket::new(
            to,
            alpn.to_vec(),
            local_io,
            local_cancel.clone(),
        ));
        remote.subscribers.emit(PeerSocket::new(
            from,
            alpn.to_vec(),
            remote_io,
            remote_cancel.clone(),
        ));

        let network = self.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = local_cancel.cancelled() => {}
                    _ = remote_cancel.cancelled() => {}
                }
                local_cancel.cancel();
                remote_cancel.cancel();
                trace!("connection closed");
                n0_future::time::sleep(REDIAL_DELAY).await;
                if !join.is_cancelled() {
                    network.redial(from, to, alpn, instances);
                }
            }
            .instrument(debug_span!(
                "memory-conn",
                from = %from.fmt_short(),
                to = %to.fmt_short(),
            )),
        );
    }

    fn redial(&self, from: PeerKey, to: PeerKey, alpn: &'static [u8], instances: (u64, u64)) {
        let state = self.state.lock().expect("poisoned");
        let bound = |key: &PeerKey| state.nodes.get(key).map(|node| node.instance);
        if (bound(&from), bound(&to)) != (Some(instances.0), Some(instances.1)) {
            // either side is gone, or rebound and dialed on bind
            return;
        }
        debug!("redialing");
        self.connect(&state, from, to, alpn);
    }

    fn with_node<T>(&self, key: PeerKey, instance: u64, f: impl FnOnce(&mut Node) -> T) -> Option<T> {
        let mut state = self.state.lock().expect("poisoned");
        state
            .nodes
            .get_mut(&key)
            .filter(|node| node.instance == instance)
            .map(f)
    }
}

impl Node {
    fn close(mut self) {
        self.shutdown.cancel();
        self.subscribers.clear();
        for join in self.joins.drain() {
            join.cancel.cancel();
        }
    }
}

/// A node of a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    key: PeerKey,
    instance: u64,
    network: MemoryNetwork,
}

impl Transport for MemoryTransport {
    fn public_key(&self) -> PeerKey {
        self.key
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerSocket> {
        self.network
            .with_node(self.key, self.instance, |node| node.subscribers.subscribe())
            .unwrap_or_else(|| mpsc::unbounded_channel().1)
    }

    fn join_peer(&self, key: PeerKey, alpn: &'static [u8]) {
        let mut state = self.network.state.lock().expect("poisoned");
        state.next_instance += 1;
        let seq = state.next_instance;
        let Some(node) = state
            .nodes
            .get_mut(&self.key)
            .filter(|node| node.instance == self.instance)
        else {
            return;
        };
        let first = node.joins.get(key, alpn).is_none();
        let parent = node.shutdown.clone();
        node.joins.join(key, alpn, || Join {
            cancel: parent.child_token(),
            seq,
        });
        if first {
            self.network.connect(&state, self.key, key, alpn);
        }
    }

    fn leave_peer(&self, key: PeerKey, alpn: &'static [u8]) {
        if let Some(Some(join)) = self
            .network
            .with_node(self.key, self.instance, |node| node.joins.leave(key, alpn))
        {
            join.cancel.cancel();
        }
    }

    fn shutdown(&self) -> BoxFuture<()> {
        let mut state = self.network.state.lock().expect("poisoned");
        if state
            .nodes
            .get(&self.key)
            .is_some_and(|node| node.instance == self.instance)
        {
            if let Some(node) = state.nodes.remove(&self.key) {
                node.close();
            }
        }
        Box::pin(async {})
    }
}
