//! Gossip-style synchronization of collection states between peers.
//!
//! [`CollectionSynchronizer`] keeps, per collection, the local state and
//! the last state each connected peer reported, and decides when to push
//! our state out or query a peer for theirs. It does no I/O and spawns
//! nothing: the host drives it from its connection lifecycle and wires
//! outgoing messages through a [`Transport`]. Acting on differences
//! (diffing states, fetching documents) is also the host's job; see
//! [`CollectionState::diff`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, trace};

use crate::{
    collection::CollectionState,
    keys::{CollectionId, PeerId},
};

/// Outgoing side of the synchronizer.
///
/// Both calls are one-way notifications, not request/response: replies
/// arrive later through [`CollectionSynchronizer::on_remote_state`].
/// Implementations should be cheap and non-blocking, queueing a message at
/// most. Delivery may fail silently; the protocol tolerates lost messages,
/// they only delay convergence until the next query or push.
pub trait Transport: Send + 'static {
    /// Send our state for a collection to a peer.
    fn send_state(&self, to: PeerId, collection: &CollectionId, state: &CollectionState);

    /// Ask a peer for its state of a collection.
    fn query_state(&self, peer: PeerId, collection: &CollectionId);
}

/// Events delivered to [`CollectionSynchronizer::subscribe`] subscribers.
#[derive(Debug, Clone, Eq, PartialEq, strum::Display)]
pub enum SyncEvent {
    /// A connected peer reported its state for the collection.
    RemoteStateUpdated {
        /// The reporting peer.
        peer: PeerId,
        /// The state it reported.
        state: CollectionState,
    },
}

#[derive(Debug, Default)]
struct CollectionSync {
    local: Option<CollectionState>,
    remote: BTreeMap<PeerId, CollectionState>,
    // Peers that asked for this collection. Always a subset of the
    // connected set.
    interested: BTreeSet<PeerId>,
}

/// Synchronizes collection states across connected peers.
///
/// Single-threaded and host-driven: every method runs to completion
/// without blocking, and nothing happens between calls. Messages from
/// peers that are not currently connected are dropped silently, which
/// makes late or reordered delivery after a disconnect harmless.
///
/// After [`close`](Self::close) all state is gone and every call becomes a
/// no-op; the synchronizer cannot be reused.
#[derive(derive_more::Debug)]
pub struct CollectionSynchronizer<T> {
    #[debug(skip)]
    transport: T,
    collections: HashMap<CollectionId, CollectionSync>,
    connected: BTreeSet<PeerId>,
    #[debug(skip)]
    subscribers: SubscribersMap,
    closed: bool,
}

impl<T: Transport> CollectionSynchronizer<T> {
    /// Create a synchronizer sending outgoing messages through `transport`.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            collections: HashMap::new(),
            connected: BTreeSet::new(),
            subscribers: SubscribersMap::default(),
            closed: false,
        }
    }

    /// Replace our state for a collection and push it to every connected
    /// peer that asked for this collection before.
    ///
    /// Setting a state identical to the current one does nothing.
    pub fn set_local_state(&mut self, collection: CollectionId, state: CollectionState) {
        if self.closed {
            return;
        }
        let entry = self.collections.entry(collection.clone()).or_default();
        if entry.local.as_ref() == Some(&state) {
            trace!(%collection, "local state unchanged");
            return;
        }
        for peer in &entry.interested {
            self.transport.send_state(*peer, &collection, &state);
        }
        debug!(%collection, pushed_to = entry.interested.len(), "local state updated");
        entry.local = Some(state);
    }

    /// Our state for a collection, if one was set.
    pub fn local_state(&self, collection: &CollectionId) -> Option<&CollectionState> {
        self.collections.get(collection)?.local.as_ref()
    }

    /// Snapshot of the last state each connected peer reported for a
    /// collection.
    pub fn remote_states(&self, collection: &CollectionId) -> BTreeMap<PeerId, CollectionState> {
        self.collections
            .get(collection)
            .map(|entry| entry.remote.clone())
            .unwrap_or_default()
    }

    /// Re-query every connected peer for a collection and push our state
    /// to the interested ones again.
    ///
    /// Useful after lost messages or when the host wants to force a
    /// reconciliation round.
    pub fn refresh_collection(&self, collection: &CollectionId) {
        if self.closed {
            return;
        }
        debug!(%collection, "refresh");
        for peer in &self.connected {
            self.transport.query_state(*peer, collection);
        }
        if let Some(entry) = self.collections.get(collection) {
            if let Some(state) = &entry.local {
                for peer in &entry.interested {
                    self.transport.send_state(*peer, collection, state);
                }
            }
        }
    }

    /// A connection to `peer` came up.
    ///
    /// Queries the peer for every collection we track. Opening a peer that
    /// is already connected does nothing.
    pub fn on_connection_open(&mut self, peer: PeerId) {
        if self.closed || !self.connected.insert(peer) {
            return;
        }
        debug!(peer = %peer.fmt_short(), "connection open");
        for collection in self.collections.keys() {
            self.transport.query_state(peer, collection);
        }
    }

    /// The connection to `peer` went down.
    ///
    /// Forgets the peer's reported states and its interest. A later
    /// reconnect starts from a clean slate via
    /// [`on_connection_open`](Self::on_connection_open).
    pub fn on_connection_closed(&mut self, peer: PeerId) {
        if self.closed || !self.connected.remove(&peer) {
            return;
        }
        debug!(peer = %peer.fmt_short(), "connection closed");
        for entry in self.collections.values_mut() {
            entry.remote.remove(&peer);
            entry.interested.remove(&peer);
        }
    }

    /// A peer asked for our state of a collection.
    ///
    /// Marks the peer as interested, so future
    /// [`set_local_state`](Self::set_local_state) calls push to it, and
    /// replies right away if we have a state. Queries from peers that are
    /// not connected are dropped.
    pub fn on_state_queried(&mut self, peer: PeerId, collection: &CollectionId) {
        if self.closed {
            return;
        }
        if !self.connected.contains(&peer) {
            debug!(peer = %peer.fmt_short(), %collection, "query from disconnected peer, dropping");
            return;
        }
        let entry = self.collections.entry(collection.clone()).or_default();
        entry.interested.insert(peer);
        if let Some(state) = &entry.local {
            self.transport.send_state(peer, collection, state);
        }
    }

    /// A peer reported its state of a collection.
    ///
    /// Stores it, replacing the peer's previous report, and notifies
    /// subscribers. States from peers that are not connected are dropped;
    /// receiving the same state again does nothing.
    pub fn on_remote_state(&mut self, peer: PeerId, collection: &CollectionId, state: CollectionState) {
        if self.closed {
            return;
        }
        if !self.connected.contains(&peer) {
            debug!(peer = %peer.fmt_short(), %collection, "state from disconnected peer, dropping");
            return;
        }
        let entry = self.collections.entry(collection.clone()).or_default();
        if entry.remote.get(&peer) == Some(&state) {
            trace!(peer = %peer.fmt_short(), %collection, "remote state unchanged");
            return;
        }
        entry.remote.insert(peer, state.clone());
        debug!(peer = %peer.fmt_short(), %collection, "remote state updated");
        self.subscribers
            .send(collection, SyncEvent::RemoteStateUpdated { peer, state });
    }

    /// Subscribe to state events for one collection.
    ///
    /// The channel is unbounded and closes when the synchronizer is
    /// closed or dropped.
    pub fn subscribe(&mut self, collection: CollectionId) -> async_channel::Receiver<SyncEvent> {
        if self.closed {
            let (tx, rx) = async_channel::unbounded();
            drop(tx);
            return rx;
        }
        self.subscribers.subscribe(collection)
    }

    /// Peers currently connected.
    pub fn connected_peers(&self) -> &BTreeSet<PeerId> {
        &self.connected
    }

    /// Drop all state, close all subscriber channels and ignore every call
    /// from now on.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        debug!("close");
        self.closed = true;
        self.collections.clear();
        self.connected.clear();
        self.subscribers = SubscribersMap::default();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[derive(Debug, Default)]
struct SubscribersMap(HashMap<CollectionId, Subscribers>);

impl SubscribersMap {
    fn subscribe(&mut self, collection: CollectionId) -> async_channel::Receiver<SyncEvent> {
        let (tx, rx) = async_channel::unbounded();
        self.0.entry(collection).or_default().push(tx);
        rx
    }

    fn send(&mut self, collection: &CollectionId, event: SyncEvent) {
        trace!(%collection, %event, "emit event");
        if let Some(subscribers) = self.0.get_mut(collection) {
            if !subscribers.send(event) {
                self.0.remove(collection);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Subscribers(Vec<async_channel::Sender<SyncEvent>>);

impl Subscribers {
    fn push(&mut self, sender: async_channel::Sender<SyncEvent>) {
        self.0.push(sender);
    }

    /// Sends to all subscribers, dropping the ones that hung up.
    /// Returns false if none are left.
    fn send(&mut self, event: SyncEvent) -> bool {
        self.0
            .retain(|sender| sender.try_send(event.clone()).is_ok());
        !self.0.is_empty()
    }
}
