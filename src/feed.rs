//! Append-only feeds of causally stamped entries.
//!
//! A feed is one writer's totally ordered log. Entries carry the writer's
//! timeframe at append time as their dependencies; consumers use those to
//! interleave several feeds into a causal order, see
//! [`FeedSetIterator`](crate::iterator::FeedSetIterator).

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, RwLock},
    task::{Context, Poll, Waker},
};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{keys::FeedId, timeframe::Timeframe};

/// One record in a feed.
///
/// `seq` is the position within the feed, starting at zero and gapless.
/// `dependencies` is the writer's timeframe when the entry was appended: the
/// entry must not be applied before every frame in it is consumed.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Entry<T> {
    feed: FeedId,
    seq: u64,
    dependencies: Timeframe,
    payload: T,
}

impl<T> Entry<T> {
    /// Create an entry.
    pub fn new(feed: FeedId, seq: u64, dependencies: Timeframe, payload: T) -> Self {
        Self {
            feed,
            seq,
            dependencies,
            payload,
        }
    }

    /// The feed this entry belongs to.
    pub fn feed(&self) -> FeedId {
        self.feed
    }

    /// Position within the feed.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The timeframe that must be reached before applying this entry.
    pub fn dependencies(&self) -> &Timeframe {
        &self.dependencies
    }

    /// The host-defined payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Consume the entry, returning the payload.
    pub fn into_payload(self) -> T {
        self.payload
    }
}

/// Read access to a feed, with async growth notification.
///
/// Implemented by the in-memory [`Feed`]; hosts back it with whatever stores
/// their logs (disk, a networked replica, ...). Entries at a given position
/// never change once readable.
pub trait FeedRead<T>: fmt::Debug + Send + Sync {
    /// The feed identifier.
    fn id(&self) -> FeedId;

    /// Number of entries currently readable.
    fn len(&self) -> u64;

    /// Whether no entries are readable yet.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The entry at `seq`, or `None` if the feed has not grown that far.
    fn entry(&self, seq: u64) -> Option<Entry<T>>;

    /// Wait for the feed to grow beyond `known_len` entries.
    ///
    /// Returns `Ready` with the current length once it exceeds `known_len`,
    /// otherwise registers the waker from `cx` and returns `Pending`.
    /// Implementations must re-check after registering so that an append
    /// racing with the registration still wakes the caller.
    fn poll_len(&self, cx: &mut Context<'_>, known_len: u64) -> Poll<u64>;
}

/// An in-memory feed.
///
/// Cheaply cloneable handle; all clones append to and read from the same
/// log. The writing side assigns sequence numbers, making every append
/// totally ordered within the feed.
#[derive(Debug, Clone)]
pub struct Feed<T> {
    id: FeedId,
    shared: Arc<SharedFeed<T>>,
}

#[derive(Debug)]
struct SharedFeed<T> {
    entries: RwLock<Vec<Entry<T>>>,
    watchers: Mutex<VecDeque<Waker>>,
}

impl<T: Clone> Feed<T> {
    /// Create an empty feed.
    pub fn new(id: FeedId) -> Self {
        Self {
            id,
            shared: Arc::new(SharedFeed {
                entries: RwLock::new(Vec::new()),
                watchers: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Append an entry, stamping it with `dependencies`.
    ///
    /// Returns the assigned sequence number. Wakes all pending
    /// [`FeedRead::poll_len`] callers.
    pub fn append(&self, payload: T, dependencies: Timeframe) -> u64 {
        let mut entries = self.shared.entries.write().expect("poisoned");
        let seq = entries.len() as u64;
        entries.push(Entry::new(self.id, seq, dependencies, payload));
        drop(entries);
        trace!(feed = %self.id.fmt_short(), seq, "append");
        for watcher in self.shared.watchers.lock().expect("poisoned").drain(..) {
            watcher.wake();
        }
        seq
    }
}

impl<T> FeedRead<T> for Feed<T>
where
    T: Clone + fmt::Debug + Send + Sync + 'static,
{
    fn id(&self) -> FeedId {
        self.id
    }

    fn len(&self) -> u64 {
        self.shared.entries.read().expect("poisoned").len() as u64
    }

    fn entry(&self, seq: u64) -> Option<Entry<T>> {
        self.shared
            .entries
            .read()
            .expect("poisoned")
            .get(seq as usize)
            .cloned()
    }

    fn poll_len(&self, cx: &mut Context<'_>, known_len: u64) -> Poll<u64> {
        {
            let entries = self.shared.entries.read().expect("poisoned");
            if entries.len() as u64 > known_len {
                return Poll::Ready(entries.len() as u64);
            }
        }
        self.shared
            .watchers
            .lock()
            .expect("poisoned")
            .push_back(cx.waker().clone());
        // Re-check after registering, an append may have raced in between.
        let entries = self.shared.entries.read().expect("poisoned");
        if entries.len() as u64 > known_len {
            return Poll::Ready(entries.len() as u64);
        }
        Poll::Pending
    }
}
