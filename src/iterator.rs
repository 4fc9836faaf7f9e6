//! Causal interleaving of a dynamic set of feeds.
//!
//! [`FeedSetIterator`] merges any number of feeds into a single stream,
//! emitting an entry only once every frame of its dependency timeframe has
//! been consumed. Which of the currently emittable candidates goes first is
//! decided by an [`EntrySelector`]; the merge itself never reorders within
//! a feed and never emits an entry twice.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_lite::stream::Stream;
use tokio::{
    sync::mpsc,
    time::{self, Sleep},
};
use tracing::{debug, trace, warn};

use crate::{
    feed::{Entry, FeedRead},
    keys::FeedId,
    timeframe::Timeframe,
    watchable::{Watchable, Watcher},
};

/// Ordering policy for a [`FeedSetIterator`].
///
/// `candidates` holds the next unconsumed entry of each feed that currently
/// has one, in feed admission order. `clock` is the merge's running
/// timeframe. The selector returns the index of the candidate to emit next,
/// or `None` if no candidate should be emitted yet.
///
/// A selected candidate must have its dependencies satisfied by `clock`,
/// otherwise entries are handed out before the entries they depend on.
/// Selectors may keep state; they are invoked again whenever the candidate
/// set or the clock changes, and also when any candidate's feed grows.
pub trait EntrySelector<T>: Send {
    /// Pick the next candidate to emit.
    fn select(&mut self, clock: &Timeframe, candidates: &[Entry<T>]) -> Option<usize>;
}

impl<T, F> EntrySelector<T> for F
where
    F: FnMut(&Timeframe, &[Entry<T>]) -> Option<usize> + Send,
{
    fn select(&mut self, clock: &Timeframe, candidates: &[Entry<T>]) -> Option<usize> {
        (self)(clock, candidates)
    }
}

/// The default selector: the first candidate whose dependencies are
/// satisfied, in feed admission order.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeframeSelector;

impl<T> EntrySelector<T> for TimeframeSelector {
    fn select(&mut self, clock: &Timeframe, candidates: &[Entry<T>]) -> Option<usize> {
        candidates
            .iter()
            .position(|entry| entry.dependencies().unsatisfied(clock).is_empty())
    }
}

/// Configuration for a [`FeedSetIterator`].
#[derive(Debug, Clone, Default)]
pub struct IteratorOptions {
    /// Entries at or below this timeframe are skipped, not emitted. The
    /// running clock starts here, so dependencies on skipped entries count
    /// as satisfied.
    pub start: Timeframe,
    /// Report a stall when candidates are waiting but none became
    /// selectable for this long. `None` disables stall detection.
    pub stall_timeout: Option<Duration>,
}

/// Merges a growing set of feeds into one causally ordered stream.
///
/// The merge is lazy: nothing is read beyond what consumption demands, and
/// polling suspends (it never spins) while all feeds are exhausted or no
/// candidate is selectable. Feeds can be added at any time, including while
/// the stream is being consumed, via [`add_feed`](Self::add_feed) or a
/// [`FeedSetHandle`].
///
/// The stream never terminates on its own since any feed may still grow.
/// Dropping the iterator is the way to stop; the running clock can be read
/// first and later passed as [`IteratorOptions::start`] to resume without
/// re-emitting.
#[derive(derive_more::Debug)]
pub struct FeedSetIterator<T, S = TimeframeSelector> {
    #[debug(skip)]
    selector: S,
    #[debug(skip)]
    feed_filter: Option<FeedFilter>,
    sources: Vec<FeedSource<T>>,
    clock: Timeframe,
    start: Timeframe,
    stall_timeout: Option<Duration>,
    #[debug(skip)]
    stall_timer: Option<Pin<Box<Sleep>>>,
    stalls: Watchable<u64>,
    #[debug(skip)]
    inbox_tx: mpsc::UnboundedSender<Box<dyn FeedRead<T>>>,
    #[debug(skip)]
    inbox_rx: mpsc::UnboundedReceiver<Box<dyn FeedRead<T>>>,
}

type FeedFilter = Box<dyn Fn(&FeedId) -> bool + Send + Sync + 'static>;

#[derive(Debug)]
struct FeedSource<T> {
    feed: Box<dyn FeedRead<T>>,
    cursor: u64,
}

impl<T> FeedSetIterator<T> {
    /// Create with the default [`TimeframeSelector`].
    pub fn new(options: IteratorOptions) -> Self {
        Self::with_selector(TimeframeSelector, options)
    }
}

impl<T, S: EntrySelector<T>> FeedSetIterator<T, S> {
    /// Create with a custom selector.
    pub fn with_selector(selector: S, options: IteratorOptions) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            selector,
            feed_filter: None,
            sources: Vec::new(),
            clock: options.start.clone(),
            start: options.start,
            stall_timeout: options.stall_timeout,
            stall_timer: None,
            stalls: Watchable::new(0),
            inbox_tx,
            inbox_rx,
        }
    }

    /// Only admit feeds for which `filter` returns true.
    ///
    /// Applies to feeds admitted after this call; it does not evict feeds.
    pub fn with_feed_filter(
        mut self,
        filter: impl Fn(&FeedId) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.feed_filter = Some(Box::new(filter));
        self
    }

    /// Register a feed with the merge.
    ///
    /// Takes effect on the next poll, without interrupting an ongoing
    /// merge. Entries at or below the start timeframe are skipped.
    /// Re-adding a feed that is already part of the merge is a no-op.
    pub fn add_feed(&self, feed: impl FeedRead<T> + 'static) {
        self.inbox_tx.send(Box::new(feed)).ok();
    }

    /// Handle for admitting feeds from other tasks.
    pub fn handle(&self) -> FeedSetHandle<T> {
        FeedSetHandle {
            tx: self.inbox_tx.clone(),
        }
    }

    /// The running clock: the highest emitted sequence number per feed,
    /// on top of the start timeframe.
    pub fn timeframe(&self) -> &Timeframe {
        &self.clock
    }

    /// The timeframe this merge started from.
    pub fn start_timeframe(&self) -> &Timeframe {
        &self.start
    }

    /// Ids of the feeds admitted so far.
    ///
    /// Feeds queued with [`add_feed`](Self::add_feed) appear here once the
    /// stream has been polled.
    pub fn feed_ids(&self) -> Vec<FeedId> {
        self.sources.iter().map(|s| s.feed.id()).collect()
    }

    /// Watch the stall counter.
    ///
    /// The counter increments every time candidates sat unselectable for
    /// the configured [`IteratorOptions::stall_timeout`]. A stall is not an
    /// error; the merge resumes as soon as missing entries arrive. An empty
    /// candidate set is quiescence, not a stall.
    pub fn stalled(&self) -> Watcher<u64> {
        self.stalls.watch()
    }

    pub(crate) fn stalls_handle(&self) -> Watchable<u64> {
        self.stalls.clone()
    }

    fn admit(&mut self, feed: Box<dyn FeedRead<T>>) {
        let id = feed.id();
        if let Some(filter) = &self.feed_filter {
            if !filter(&id) {
                debug!(feed = %id.fmt_short(), "feed rejected by filter");
                return;
            }
        }
        if self.sources.iter().any(|s| s.feed.id() == id) {
            debug!(feed = %id.fmt_short(), "feed already admitted");
            return;
        }
        let cursor = self.start.get(&id).map(|seq| seq + 1).unwrap_or_default();
        debug!(feed = %id.fmt_short(), cursor, "feed admitted");
        self.sources.push(FeedSource { feed, cursor });
    }
}

impl<T, S> Stream for FeedSetIterator<T, S>
where
    S: EntrySelector<T> + Unpin,
{
    type Item = Entry<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            // Admit feeds queued since the last poll. When the inbox is
            // empty this registers the waker, so a later add_feed wakes us.
            while let Poll::Ready(Some(feed)) = this.inbox_rx.poll_recv(cx) {
                this.admit(feed);
            }

            // At most one candidate per feed: its next unconsumed entry.
            // Feeds without one register their waker through poll_len.
            let mut candidates = Vec::new();
            let mut origins = Vec::new();
            for (idx, source) in this.sources.iter().enumerate() {
                if source.feed.poll_len(cx, source.cursor).is_ready() {
                    if let Some(entry) = source.feed.entry(source.cursor) {
                        candidates.push(entry);
                        origins.push(idx);
                    }
                }
            }

            if candidates.is_empty() {
                return Poll::Pending;
            }

            match this.selector.select(&this.clock, &candidates) {
                Some(picked) => {
                    assert!(
                        picked < candidates.len(),
                        "selector returned index {picked} for {} candidates",
                        candidates.len()
                    );
                    let source = origins[picked];
                    let entry = candidates.swap_remove(picked);
                    debug_assert!(
                        entry.dependencies().unsatisfied(&this.clock).is_empty(),
                        "selector picked an entry with unmet dependencies"
                    );
                    this.sources[source].cursor = entry.seq() + 1;
                    this.clock.insert(entry.feed(), entry.seq());
                    this.stall_timer = None;
                    trace!(feed = %entry.feed().fmt_short(), seq = entry.seq(), "emit");
                    return Poll::Ready(Some(entry));
                }
                None => {
                    // Nothing selectable. Selection must re-run when any
                    // candidate's feed grows, so register on those too; a
                    // Ready here means an append raced us, start over.
                    let mut grew = false;
                    for idx in &origins {
                        let feed = &this.sources[*idx].feed;
                        if feed.poll_len(cx, feed.len()).is_ready() {
                            grew = true;
                        }
                    }
                    if grew {
                        continue;
                    }
                    if let Some(timeout) = this.stall_timeout {
                        let timer = this
                            .stall_timer
                            .get_or_insert_with(|| Box::pin(time::sleep(timeout)));
                        if timer.as_mut().poll(cx).is_ready() {
                            this.stall_timer = None;
                            let stalls = this.stalls.get();
                            this.stalls.set(stalls + 1).ok();
                            warn!(
                                clock = %this.clock,
                                waiting = candidates.len(),
                                "feed iterator stalled"
                            );
                        }
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

/// Cheaply cloneable handle for admitting feeds into a [`FeedSetIterator`]
/// from other tasks.
#[derive(derive_more::Debug)]
#[debug("FeedSetHandle")]
pub struct FeedSetHandle<T> {
    tx: mpsc::UnboundedSender<Box<dyn FeedRead<T>>>,
}

impl<T> Clone for FeedSetHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> FeedSetHandle<T> {
    /// Queue a feed for admission.
    ///
    /// Returns false if the iterator was dropped.
    pub fn add_feed(&self, feed: impl FeedRead<T> + 'static) -> bool {
        self.tx.send(Box::new(feed)).is_ok()
    }
}
