//! Ordered consumption of a feed set with a committed/pending clock.
//!
//! [`Pipeline`] ties a [`FeedSetIterator`] to a [`TimeframeClock`] and a
//! write feed. Consuming the pipeline yields entries in causal order;
//! the clock tracks which of them count as processed, and local writes are
//! stamped with the processed timeframe as their dependencies. That stamp
//! is what makes a write replayable on other peers: they hold it back until
//! they have processed everything its writer had.

use std::{
    fmt,
    pin::Pin,
    sync::{Arc, RwLock},
    task::{Context, Poll},
    time::Duration,
};

use futures_lite::stream::Stream;
use tokio::time;
use tracing::{debug, warn};

use crate::{
    feed::{Entry, Feed, FeedRead},
    iterator::{FeedSetHandle, FeedSetIterator, IteratorOptions},
    keys::FeedId,
    timeframe::Timeframe,
    watchable::{Watchable, Watcher},
};

/// Errors from pipeline configuration.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A write feed was already set.
    #[error("write feed already set")]
    WriterAlreadySet,
    /// No write feed was set.
    #[error("no write feed set")]
    NoWriteFeed,
}

/// Tracks consumption progress as two timeframes.
///
/// The pending timeframe covers every entry handed out by the pipeline;
/// the committed timeframe only those the consumer has finished
/// processing. On a restart, the committed timeframe is the safe point to
/// resume from.
///
/// Cheaply cloneable; all clones observe the same clock.
#[derive(Debug, Clone)]
pub struct TimeframeClock {
    committed: Watchable<Timeframe>,
    pending: Arc<RwLock<Timeframe>>,
}

impl TimeframeClock {
    /// Create a clock starting at `start`.
    pub fn new(start: Timeframe) -> Self {
        Self {
            committed: Watchable::new(start.clone()),
            pending: Arc::new(RwLock::new(start)),
        }
    }

    /// The committed timeframe.
    pub fn timeframe(&self) -> Timeframe {
        self.committed.get()
    }

    /// The pending timeframe.
    pub fn pending_timeframe(&self) -> Timeframe {
        self.pending.read().expect("poisoned").clone()
    }

    /// Record an entry as handed out but not yet processed.
    pub fn update_pending(&self, feed: FeedId, seq: u64) {
        self.pending.write().expect("poisoned").insert(feed, seq);
    }

    /// Commit the pending timeframe, waking watchers.
    pub fn commit(&self) {
        let pending = self.pending.read().expect("poisoned").clone();
        self.committed.set(pending).ok();
    }

    /// Watch the committed timeframe.
    pub fn watch(&self) -> Watcher<Timeframe> {
        self.committed.watch()
    }

    /// Wait until the committed timeframe covers `target`.
    pub async fn wait_until_reached(&self, target: &Timeframe) {
        let mut watcher = self.committed.watch();
        loop {
            if target.unsatisfied(&self.timeframe()).is_empty() {
                return;
            }
            if watcher.updated().await.is_err() {
                return;
            }
        }
    }
}

/// Configuration for a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Entries at or below this timeframe are treated as already
    /// processed: skipped by consumption and counted as satisfied
    /// dependencies.
    pub start: Timeframe,
    /// Stall detection window, see [`IteratorOptions::stall_timeout`].
    pub stall_timeout: Option<Duration>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            start: Timeframe::new(),
            stall_timeout: Some(Duration::from_secs(1)),
        }
    }
}

/// Options for [`PipelineState::wait_until_reached_target`].
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Give up after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Return early when the pipeline reports a stall.
    pub break_on_stall: bool,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            break_on_stall: true,
        }
    }
}

/// How a [`PipelineState::wait_until_reached_target`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum WaitOutcome {
    /// The committed timeframe covers the target.
    Reached,
    /// The pipeline stalled on unsatisfied dependencies.
    Stalled,
    /// The timeout elapsed first.
    TimedOut,
}

/// Read and wait access to a pipeline's progress, cloneable and usable
/// while the pipeline itself is being consumed.
#[derive(Debug, Clone)]
pub struct PipelineState<T> {
    clock: TimeframeClock,
    feeds: Arc<RwLock<Vec<Feed<T>>>>,
    start: Timeframe,
    target: Arc<RwLock<Option<Timeframe>>>,
    stalls: Watchable<u64>,
}

impl<T> PipelineState<T>
where
    T: Clone + fmt::Debug + Send + Sync + 'static,
{
    /// The committed timeframe: everything the consumer has processed.
    pub fn timeframe(&self) -> Timeframe {
        self.clock.timeframe()
    }

    /// The pending timeframe: everything handed out to the consumer.
    pub fn pending_timeframe(&self) -> Timeframe {
        self.clock.pending_timeframe()
    }

    /// The timeframe the pipeline started from.
    pub fn start_timeframe(&self) -> &Timeframe {
        &self.start
    }

    /// The latest entry of every non-empty feed: where consumption ends if
    /// no more entries arrive.
    pub fn end_timeframe(&self) -> Timeframe {
        self.feeds
            .read()
            .expect("poisoned")
            .iter()
            .filter(|feed| !feed.is_empty())
            .map(|feed| (feed.id(), feed.len() - 1))
            .collect()
    }

    /// The target timeframe, if one was set.
    pub fn target_timeframe(&self) -> Option<Timeframe> {
        self.target.read().expect("poisoned").clone()
    }

    /// Set the timeframe [`wait_until_reached_target`] waits for.
    ///
    /// Typically derived from a remote peer's announced timeframe.
    ///
    /// [`wait_until_reached_target`]: Self::wait_until_reached_target
    pub fn set_target_timeframe(&self, target: Timeframe) {
        *self.target.write().expect("poisoned") = Some(target);
    }

    /// Watch the committed timeframe.
    pub fn watch(&self) -> Watcher<Timeframe> {
        self.clock.watch()
    }

    /// Watch the stall counter, see [`FeedSetIterator::stalled`].
    pub fn stalled(&self) -> Watcher<u64> {
        self.stalls.watch()
    }

    /// Wait until the committed timeframe covers `target`.
    pub async fn wait_until_reached(&self, target: &Timeframe) {
        self.clock.wait_until_reached(target).await
    }

    /// Wait until the committed timeframe covers the target timeframe.
    ///
    /// Resolves immediately when no target is set. Depending on `options`,
    /// also gives up on the next stall or after a timeout; both are normal
    /// outcomes when the data to reach the target has not arrived yet.
    pub async fn wait_until_reached_target(&self, options: WaitOptions) -> WaitOutcome {
        let target = self.target_timeframe().unwrap_or_default();
        let reached = self.clock.wait_until_reached(&target);
        let mut stalled = self.stalls.watch();
        let stall = async move {
            let _ = stalled.updated().await;
        };
        tokio::select! {
            _ = reached => WaitOutcome::Reached,
            _ = stall, if options.break_on_stall => {
                debug!(timeframe = %target, "stalled before reaching target");
                WaitOutcome::Stalled
            }
            _ = time::sleep(options.timeout.unwrap_or_default()), if options.timeout.is_some() => {
                warn!(timeframe = %target, "timed out waiting for target");
                WaitOutcome::TimedOut
            }
        }
    }
}

/// Handle for adding feeds to a [`Pipeline`] from other tasks.
#[derive(Debug, Clone)]
pub struct PipelineHandle<T> {
    feeds: Arc<RwLock<Vec<Feed<T>>>>,
    iterator: FeedSetHandle<T>,
}

impl<T> PipelineHandle<T>
where
    T: Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Add a feed, see [`Pipeline::add_feed`].
    ///
    /// Returns false if the pipeline was dropped.
    pub fn add_feed(&self, feed: Feed<T>) -> bool {
        if !register_feed(&self.feeds, &feed) {
            return true;
        }
        self.iterator.add_feed(feed)
    }
}

/// A causally ordered view over a set of feeds, with progress tracking and
/// a local writer.
///
/// Entries come out of [`consume`](Self::consume) in dependency order; an
/// entry counts as processed once the stream is polled again, which is
/// when the committed timeframe catches up. Local writes go through
/// [`writer`](Self::writer) and carry the committed timeframe of this
/// pipeline as their dependencies.
#[derive(Debug)]
pub struct Pipeline<T> {
    clock: TimeframeClock,
    feeds: Arc<RwLock<Vec<Feed<T>>>>,
    iterator: FeedSetIterator<T>,
    writer: Option<Feed<T>>,
    target: Arc<RwLock<Option<Timeframe>>>,
    dirty: bool,
}

impl<T> Pipeline<T>
where
    T: Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Create a pipeline starting at `options.start`.
    pub fn new(options: PipelineOptions) -> Self {
        let iterator = FeedSetIterator::new(IteratorOptions {
            start: options.start.clone(),
            stall_timeout: options.stall_timeout,
        });
        Self {
            clock: TimeframeClock::new(options.start),
            feeds: Arc::new(RwLock::new(Vec::new())),
            iterator,
            writer: None,
            target: Arc::new(RwLock::new(None)),
            dirty: false,
        }
    }

    /// Add a feed to be consumed.
    ///
    /// Feeds can be added at any time, also while consuming. Adding a feed
    /// twice is a no-op. The write feed is not consumed unless it is also
    /// added here.
    pub fn add_feed(&self, feed: Feed<T>) {
        if register_feed(&self.feeds, &feed) {
            self.iterator.add_feed(feed);
        }
    }

    /// Whether `feed` was added.
    pub fn has_feed(&self, feed: &FeedId) -> bool {
        self.feeds
            .read()
            .expect("poisoned")
            .iter()
            .any(|f| f.id() == *feed)
    }

    /// Set the feed local writes are appended to. Can only be set once.
    pub fn set_write_feed(&mut self, feed: Feed<T>) -> Result<(), PipelineError> {
        if self.writer.is_some() {
            return Err(PipelineError::WriterAlreadySet);
        }
        debug!(feed = %feed.id().fmt_short(), "write feed set");
        self.writer = Some(feed);
        Ok(())
    }

    /// Writer for appending local entries, cloneable and usable while the
    /// pipeline is being consumed.
    pub fn writer(&self) -> Result<FeedWriter<T>, PipelineError> {
        let feed = self.writer.clone().ok_or(PipelineError::NoWriteFeed)?;
        Ok(FeedWriter {
            feed,
            clock: self.clock.clone(),
        })
    }

    /// Progress view of this pipeline.
    pub fn state(&self) -> PipelineState<T> {
        PipelineState {
            clock: self.clock.clone(),
            feeds: self.feeds.clone(),
            start: self.iterator.start_timeframe().clone(),
            target: self.target.clone(),
            stalls: self.iterator.stalls_handle(),
        }
    }

    /// Handle for adding feeds from other tasks.
    pub fn handle(&self) -> PipelineHandle<T> {
        PipelineHandle {
            feeds: self.feeds.clone(),
            iterator: self.iterator.handle(),
        }
    }

    /// Consume entries in causal order.
    ///
    /// The previously yielded entry is committed on every poll, so the
    /// committed timeframe trails consumption by exactly the entry the
    /// consumer is currently processing. Dropping the stream and calling
    /// `consume` again continues where it left off.
    pub fn consume(&mut self) -> ConsumeStream<'_, T> {
        ConsumeStream { pipeline: self }
    }
}

/// Stream of causally ordered entries, see [`Pipeline::consume`].
///
/// Never ends on its own; feeds may always grow.
#[derive(Debug)]
pub struct ConsumeStream<'a, T> {
    pipeline: &'a mut Pipeline<T>,
}

impl<T> Stream for ConsumeStream<'_, T>
where
    T: Clone + fmt::Debug + Send + Sync + 'static,
{
    type Item = Entry<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let pipeline = &mut *self.get_mut().pipeline;
        if pipeline.dirty {
            pipeline.clock.commit();
            pipeline.dirty = false;
        }
        match Pin::new(&mut pipeline.iterator).poll_next(cx) {
            Poll::Ready(Some(entry)) => {
                pipeline.clock.update_pending(entry.feed(), entry.seq());
                pipeline.dirty = true;
                Poll::Ready(Some(entry))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Proof of a local append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    /// The feed written to.
    pub feed: FeedId,
    /// The sequence number assigned.
    pub seq: u64,
}

/// Appends local entries stamped with the pipeline's committed timeframe.
///
/// Obtained from [`Pipeline::writer`]; cheaply cloneable.
#[derive(Debug, Clone)]
pub struct FeedWriter<T> {
    feed: Feed<T>,
    clock: TimeframeClock,
}

impl<T> FeedWriter<T>
where
    T: Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Append `payload` to the write feed.
    ///
    /// The entry's dependencies are the committed timeframe at append
    /// time: everything this peer had processed when the write happened.
    pub fn append(&self, payload: T) -> WriteReceipt {
        let dependencies = self.clock.timeframe();
        let seq = self.feed.append(payload, dependencies);
        WriteReceipt {
            feed: self.feed.id(),
            seq,
        }
    }

    /// The feed this writer appends to.
    pub fn feed(&self) -> FeedId {
        self.feed.id()
    }
}

fn register_feed<T>(feeds: &RwLock<Vec<Feed<T>>>, feed: &Feed<T>) -> bool
where
    T: Clone + fmt::Debug + Send + Sync + 'static,
{
    let mut feeds = feeds.write().expect("poisoned");
    if feeds.iter().any(|f| f.id() == feed.id()) {
        debug!(feed = %feed.id().fmt_short(), "feed already added");
        return false;
    }
    feeds.push(feed.clone());
    true
}

#[cfg(test)]
mod tests {
    use futures_lite::{future::poll_once, StreamExt};
    use tokio::time::{timeout, Duration};

    use super::*;

    fn feed_id(n: u8) -> FeedId {
        FeedId::from_bytes([n; 32])
    }

    fn tf(frames: &[(u8, u64)]) -> Timeframe {
        frames
            .iter()
            .map(|(feed, seq)| (feed_id(*feed), *seq))
            .collect()
    }

    fn pipeline_with_writer() -> (Pipeline<&'static str>, FeedWriter<&'static str>) {
        let feed = Feed::new(feed_id(1));
        let mut pipeline = Pipeline::new(PipelineOptions::default());
        pipeline.add_feed(feed.clone());
        pipeline.set_write_feed(feed).unwrap();
        let writer = pipeline.writer().unwrap();
        (pipeline, writer)
    }

    #[tokio::test]
    async fn test_writes_are_stamped_with_committed_timeframe() {
        let (mut pipeline, writer) = pipeline_with_writer();
        assert_eq!(
            writer.append("first"),
            WriteReceipt {
                feed: feed_id(1),
                seq: 0
            }
        );

        let mut stream = pipeline.consume();
        let first = stream.next().await.unwrap();
        assert!(first.dependencies().is_empty());

        // Poll again to commit the first entry, then write. The new entry
        // must depend on the processed one.
        assert!(poll_once(stream.next()).await.is_none());
        writer.append("second");
        let second = stream.next().await.unwrap();
        assert_eq!(*second.dependencies(), tf(&[(1, 0)]));
    }

    #[tokio::test]
    async fn test_committed_trails_pending_by_one_poll() {
        let (mut pipeline, writer) = pipeline_with_writer();
        let state = pipeline.state();
        writer.append("a");
        writer.append("b");

        let mut stream = pipeline.consume();
        stream.next().await.unwrap();
        stream.next().await.unwrap();
        assert_eq!(state.timeframe(), tf(&[(1, 0)]));
        assert_eq!(state.pending_timeframe(), tf(&[(1, 1)]));

        // The next poll finds nothing but commits entry b.
        assert!(poll_once(stream.next()).await.is_none());
        assert_eq!(state.timeframe(), tf(&[(1, 1)]));
    }

    #[tokio::test]
    async fn test_consume_orders_across_feeds() {
        let local = Feed::new(feed_id(1));
        let remote = Feed::new(feed_id(2));
        // A remote entry referring to a local write we have not made yet.
        remote.append("r0", tf(&[(1, 0)]));

        let mut pipeline = Pipeline::new(PipelineOptions::default());
        pipeline.add_feed(remote.clone());
        pipeline.add_feed(local.clone());
        pipeline.set_write_feed(local).unwrap();
        let writer = pipeline.writer().unwrap();

        let mut stream = pipeline.consume();
        writer.append("l0");
        assert_eq!(stream.next().await.unwrap().into_payload(), "l0");
        assert_eq!(stream.next().await.unwrap().into_payload(), "r0");
    }

    #[tokio::test]
    async fn test_resume_from_pending_timeframe() {
        let feed = Feed::new(feed_id(1));
        feed.append("a0", Timeframe::new());
        feed.append("a1", Timeframe::new());
        feed.append("a2", Timeframe::new());

        let mut first = Pipeline::new(PipelineOptions::default());
        first.add_feed(feed.clone());
        {
            let mut stream = first.consume();
            stream.next().await.unwrap();
            stream.next().await.unwrap();
        }
        let resume_at = first.state().pending_timeframe();
        assert_eq!(resume_at, tf(&[(1, 1)]));

        let mut second = Pipeline::new(PipelineOptions {
            start: resume_at,
            ..Default::default()
        });
        second.add_feed(feed.clone());
        let mut stream = second.consume();
        assert_eq!(stream.next().await.unwrap().into_payload(), "a2");
        assert!(poll_once(stream.next()).await.is_none());
    }

    #[tokio::test]
    async fn test_wait_until_reached_target() {
        let (mut pipeline, writer) = pipeline_with_writer();
        let state = pipeline.state();
        for _ in 0..3 {
            writer.append("entry");
        }
        state.set_target_timeframe(state.end_timeframe());
        assert_eq!(state.end_timeframe(), tf(&[(1, 2)]));

        let consumer = tokio::task::spawn(async move {
            let mut stream = pipeline.consume();
            while stream.next().await.is_some() {}
        });
        let outcome = timeout(
            Duration::from_secs(5),
            state.wait_until_reached_target(WaitOptions::default()),
        )
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::Reached);
        assert!(state
            .target_timeframe()
            .unwrap()
            .unsatisfied(&state.timeframe())
            .is_empty());
        consumer.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_breaks_on_stall() {
        let missing = Feed::new(feed_id(1));
        let blocked = Feed::new(feed_id(2));
        blocked.append("b0", tf(&[(1, 0)]));

        let mut pipeline = Pipeline::new(PipelineOptions::default());
        pipeline.add_feed(missing.clone());
        pipeline.add_feed(blocked.clone());
        let state = pipeline.state();
        state.set_target_timeframe(tf(&[(2, 0)]));

        let consumer = tokio::task::spawn(async move {
            let mut stream = pipeline.consume();
            stream.next().await
        });
        let outcome = state.wait_until_reached_target(WaitOptions::default()).await;
        assert_eq!(outcome, WaitOutcome::Stalled);
        consumer.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let (pipeline, _writer) = pipeline_with_writer();
        let state = pipeline.state();
        state.set_target_timeframe(tf(&[(1, 0)]));

        // Nothing is consuming and nothing stalls: only the timeout fires.
        let outcome = state
            .wait_until_reached_target(WaitOptions {
                timeout: Some(Duration::from_millis(100)),
                break_on_stall: false,
            })
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_wait_without_target_resolves() {
        let (pipeline, _writer) = pipeline_with_writer();
        let state = pipeline.state();
        let outcome = state.wait_until_reached_target(WaitOptions::default()).await;
        assert_eq!(outcome, WaitOutcome::Reached);
    }

    #[tokio::test]
    async fn test_add_feed_via_handle_while_consuming() {
        let first = Feed::new(feed_id(1));
        first.append("a0", Timeframe::new());
        let mut pipeline = Pipeline::new(PipelineOptions::default());
        pipeline.add_feed(first.clone());
        let handle = pipeline.handle();

        let consumer = tokio::task::spawn(async move {
            let mut stream = pipeline.consume();
            let a = stream.next().await.unwrap().into_payload();
            let b = stream.next().await.unwrap().into_payload();
            (a, b)
        });

        let second = Feed::new(feed_id(2));
        second.append("b0", Timeframe::new());
        assert!(handle.add_feed(second));
        assert_eq!(consumer.await.unwrap(), ("a0", "b0"));
    }

    #[tokio::test]
    async fn test_write_feed_can_only_be_set_once() {
        let mut pipeline: Pipeline<&'static str> = Pipeline::new(PipelineOptions::default());
        assert!(matches!(
            pipeline.writer(),
            Err(PipelineError::NoWriteFeed)
        ));
        pipeline.set_write_feed(Feed::new(feed_id(1))).unwrap();
        assert!(matches!(
            pipeline.set_write_feed(Feed::new(feed_id(2))),
            Err(PipelineError::WriterAlreadySet)
        ));
    }
}
