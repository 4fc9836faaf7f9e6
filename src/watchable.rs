//! A value that can be watched for changes.
//!
//! [`Watchable`] holds the value and hands out [`Watcher`]s. A watcher can
//! read the current value at any time and can await the next change without
//! polling in a loop. Used for the committed timeframe of a pipeline and for
//! stall notifications, but not tied to either.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, RwLock, Weak},
    task::{self, Poll, Waker},
};

use futures_lite::stream::Stream;

/// A shared value that notifies watchers on change.
///
/// Changes are tracked by an epoch counter, so a watcher created before a
/// change still observes it. Only the latest value is retained; watchers
/// that fall behind skip intermediate values.
#[derive(Debug, Default)]
pub struct Watchable<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Watchable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Eq> Watchable<T> {
    /// Create with an initial value.
    pub fn new(value: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State {
                    value,
                    epoch: INITIAL_EPOCH,
                }),
                watchers: Default::default(),
            }),
        }
    }

    /// Set a new value, waking all watchers.
    ///
    /// Returns the previous value, or `Err` with the unchanged value if it
    /// equals the current one. No watchers are woken in that case.
    pub fn set(&self, value: T) -> Result<T, T> {
        let mut state = self.shared.state.write().expect("poisoned");
        if state.value == value {
            return Err(value);
        }
        let old = std::mem::replace(&mut state.value, value);
        state.epoch += 1;
        drop(state);
        for watcher in self.shared.watchers.lock().expect("poisoned").drain(..) {
            watcher.wake();
        }
        Ok(old)
    }

    /// Create a [`Watcher`] observing changes from this point on.
    pub fn watch(&self) -> Watcher<T> {
        Watcher {
            epoch: self.shared.state.read().expect("poisoned").epoch,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// The current value.
    pub fn get(&self) -> T {
        self.shared.state.read().expect("poisoned").value.clone()
    }
}

/// Observer for a [`Watchable`].
///
/// Holds no strong reference to the value; once the last [`Watchable`] is
/// dropped, operations return [`Disconnected`].
#[derive(Debug, Clone)]
pub struct Watcher<T> {
    epoch: u64,
    shared: Weak<Shared<T>>,
}

impl<T: Clone + Eq> Watcher<T> {
    /// The current value.
    pub fn get(&self) -> Result<T, Disconnected> {
        let shared = self.shared.upgrade().ok_or(Disconnected)?;
        let value = shared.state.read().expect("poisoned").value.clone();
        Ok(value)
    }

    /// Waits for the value to change and returns the new one.
    ///
    /// Resolves immediately if the value changed since this watcher last
    /// observed it, even if that was before this call.
    pub fn updated(&mut self) -> WatchNextFut<'_, T> {
        WatchNextFut { watcher: self }
    }

    /// Convert into a stream of values, starting with the current one.
    pub fn stream(mut self) -> WatcherStream<T> {
        self.epoch = PRE_INITIAL_EPOCH;
        WatcherStream { watcher: self }
    }
}

/// The [`Watchable`] this [`Watcher`] observes was dropped.
#[derive(Debug, thiserror::Error)]
#[error("watch lost connection to underlying watchable, it was dropped")]
pub struct Disconnected;

/// Future resolving with the next value after a change.
///
/// See [`Watcher::updated`].
#[derive(Debug)]
pub struct WatchNextFut<'a, T> {
    watcher: &'a mut Watcher<T>,
}

impl<T: Clone + Eq> Future for WatchNextFut<'_, T> {
    type Output = Result<T, Disconnected>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let Some(shared) = self.watcher.shared.upgrade() else {
            return Poll::Ready(Err(Disconnected));
        };
        match shared.poll_updated(cx, self.watcher.epoch) {
            Poll::Pending => Poll::Pending,
            Poll::Ready((epoch, value)) => {
                self.watcher.epoch = epoch;
                Poll::Ready(Ok(value))
            }
        }
    }
}

/// Stream of values as they change.
///
/// See [`Watcher::stream`].
#[derive(Debug)]
pub struct WatcherStream<T> {
    watcher: Watcher<T>,
}

impl<T: Clone + Eq> Stream for WatcherStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        let Some(shared) = this.watcher.shared.upgrade() else {
            return Poll::Ready(None);
        };
        match shared.poll_updated(cx, this.watcher.epoch) {
            Poll::Pending => Poll::Pending,
            Poll::Ready((epoch, value)) => {
                this.watcher.epoch = epoch;
                Poll::Ready(Some(value))
            }
        }
    }
}

const INITIAL_EPOCH: u64 = 1;
const PRE_INITIAL_EPOCH: u64 = 0;

#[derive(Debug, Default)]
struct Shared<T> {
    state: RwLock<State<T>>,
    watchers: Mutex<VecDeque<Waker>>,
}

#[derive(Debug)]
struct State<T> {
    value: T,
    epoch: u64,
}

impl<T: Default> Default for State<T> {
    fn default() -> Self {
        Self {
            value: T::default(),
            epoch: INITIAL_EPOCH,
        }
    }
}

impl<T: Clone> Shared<T> {
    fn poll_updated(&self, cx: &mut task::Context<'_>, last_epoch: u64) -> Poll<(u64, T)> {
        {
            let state = self.state.read().expect("poisoned");
            if last_epoch < state.epoch {
                return Poll::Ready((state.epoch, state.value.clone()));
            }
        }
        self.watchers
            .lock()
            .expect("poisoned")
            .push_back(cx.waker().clone());
        // Check again after registering, the value may have changed in
        // between. Otherwise that update would be missed entirely.
        let state = self.state.read().expect("poisoned");
        if last_epoch < state.epoch {
            return Poll::Ready((state.epoch, state.value.clone()));
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use futures_lite::StreamExt;
    use rand::{thread_rng, Rng};

    use super::*;

    #[tokio::test]
    async fn test_get_and_set() {
        let watchable = Watchable::new(17u32);
        assert_eq!(watchable.get(), 17);
        assert_eq!(watchable.set(42), Ok(17));
        assert_eq!(watchable.set(42), Err(42));
        assert_eq!(watchable.get(), 42);
    }

    #[tokio::test]
    async fn test_updated_sees_change_before_await() {
        let watchable = Watchable::new(0u32);
        let mut watcher = watchable.watch();
        // Change happens after watch() but before updated() is awaited.
        watchable.set(1).unwrap();
        assert_eq!(watcher.updated().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_updated_wakes_concurrent_waiter() {
        let watchable = Watchable::new(0u32);
        let mut watcher = watchable.watch();
        let task = tokio::task::spawn(async move { watcher.updated().await });
        tokio::task::yield_now().await;
        watchable.set(7).unwrap();
        assert_eq!(task.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_stream_starts_with_current_value() {
        let watchable = Watchable::new(1u32);
        let mut stream = watchable.watch().stream();
        assert_eq!(stream.next().await, Some(1));
        watchable.set(2).unwrap();
        assert_eq!(stream.next().await, Some(2));
        drop(watchable);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_disconnected_after_drop() {
        let watchable = Watchable::new(1u32);
        let mut watcher = watchable.watch();
        drop(watchable);
        assert!(watcher.get().is_err());
        assert!(watcher.updated().await.is_err());
    }

    #[tokio::test]
    async fn test_no_update_lost_under_concurrent_sets() {
        let watchable = Watchable::new(0u64);
        let mut watcher = watchable.watch();
        let handle = watchable.clone();
        let writer = tokio::task::spawn(async move {
            for i in 1..=100u64 {
                handle.set(i).ok();
                if thread_rng().gen_bool(0.2) {
                    tokio::task::yield_now().await;
                }
            }
        });
        let mut last = 0;
        while last != 100 {
            let value = watcher.updated().await.unwrap();
            assert!(value > last, "values must only move forward");
            last = value;
        }
        writer.await.unwrap();
    }
}
