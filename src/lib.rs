//! Causal replication core for multi-writer document stores.
//!
//! Every writer appends to its own feed, an ordered log that replicates as
//! a unit. Entries are stamped with the writer's [`Timeframe`], a vector
//! clock naming the entries it had processed at write time. From those two
//! ingredients this crate derives a consistent order across peers without
//! any coordination:
//!
//! - [`FeedSetIterator`] merges a growing set of feeds into one stream
//!   that holds every entry back until its dependencies were consumed.
//! - [`Pipeline`] adds progress tracking on top: a committed/pending
//!   [`TimeframeClock`](pipeline::TimeframeClock), a writer that stamps
//!   local entries, and waiting for a target timeframe.
//! - [`CollectionSynchronizer`] gossips per-collection document states
//!   between peers so hosts learn which documents need fetching, with
//!   [`CollectionState::diff`] naming them.
//!
//! The crate moves no bytes and stores none: transports, persistence and
//! the CRDT layer stay on the host side, wired in through the [`FeedRead`]
//! and [`Transport`] traits.
//!
//! ```
//! use futures_lite::StreamExt;
//! use tributary::{Feed, FeedId, Pipeline, PipelineOptions};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let ours = Feed::new(FeedId::from_bytes([1; 32]));
//! let theirs = Feed::new(FeedId::from_bytes([2; 32]));
//!
//! let mut pipeline = Pipeline::new(PipelineOptions::default());
//! pipeline.add_feed(ours.clone());
//! pipeline.add_feed(theirs.clone());
//! pipeline.set_write_feed(ours).unwrap();
//!
//! let writer = pipeline.writer().unwrap();
//! writer.append("hello");
//! // A reply from a peer, depending on our write. It is emitted
//! // second no matter when it arrives.
//! theirs.append("reply", [(writer.feed(), 0)].into_iter().collect());
//!
//! let mut entries = pipeline.consume();
//! assert_eq!(entries.next().await.unwrap().into_payload(), "hello");
//! assert_eq!(entries.next().await.unwrap().into_payload(), "reply");
//! # }
//! ```

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod collection;
pub mod feed;
pub mod iterator;
pub mod keys;
pub mod pipeline;
pub mod sync;
pub mod timeframe;
pub mod watchable;

pub use self::{
    collection::CollectionState,
    feed::{Entry, Feed, FeedRead},
    iterator::{EntrySelector, FeedSetIterator, IteratorOptions, TimeframeSelector},
    keys::{CollectionId, DocId, FeedId, HeadId, PeerId},
    pipeline::{
        FeedWriter, Pipeline, PipelineOptions, PipelineState, WaitOptions, WaitOutcome,
        WriteReceipt,
    },
    sync::{CollectionSynchronizer, SyncEvent, Transport},
    timeframe::Timeframe,
};
