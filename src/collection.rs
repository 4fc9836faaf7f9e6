//! Collection state snapshots and their difference.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::keys::{DocId, HeadId};

/// Snapshot of a collection: for each document, the set of CRDT heads the
/// holder has stored.
///
/// Heads are opaque version markers, only ever compared for equality. Two
/// states carry the same information for a document iff their head sets are
/// equal; this type never tries to rank heads or merge documents, that is
/// the host CRDT's job.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CollectionState {
    documents: BTreeMap<DocId, BTreeSet<HeadId>>,
}

impl CollectionState {
    /// The empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stored heads for a document, replacing any previous set.
    pub fn insert(&mut self, doc: DocId, heads: impl IntoIterator<Item = HeadId>) {
        self.documents.insert(doc, heads.into_iter().collect());
    }

    /// Remove a document from the snapshot.
    pub fn remove(&mut self, doc: &DocId) -> Option<BTreeSet<HeadId>> {
        self.documents.remove(doc)
    }

    /// The stored heads for a document.
    ///
    /// `None` if the document is absent, which is not the same as being
    /// present with no heads.
    pub fn heads(&self, doc: &DocId) -> Option<&BTreeSet<HeadId>> {
        self.documents.get(doc)
    }

    /// Whether the document is present.
    pub fn contains(&self, doc: &DocId) -> bool {
        self.documents.contains_key(doc)
    }

    /// Number of documents in the snapshot.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Whether the snapshot holds no documents.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Iterate over documents and their heads in document order.
    pub fn iter(&self) -> impl Iterator<Item = (&DocId, &BTreeSet<HeadId>)> {
        self.documents.iter()
    }

    /// The documents whose head sets differ between `self` and `other`,
    /// including documents present on only one side.
    ///
    /// Symmetric, and empty iff the two states are equal. The result says
    /// which documents need reconciliation, not which side is newer; head
    /// sets are opaque, so there is no newer.
    pub fn diff(&self, other: &Self) -> Vec<DocId> {
        let docs: BTreeSet<&DocId> = self
            .documents
            .keys()
            .chain(other.documents.keys())
            .collect();
        docs.into_iter()
            .filter(|doc| self.documents.get(doc) != other.documents.get(doc))
            .copied()
            .collect()
    }
}

impl<I: IntoIterator<Item = HeadId>> FromIterator<(DocId, I)> for CollectionState {
    fn from_iter<T: IntoIterator<Item = (DocId, I)>>(iter: T) -> Self {
        let mut state = Self::new();
        for (doc, heads) in iter {
            state.insert(doc, heads);
        }
        state
    }
}
