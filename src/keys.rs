//! Identifier types used throughout.
//!
//! All identifiers except [`CollectionId`] are opaque 32-byte values. This
//! crate never interprets them; producing them (e.g. deriving a [`FeedId`]
//! from a signing key, or a [`HeadId`] from a CRDT change hash) is the
//! host's business.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Error when parsing an identifier from its hex representation.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The string was not valid hex.
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    /// The decoded value was not exactly 32 bytes.
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

macro_rules! bytes_id {
    ($name:ident) => {
        impl $name {
            /// Create from raw bytes.
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// The raw bytes.
            pub const fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Shortened hex representation, for logging.
            pub fn fmt_short(&self) -> String {
                hex::encode(&self.0[..5])
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(value: [u8; 32]) -> Self {
                Self(value)
            }
        }

        impl From<$name> for [u8; 32] {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}…)", stringify!($name), self.fmt_short())
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s)?;
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|e: Vec<u8>| ParseError::Length(e.len()))?;
                Ok(Self(bytes))
            }
        }
    };
}

/// Identifier of one append-only feed (one writer's log).
///
/// Stable for the lifetime of the feed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeedId([u8; 32]);
bytes_id!(FeedId);

/// Identifier of a remote peer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);
bytes_id!(PeerId);

/// Identifier of a CRDT document.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId([u8; 32]);
bytes_id!(DocId);

/// Opaque marker for one version of a CRDT document, analogous to a commit
/// hash. Only compared for equality.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HeadId([u8; 32]);
bytes_id!(HeadId);

/// Name of a collection of documents tracked for synchronization.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionId(String);

impl CollectionId {
    /// Create a collection id from a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The collection name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CollectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CollectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for CollectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
