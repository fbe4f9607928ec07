//! Error taxonomy of the layered state store.

use layerdb_storage::StoreError;
use layerdb_types::{DecodeError, Hash};

/// Errors surfaced by the state store.
///
/// `Stale` and `NotCoveredYet` are recoverable by the caller (re-acquire the
/// layer through the tree, or fall back to the trie); the rest either reject
/// the requested operation or signal that a persisted structure had to be
/// discarded and rebuilt.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Read against a layer that was flattened or replaced.
    #[error("layer is stale")]
    Stale,

    /// A layer was added with itself as parent.
    #[error("layer cycle: {0} is its own parent")]
    LayerCycle(Hash),

    /// The named parent layer is not part of the tree.
    #[error("parent layer {0} missing")]
    ParentMissing(Hash),

    /// Flat-state read beyond the snapshot generator's progress marker.
    #[error("state not covered yet by snapshot generation")]
    NotCoveredYet,

    /// A revert was requested past the bottom of the retained history.
    #[error("state is unrecoverable")]
    StateUnrecoverable,

    /// A history entry disagrees with the disk layer it should apply to.
    #[error("unexpected state history: want root {want}, got {got}")]
    UnexpectedHistory {
        /// The disk layer root a matching entry must carry.
        want: Hash,
        /// The root the entry actually carries.
        got: Hash,
    },

    /// A persisted structure failed to decode or failed a consistency check.
    #[error("corrupted index: {0}")]
    CorruptedIndex(String),

    /// The database was opened read-only and refuses mutations.
    #[error("database is read only")]
    ReadOnly,

    /// A long-running operation observed the shutdown signal and stopped.
    #[error("operation aborted by shutdown signal")]
    Aborted,

    /// The persistence backend failed.
    #[error(transparent)]
    Io(#[from] StoreError),
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::CorruptedIndex(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
