use std::path::PathBuf;

/// Errors in the pending variant bookkeeping that callers may want to match on.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PendingError {
    /// Two scratch outputs of one discovery run map to the same shard file.
    #[error("scratch files {first:?} and {second:?} both map to shard {destination:?}")]
    ShardCollision {
        destination: PathBuf,
        first: PathBuf,
        second: PathBuf,
    },
    /// The pending store was created for another descriptor.
    #[error("pending store {store:?} does not belong to descriptor {descriptor:?}")]
    DescriptorMismatch { descriptor: String, store: String },
    /// The cleaner already reached a terminal state.
    #[error("cleaner was already {0}")]
    CleanerFinished(&'static str),
    /// Shard windows must span at least one position.
    #[error("invalid window size: {0}")]
    InvalidWindowSize(u32),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgError {
    #[error("Invalid format in region: {0:?}")]
    RegionInvalidFormat(String),
    #[error("Invalid integer coordinates in region: {0:?}")]
    RegionInvalidInts(String),
}
