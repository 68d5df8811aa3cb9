use cid::Cid;

/// Errors surfaced by the engine and the read-side client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The context ID is already advertised with identical entries and metadata.
    ///
    /// Re-issuing the same put is safe and a no-op.
    #[error("advertisement already published for this provider and context ID")]
    AlreadyAdvertised,

    /// A removal was requested for a provider and context ID that has no
    /// advertised entries.
    #[error("context ID not found for provider")]
    ContextIdNotFound,

    /// The build path needs the multihash lister and none is registered.
    #[error("no multihash lister is registered")]
    NoMultihashLister,

    /// An entry chain continues beyond the configured recursion depth.
    #[error("entries chain truncated by the recursion depth limit")]
    EntriesTruncated,

    /// A malformed advertisement.
    #[error("invalid advertisement: {0}")]
    Validation(String),

    /// Signing or signature verification failed.
    #[error("signature: {0}")]
    Signature(String),

    /// Datastore or link system failure.
    #[error("storage: {0}")]
    Storage(#[source] anyhow::Error),

    /// Publisher or announce sender I/O failure.
    #[error("transport: {0}")]
    Transport(#[source] anyhow::Error),

    /// The engine is misconfigured for the requested operation.
    #[error("configuration: {0}")]
    Config(String),

    /// A block that was expected to exist could not be found.
    #[error("block not found: {0}")]
    NotFound(Cid),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn storage(err: impl Into<anyhow::Error>) -> Self {
        Self::Storage(err.into())
    }

    pub(crate) fn transport(err: impl Into<anyhow::Error>) -> Self {
        Self::Transport(err.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
