use thiserror::Error;

/// Failure modes the engine surfaces to callers. Store-level failures are
/// wrapped as-is; everything else is a condition the pipeline raised itself.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The generation backend could not be reached, rejected the request,
    /// or returned an unreadable response.
    #[error("transport error: {0}")]
    Transport(String),

    /// A direct conversation has no persona prompt; generation is refused
    /// before any request goes out.
    #[error("conversation {0} has no persona configured")]
    PersonaMissing(String),

    /// A pipeline is already in flight for this conversation; background
    /// turns fail with this instead of queuing.
    #[error("conversation {0} is busy")]
    Busy(String),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
