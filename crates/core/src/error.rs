use thiserror::Error;

/// Fail-fast construction/precondition failures surfaced by the model core.
///
/// These are never retried; they bubble through `anyhow::Error` so callers can
/// `downcast_ref::<ModelError>()` when the kind matters.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("decode length {requested} exceeds the configured maximum of {maxlen}")]
    SequenceLengthExceeded { requested: usize, maxlen: usize },

    #[error(
        "requested {height}x{width} region exceeds the precomputed {max_height}x{max_width} extent"
    )]
    OutOfRangeCrop {
        height: usize,
        width: usize,
        max_height: usize,
        max_width: usize,
    },
}

impl ModelError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError(message.into())
    }
}
