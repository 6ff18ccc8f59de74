use thiserror::Error;

/// Errors surfaced at the C1/C2/C3 boundary, where the auto-loop needs to
/// match on *kind* (reconnect vs degrade vs terminate) rather than pattern
/// match a string inside an opaque `anyhow::Error`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("device transport error: {0}")]
    Transport(String),

    #[error("device disconnected")]
    Disconnected,

    #[error("frame decode error: {0}")]
    Decode(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
