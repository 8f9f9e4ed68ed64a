use tandem_core::error::CoreError;
use tandem_core::remote::RemoteError;
use tandem_events::ChannelError;

/// Errors surfaced by the client engine to the UI layer.
///
/// Expected conditions (dropped heartbeats, lost races, a partner leaving)
/// are handled inside the engine and never show up here.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("No session is in progress")]
    NoActiveSession,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
