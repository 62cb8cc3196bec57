use thiserror::Error;

/// Failures surfaced by registration and setup calls. Per-event errors never
/// reach the caller this way — they're translated into [`crate::channel::ChannelStatus`]
/// deliveries instead (see Section 7 of the design notes: the loop only logs
/// when there's no recipient for a status).
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("failed to create poll instance: {0}")]
    PollSetup(#[source] std::io::Error),

    #[error("failed to register fd with poll: {0}")]
    Register(#[source] std::io::Error),

    #[error("reactor is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
