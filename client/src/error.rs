use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed {kind} payload: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Session has ended")]
    SessionEnded,

    #[error("Only the room leader can {0}")]
    NotLeader(&'static str),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn malformed(kind: &'static str, reason: impl ToString) -> Self {
        Self::Malformed {
            kind,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
