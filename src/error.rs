use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("master not available")]
    MasterUnavailable,

    #[error("no master address known yet")]
    NoMasterKnown,

    #[error("master client closed")]
    ClientClosed,

    #[error("coordinator stopped")]
    Stopped,

    #[error("none of the {0} seed sentinels is reachable")]
    NoSentinelReachable(usize),

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("timed out waiting for a reply from {0}")]
    ReadTimeout(String),

    #[error("connection to {0} closed")]
    ConnectionClosed(String),

    #[error("ERR Protocol error: {0}")]
    Protocol(String),

    /// Error reply sent by the server (`-ERR ...`)
    #[error("{0}")]
    Reply(String),

    /// Reply had the wrong shape for the command that produced it
    #[error("unexpected reply to {command}: {reason}")]
    UnexpectedReply {
        command: &'static str,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn unexpected(command: &'static str, reason: impl Into<String>) -> Self {
        Self::UnexpectedReply {
            command,
            reason: reason.into(),
        }
    }

    /// True for failures of the transport itself, after which the connection
    /// must not be reused.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout(_)
                | Self::ReadTimeout(_)
                | Self::ConnectionClosed(_)
                | Self::Protocol(_)
                | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
