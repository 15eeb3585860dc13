use std::io;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    ResourceExhausted {
        available: usize,
        requested: usize,
    },
    MessageTooLong {
        len: usize,
        max: usize,
    },
    ChannelClosed {
        channel_id: String,
    },
    ChannelNotFound {
        channel_id: String,
    },
    NameInUse {
        name: String,
    },
    SessionRelocating {
        session_id: String,
    },
    RpcFailed {
        node_id: String,
        message: String,
        retryable: bool,
    },
    ValidationFailed {
        reason: String,
    },
    Io(String),
    Serde(String),
}

impl From<serde_cbor::Error> for ChannelError {
    fn from(error: serde_cbor::Error) -> Self {
        ChannelError::Serde(error.to_string())
    }
}

impl From<io::Error> for ChannelError {
    fn from(error: io::Error) -> Self {
        ChannelError::Io(error.to_string())
    }
}
