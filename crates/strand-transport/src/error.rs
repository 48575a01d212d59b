use strand_core::Status;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection reset")]
    ConnectionReset,

    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Connect timeout exceeded")]
    ConnectTimeout,
}

pub type Result<T> = std::result::Result<T, TransportError>;

impl From<TransportError> for Status {
    fn from(e: TransportError) -> Self {
        Status::unavailable(e.to_string())
    }
}
