use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not connected")]
    NotConnected,
    #[error("no response after {0} seconds")]
    Timeout(u64),
    #[error("received a line that is not valid UTF-8")]
    InvalidUtf8,
    #[error("peer closed the channel")]
    Closed,
}
