use mash_model::{RecordId, StoreError};
use mash_net::TransportError;
use thiserror::Error;

/// Failure escaping a job step or a message preparation.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("{kind} #{id} not found")]
    Missing { kind: &'static str, id: RecordId },
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid mail configuration: {0}")]
    Config(String),
    #[error("smtp error: {0}")]
    Smtp(String),
}
