use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot is not valid json: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("{kind} record must be inserted before it can be saved")]
    NotInserted { kind: &'static str },
}
