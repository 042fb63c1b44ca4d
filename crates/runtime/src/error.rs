use thiserror::Error;

use statecraft_db::StoreError;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("machine already started")]
    AlreadyStarted,
    #[error("submission cancelled")]
    Cancelled,
    #[error("transition already taken for this invocation")]
    AlreadyTransitioned,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("payload encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("payload decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}
