use thiserror::Error;

/// Failure to turn a wal2json payload into a change record.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed wal2json payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unrecognized change action: {0}")]
    UnknownAction(String),

    #[error("change record has an empty {0} identifier")]
    EmptyIdentifier(&'static str),
}
