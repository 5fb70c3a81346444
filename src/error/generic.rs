use crate::error::decode::DecodeError;
use thiserror::Error;

pub type CdcResult<T> = Result<T, CdcError>;

#[derive(Debug, Error)]
pub enum CdcError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The server ended the replication stream. Fatal to the consumption
    /// loop; the engine does not reconnect.
    #[error("replication stream closed by server")]
    StreamClosed,

    /// Returned by sinks that reject a change record.
    #[error("sink rejected change record: {0}")]
    Sink(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system clock is before the unix epoch: {0}")]
    Clock(#[from] std::time::SystemTimeError),
}
