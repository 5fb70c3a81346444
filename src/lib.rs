//! Change data capture from PostgreSQL logical replication slots.
//!
//! Streams row-level change events out of the write-ahead log through a
//! logical replication slot decoded by the server-side wal2json plugin,
//! and delivers them as [`DatabaseChange`] records to an
//! application-supplied sink.
//!
//! The entry point is [`PostgresReplicationListener`], which exposes the
//! [`ChangeDataCapture`] contract: create or drop the slot, then start and
//! stop the background consumption task. One listener owns exactly one
//! slot and one sink; frames are delivered serially, in the order the
//! server emits them.

pub mod config;
pub mod error;
pub mod event;
pub mod replication;

pub use config::ConnectionConfig;
pub use error::{CdcError, CdcResult, DecodeError};
pub use event::change::DatabaseChange;
pub use event::kind::Action;
pub use replication::engine::{AckPolicy, ReplicationEngine, SessionOpener, Sink};
pub use replication::listener::{ChangeDataCapture, PostgresReplicationListener};
pub use replication::slot::SlotAdmin;
pub use replication::stream::{FrameSource, ReplicationStream, XLogData};
