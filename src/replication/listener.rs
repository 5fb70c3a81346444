use crate::config::ConnectionConfig;
use crate::error::generic::CdcResult;
use crate::replication::engine::{AckPolicy, ReplicationEngine, SessionOpener, Sink};
use crate::replication::slot::SlotAdmin;
use crate::replication::stream::{FrameSource, ReplicationStream};
use async_trait::async_trait;
use log::info;
use std::collections::BTreeSet;

/// The four-operation contract of a change data capture tap: manage the
/// replication slot, and start or stop consumption of its stream.
#[async_trait]
pub trait ChangeDataCapture {
    /// Create the replication slot if it does not exist yet. The slot must
    /// exist before changes can be captured.
    async fn create_replication_slot(&self) -> CdcResult<()>;

    /// Drop the replication slot. Any change after the drop is not
    /// captured. Sequence this after [`stop`]; mostly useful in
    /// integration tests and teardown.
    ///
    /// [`stop`]: ChangeDataCapture::stop
    async fn drop_replication_slot(&self) -> CdcResult<()>;

    /// Start streaming changes to the configured sink.
    async fn start(&mut self);

    /// Stop streaming and release the connection. The instance must not be
    /// reused afterwards. Lifecycle ownership stays with the host process:
    /// wire this into its own termination handling.
    async fn stop(&mut self);
}

/// Streams row-level changes from one PostgreSQL logical replication slot
/// to one sink.
pub struct PostgresReplicationListener {
    slot_name: String,
    admin: SlotAdmin,
    engine: ReplicationEngine,
}

impl PostgresReplicationListener {
    /// Provision the listener and its parked background task. Nothing is
    /// connected until start(). Must run inside a tokio runtime.
    ///
    /// `tables` is a set of `schema.table` names to stream changes from;
    /// an empty set requests no server-side filtering.
    pub fn new(
        config: ConnectionConfig,
        slot_name: impl Into<String>,
        tables: BTreeSet<String>,
        sink: Sink,
    ) -> Self {
        Self::with_ack_policy(config, slot_name, tables, sink, AckPolicy::default())
    }

    /// Like [`new`], with an explicit delivery-guarantee policy for frames
    /// whose local processing fails.
    ///
    /// [`new`]: PostgresReplicationListener::new
    pub fn with_ack_policy(
        config: ConnectionConfig,
        slot_name: impl Into<String>,
        tables: BTreeSet<String>,
        sink: Sink,
        ack_policy: AckPolicy,
    ) -> Self {
        let slot_name = slot_name.into();
        let admin = SlotAdmin::new(config.clone(), slot_name.clone());

        let opener_slot = slot_name.clone();
        let opener: SessionOpener = Box::new(move || {
            Box::pin(async move {
                let stream = ReplicationStream::open(&config, &opener_slot, &tables).await?;
                Ok(Box::new(stream) as Box<dyn FrameSource>)
            })
        });
        let engine = ReplicationEngine::new(opener, sink, ack_policy);

        PostgresReplicationListener {
            slot_name,
            admin,
            engine,
        }
    }
}

#[async_trait]
impl ChangeDataCapture for PostgresReplicationListener {
    async fn create_replication_slot(&self) -> CdcResult<()> {
        self.admin.create_slot().await
    }

    async fn drop_replication_slot(&self) -> CdcResult<()> {
        self.admin.drop_slot().await
    }

    async fn start(&mut self) {
        info!(
            "Starting replication stream listener on slot {}",
            self.slot_name
        );
        self.engine.start();
    }

    async fn stop(&mut self) {
        info!(
            "Stopping replication stream listener on slot {}",
            self.slot_name
        );
        self.engine.stop().await;
    }
}
