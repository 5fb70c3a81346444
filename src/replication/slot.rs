use crate::config::ConnectionConfig;
use crate::error::generic::CdcResult;
use log::{info, warn};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};

/// Server-side logical decoding plugin that renders each row change as a
/// JSON document. Must be installed on the source database.
// https://github.com/eulerto/wal2json
pub const WAL_OUTPUT_PLUGIN: &str = "wal2json";

/// Creates and drops the named logical replication slot.
///
/// Each operation opens its own short-lived administrative connection;
/// these are never shared with the streaming connection.
pub struct SlotAdmin {
    config: ConnectionConfig,
    slot_name: String,
}

impl SlotAdmin {
    pub fn new(config: ConnectionConfig, slot_name: impl Into<String>) -> Self {
        SlotAdmin {
            config,
            slot_name: slot_name.into(),
        }
    }

    /// Create the slot. Creating a slot that already exists is treated as
    /// success; the existing slot keeps its confirmed position.
    pub async fn create_slot(&self) -> CdcResult<()> {
        let client = self.connect().await?;
        info!("Creating replication slot {}", self.slot_name);
        let query = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL {}",
            self.slot_name, WAL_OUTPUT_PLUGIN
        );
        match client.simple_query(&query).await {
            Ok(_) => {
                info!("Created replication slot {}", self.slot_name);
                Ok(())
            }
            Err(e) if e.code() == Some(&SqlState::DUPLICATE_OBJECT) => {
                info!("Replication slot {} already exists", self.slot_name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the slot. Callers streaming from the slot must stop first.
    pub async fn drop_slot(&self) -> CdcResult<()> {
        let client = self.connect().await?;
        info!("Dropping replication slot {}", self.slot_name);
        let query = format!("DROP_REPLICATION_SLOT {}", self.slot_name);
        client.simple_query(&query).await?;
        info!("Dropped replication slot {}", self.slot_name);
        Ok(())
    }

    async fn connect(&self) -> CdcResult<Client> {
        let (client, connection) =
            tokio_postgres::connect(&self.config.replication_dsn(), NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("Admin connection error: {}", e);
            }
        });
        Ok(client)
    }
}
