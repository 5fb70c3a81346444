use serde::{Deserialize, Serialize};

/// Connection parameters for the source database.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl ConnectionConfig {
    /// Keyword/value connection string for a logical replication session.
    ///
    /// Replication commands (CREATE_REPLICATION_SLOT, START_REPLICATION)
    /// are only accepted on connections opened with replication=database.
    pub fn replication_dsn(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} replication=database",
            self.host, self.port, self.user, self.password, self.dbname
        )
    }
}
