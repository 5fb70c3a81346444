use crate::config::ConnectionConfig;
use crate::error::generic::{CdcError, CdcResult};
use async_trait::async_trait;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use std::collections::BTreeSet;
use std::io::Cursor;
use std::pin::Pin;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_postgres::{CopyBothDuplex, NoTls};

/// How long a single poll waits for a pending frame before reporting
/// "nothing yet". Keeps the stop flag recheck interval, and therefore
/// shutdown latency, bounded.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How often the acknowledged position is reported to the server even when
/// no data is flowing.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(10);

// Microseconds between the unix epoch and the PostgreSQL epoch
// (2000-01-01T00:00:00Z), the clock domain of the replication protocol.
const PG_EPOCH_OFFSET_MICROS: u64 = 946_684_800 * 1_000_000;

/// One XLogData frame pulled from the replication stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogData {
    pub wal_start: u64,
    pub wal_end: u64,
    pub payload: Bytes,
}

/// The streaming side of one replication session.
///
/// The engine pulls pending frames and acknowledges positions through this
/// seam; mocking it lets the pull loop run against scripted frames without
/// a server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameSource: Send {
    /// Next pending data frame, or None when nothing arrived within the
    /// poll interval. Keepalives are answered internally and never
    /// surface.
    async fn next_pending(&mut self) -> CdcResult<Option<XLogData>>;

    /// Advance the acknowledged position and flush it to the server. The
    /// position never moves backwards within a session.
    async fn ack(&mut self, lsn: u64) -> CdcResult<()>;
}

/// One open replication connection streaming from a slot.
///
/// Owned exclusively by the engine's background task for its entire
/// Running lifetime; dropping it closes the connection.
pub struct ReplicationStream {
    stream: Pin<Box<CopyBothDuplex<Bytes>>>,
    acked_lsn: u64,
    last_status: Instant,
}

impl ReplicationStream {
    /// Open the streaming connection and start replication on the slot.
    ///
    /// Streaming starts at 0/0, which makes the server resume from the
    /// slot's confirmed position.
    pub async fn open(
        config: &ConnectionConfig,
        slot_name: &str,
        tables: &BTreeSet<String>,
    ) -> CdcResult<Self> {
        let (client, connection) =
            tokio_postgres::connect(&config.replication_dsn(), NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("Replication connection error: {}", e);
            }
        });

        let query = start_replication_query(slot_name, tables);
        debug!("Starting replication: {}", query);
        let duplex = client.copy_both_simple::<Bytes>(&query).await?;

        Ok(ReplicationStream {
            stream: Box::pin(duplex),
            acked_lsn: 0,
            last_status: Instant::now(),
        })
    }

    async fn send_status_update(&mut self, reply_requested: bool) -> CdcResult<()> {
        let frame = status_update_frame(self.acked_lsn, wal_clock_micros()?, reply_requested)?;
        self.stream.send(frame).await?;
        self.last_status = Instant::now();
        Ok(())
    }

    async fn handle_keepalive(&mut self, frame: &[u8]) -> CdcResult<()> {
        let keepalive = parse_keepalive(frame)?;
        if keepalive.reply_requested {
            debug!(
                "Keepalive (server at {}) requested a reply, reporting acked position {}",
                keepalive.wal_end, self.acked_lsn
            );
            self.send_status_update(false).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl FrameSource for ReplicationStream {
    async fn next_pending(&mut self) -> CdcResult<Option<XLogData>> {
        if self.last_status.elapsed() >= STATUS_INTERVAL {
            self.send_status_update(false).await?;
        }

        let frame = match tokio::time::timeout(POLL_INTERVAL, self.stream.next()).await {
            // Nothing pending within the poll window.
            Err(_) => return Ok(None),
            Ok(None) => return Err(CdcError::StreamClosed),
            Ok(Some(frame)) => frame?,
        };

        match frame.first() {
            Some(&b'w') => Ok(Some(parse_xlog_data(&frame)?)),
            Some(&b'k') => {
                self.handle_keepalive(&frame).await?;
                Ok(None)
            }
            tag => {
                debug!("Ignoring replication frame with tag {:?}", tag);
                Ok(None)
            }
        }
    }

    async fn ack(&mut self, lsn: u64) -> CdcResult<()> {
        self.acked_lsn = next_acked(self.acked_lsn, lsn);
        self.send_status_update(false).await
    }
}

/// The replay position only ever advances.
fn next_acked(current: u64, lsn: u64) -> u64 {
    current.max(lsn)
}

pub(crate) fn start_replication_query(slot_name: &str, tables: &BTreeSet<String>) -> String {
    let mut options = vec![
        "\"format-version\" '2'".to_string(),
        "\"include-transaction\" 'false'".to_string(),
        "\"include-timestamp\" 'true'".to_string(),
    ];
    if !tables.is_empty() {
        let table_list = tables.iter().cloned().collect::<Vec<String>>().join(",");
        options.push(format!("\"add-tables\" '{}'", table_list));
    }

    format!(
        "START_REPLICATION SLOT {} LOGICAL 0/0 ({})",
        slot_name,
        options.join(", ")
    )
}

// XLogData: 'w', wal start u64, wal end u64, server clock i64, payload.
pub(crate) fn parse_xlog_data(frame: &[u8]) -> CdcResult<XLogData> {
    let mut cursor = Cursor::new(frame);
    cursor.read_u8()?;
    let wal_start = cursor.read_u64::<BigEndian>()?;
    let wal_end = cursor.read_u64::<BigEndian>()?;
    let _server_clock = cursor.read_i64::<BigEndian>()?;

    let payload = Bytes::copy_from_slice(&frame[cursor.position() as usize..]);
    Ok(XLogData {
        wal_start,
        wal_end,
        payload,
    })
}

#[derive(Debug, PartialEq, Eq)]
struct Keepalive {
    wal_end: u64,
    reply_requested: bool,
}

// Primary keepalive: 'k', wal end u64, server clock i64, reply flag u8.
fn parse_keepalive(frame: &[u8]) -> CdcResult<Keepalive> {
    let mut cursor = Cursor::new(frame);
    cursor.read_u8()?;
    let wal_end = cursor.read_u64::<BigEndian>()?;
    let _server_clock = cursor.read_i64::<BigEndian>()?;
    let reply_requested = cursor.read_u8()? == 1;
    Ok(Keepalive {
        wal_end,
        reply_requested,
    })
}

// Standby Status Update: written, flushed, and applied all track the
// acknowledged position.
fn status_update_frame(lsn: u64, clock_micros: i64, reply_requested: bool) -> CdcResult<Bytes> {
    let mut buf = Cursor::new(Vec::with_capacity(34));
    buf.write_u8(b'r')?;
    buf.write_u64::<BigEndian>(lsn)?;
    buf.write_u64::<BigEndian>(lsn)?;
    buf.write_u64::<BigEndian>(lsn)?;
    buf.write_i64::<BigEndian>(clock_micros)?;
    buf.write_u8(u8::from(reply_requested))?;
    Ok(Bytes::from(buf.into_inner()))
}

fn wal_clock_micros() -> CdcResult<i64> {
    let since_unix = SystemTime::now().duration_since(UNIX_EPOCH)?;
    let micros =
        since_unix.as_secs() * 1_000_000 + u64::from(since_unix.subsec_micros());
    Ok(micros.saturating_sub(PG_EPOCH_OFFSET_MICROS) as i64)
}
