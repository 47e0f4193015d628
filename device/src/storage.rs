use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::downlink::{SegmentBuffer, SegmentKind, SegmentStore};
use crate::error::{Result, UplinkError};
use crate::types::{Measurement, PendingEntry, Transport, TransportState};

// Matches the 30 s timeout the other sensor scripts open the database with.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS PendingMeasurements (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,
        devices_detected INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS SensorCommunication (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        wifi_available INTEGER NOT NULL DEFAULT 0,
        wifi_connected INTEGER NOT NULL DEFAULT 0,
        lora_available INTEGER NOT NULL DEFAULT 0,
        lora_connected INTEGER NOT NULL DEFAULT 0,
        upload_technology TEXT,
        last_update TEXT
    );
    INSERT OR IGNORE INTO SensorCommunication (id) VALUES (1);
    CREATE TABLE IF NOT EXISTS DownlinkSegments (
        kind TEXT PRIMARY KEY,
        total INTEGER NOT NULL,
        segments TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS DrainLease (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        owner TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    );
";

/// Durable FIFO of measurements that still have to reach the cloud.
///
/// Entries come back strictly in insertion order. Timestamps are not keys;
/// the same timestamp may be queued more than once.
pub trait RetryQueueStore {
    fn enqueue(&self, measurement: &Measurement) -> Result<i64>;
    fn peek_oldest(&self) -> Result<Option<PendingEntry>>;
    /// Deletes exactly the given entry. Returns `false` if it was already gone.
    fn remove(&self, id: i64) -> Result<bool>;
    fn remove_oldest(&self) -> Result<bool>;
    fn pending_count(&self) -> Result<u64>;

    /// Claims the right to drain the queue. Separate processes (the reporter and
    /// a manual run, say) must not both publish and delete the same head entry.
    fn try_acquire_drain_lease(&self, owner: &str, ttl: Duration) -> Result<bool>;
    fn release_drain_lease(&self, owner: &str) -> Result<()>;
}

/// Persisted transport reachability plus the chosen upload technology.
pub trait TransportStateStore {
    fn load_state(&self) -> Result<TransportState>;
    fn set_wifi_available(&self, available: bool) -> Result<()>;
    fn set_wifi_connected(&self, connected: bool) -> Result<()>;
    fn set_lora_available(&self, available: bool) -> Result<()>;
    fn set_lora_connected(&self, connected: bool) -> Result<()>;
    fn upload_technology(&self) -> Result<Option<Transport>>;
    fn set_upload_technology(&self, technology: Transport) -> Result<()>;
}

/// SQLite-backed store shared by every sensor process.
///
/// Each mutation is a single statement, so SQLite's writer lock is the only
/// serialisation needed between processes.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| UplinkError::Storage(format!("{}: {e}", parent.display())))?;
            }
        }
        info!(path = %path.display(), "Opening local sensor database");
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        debug!("Database schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| UplinkError::Storage("connection mutex poisoned".to_string()))
    }

    fn set_flag(&self, column: &'static str, value: bool) -> Result<()> {
        let sql = format!(
            "UPDATE SensorCommunication SET {column} = ?1, last_update = ?2 WHERE id = 1"
        );
        self.conn()?.execute(&sql, params![value, Utc::now()])?;
        debug!(column, value, "Transport flag updated");
        Ok(())
    }
}

fn to_sql_count(count: u64) -> Result<i64> {
    i64::try_from(count).map_err(|_| UplinkError::Storage(format!("count {count} out of range")))
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, i64, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

impl RetryQueueStore for SqliteStore {
    fn enqueue(&self, measurement: &Measurement) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO PendingMeasurements (timestamp, devices_detected) VALUES (?1, ?2)",
            params![measurement.timestamp, to_sql_count(measurement.count)?],
        )?;
        let id = conn.last_insert_rowid();
        info!(
            id,
            timestamp = measurement.timestamp,
            count = measurement.count,
            "Measurement stored for later delivery"
        );
        Ok(id)
    }

    fn peek_oldest(&self) -> Result<Option<PendingEntry>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT id, timestamp, devices_detected FROM PendingMeasurements ORDER BY id ASC LIMIT 1",
                [],
                row_to_entry,
            )
            .optional()?;

        row.map(|(id, timestamp, count)| {
            let count = u64::try_from(count)
                .map_err(|_| UplinkError::Storage(format!("negative count in entry {id}")))?;
            Ok(PendingEntry {
                id,
                measurement: Measurement::new(timestamp, count),
            })
        })
        .transpose()
    }

    fn remove(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM PendingMeasurements WHERE id = ?1", params![id])?;
        Ok(deleted == 1)
    }

    fn remove_oldest(&self) -> Result<bool> {
        let deleted = self.conn()?.execute(
            "DELETE FROM PendingMeasurements WHERE id = (SELECT MIN(id) FROM PendingMeasurements)",
            [],
        )?;
        Ok(deleted == 1)
    }

    fn pending_count(&self) -> Result<u64> {
        let count: i64 =
            self.conn()?
                .query_row("SELECT COUNT(*) FROM PendingMeasurements", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn try_acquire_drain_lease(&self, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl);
        let changed = self.conn()?.execute(
            "INSERT INTO DrainLease (id, owner, expires_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at
             WHERE DrainLease.expires_at <= ?3 OR DrainLease.owner = excluded.owner",
            params![owner, expires_at, now],
        )?;
        Ok(changed == 1)
    }

    fn release_drain_lease(&self, owner: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM DrainLease WHERE owner = ?1", params![owner])?;
        Ok(())
    }
}

impl TransportStateStore for SqliteStore {
    fn load_state(&self) -> Result<TransportState> {
        let state = self.conn()?.query_row(
            "SELECT wifi_available, wifi_connected, lora_available, lora_connected, last_update
             FROM SensorCommunication WHERE id = 1",
            [],
            |row| {
                Ok(TransportState {
                    wifi_available: row.get(0)?,
                    wifi_connected: row.get(1)?,
                    lora_available: row.get(2)?,
                    lora_connected: row.get(3)?,
                    last_update: row.get::<_, Option<DateTime<Utc>>>(4)?,
                })
            },
        )?;
        Ok(state)
    }

    fn set_wifi_available(&self, available: bool) -> Result<()> {
        self.set_flag("wifi_available", available)
    }

    fn set_wifi_connected(&self, connected: bool) -> Result<()> {
        self.set_flag("wifi_connected", connected)
    }

    fn set_lora_available(&self, available: bool) -> Result<()> {
        self.set_flag("lora_available", available)
    }

    fn set_lora_connected(&self, connected: bool) -> Result<()> {
        self.set_flag("lora_connected", connected)
    }

    fn upload_technology(&self) -> Result<Option<Transport>> {
        let raw: Option<String> = self.conn()?.query_row(
            "SELECT upload_technology FROM SensorCommunication WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        raw.map(|s| s.parse::<Transport>().map_err(UplinkError::Storage))
            .transpose()
    }

    fn set_upload_technology(&self, technology: Transport) -> Result<()> {
        self.conn()?.execute(
            "UPDATE SensorCommunication SET upload_technology = ?1, last_update = ?2 WHERE id = 1",
            params![technology.as_str(), Utc::now()],
        )?;
        info!(%technology, "Upload technology persisted");
        Ok(())
    }
}

impl SegmentStore for SqliteStore {
    fn load_segments(&self, kind: SegmentKind) -> Result<Option<SegmentBuffer>> {
        let row: Option<(i64, String)> = self
            .conn()?
            .query_row(
                "SELECT total, segments FROM DownlinkSegments WHERE kind = ?1",
                params![kind.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((total, segments)) => {
                let received: Vec<String> = serde_json::from_str(&segments)
                    .map_err(|e| UplinkError::Storage(format!("corrupt segment buffer: {e}")))?;
                let total = u32::try_from(total)
                    .map_err(|_| UplinkError::Storage(format!("invalid segment total {total}")))?;
                Ok(Some(SegmentBuffer::from_parts(total, received)))
            }
            None => Ok(None),
        }
    }

    fn save_segments(&self, kind: SegmentKind, buffer: &SegmentBuffer) -> Result<()> {
        let segments = serde_json::to_string(buffer.received())
            .map_err(|e| UplinkError::Storage(e.to_string()))?;
        self.conn()?.execute(
            "INSERT INTO DownlinkSegments (kind, total, segments) VALUES (?1, ?2, ?3)
             ON CONFLICT(kind) DO UPDATE SET total = excluded.total, segments = excluded.segments",
            params![kind.as_str(), buffer.total(), segments],
        )?;
        Ok(())
    }

    fn clear_segments(&self, kind: SegmentKind) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM DownlinkSegments WHERE kind = ?1", params![kind.as_str()])?;
        Ok(())
    }
}
