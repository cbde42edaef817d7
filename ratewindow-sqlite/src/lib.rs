//! SQLite bucket for `ratewindow` (companion crate).
//!
//! One row per weight unit in a `(name TEXT, timestamp INTEGER)` table indexed on `timestamp`.
//! Admission runs inside an `EXCLUSIVE` transaction, so every connection to the same database
//! file (in this process or another) sees a single ordered log. The database runs in WAL mode.
//!
//! ```no_run
//! use ratewindow::{Limiter, Rate};
//! use ratewindow_sqlite::SqliteBucket;
//! use std::sync::Arc;
//!
//! let bucket = SqliteBucket::builder(vec![Rate::new(10, 1_000).unwrap()])
//!     .path("/tmp/ratewindow.sqlite")
//!     .file_lock(true)
//!     .build()
//!     .unwrap();
//! let limiter = Limiter::new(Arc::new(bucket)).unwrap();
//! assert!(limiter.try_acquire("api", 1).unwrap());
//! ```

use ratewindow::bucket::BucketId;
use ratewindow::rate::validate_rate_list;
use ratewindow::{Bucket, Clock, FileLock, LimiterError, Rate, RateItem, SystemClock, TimedLock};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_TABLE: &str = "rate_bucket";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Map SQLite failures onto the limiter taxonomy: busy/locked databases are transient.
fn map_err(err: rusqlite::Error) -> LimiterError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => LimiterError::transient(err),
        _ => LimiterError::fatal(err),
    }
}

fn valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// `UNION ALL` of one windowed count per rate, tagged with the rate's position.
fn admission_sql(table: &str, rates: &[Rate]) -> String {
    rates
        .iter()
        .enumerate()
        .map(|(i, rate)| {
            format!("SELECT {} AS idx, COUNT(*) AS cnt FROM {} WHERE timestamp > ?1 - {}", i, table, rate.interval())
        })
        .collect::<Vec<_>>()
        .join(" UNION ALL ")
}

fn open_connection(path: Option<&Path>) -> Result<Connection, LimiterError> {
    let conn = match path {
        Some(path) => Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        ),
        None => Connection::open_in_memory(),
    }
    .map_err(map_err)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(map_err)?;
    Ok(conn)
}

/// Builder for [`SqliteBucket`].
#[derive(Debug, Clone)]
pub struct SqliteBucketBuilder {
    rates: Vec<Rate>,
    path: Option<PathBuf>,
    table: String,
    file_lock: bool,
}

impl SqliteBucketBuilder {
    /// Database file. Without one the bucket lives in a private in-memory database.
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Also hold an exclusive lock on `{path}.lock` around every operation, for processes that
    /// share the file without sharing a limiter.
    pub fn file_lock(mut self, enabled: bool) -> Self {
        self.file_lock = enabled;
        self
    }

    pub fn build(self) -> Result<SqliteBucket, LimiterError> {
        validate_rate_list(&self.rates)?;
        if !valid_identifier(&self.table) {
            return Err(LimiterError::InvalidConfig(format!("invalid table name {:?}", self.table)));
        }
        if self.file_lock && self.path.is_none() {
            return Err(LimiterError::InvalidConfig("file lock requires a database path".into()));
        }

        let conn = open_connection(self.path.as_deref())?;
        let index = format!("idx_{}_timestamp", self.table);
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0)).map_err(map_err)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (name TEXT, timestamp INTEGER);
             CREATE INDEX IF NOT EXISTS {index} ON {table} (timestamp);",
            table = self.table,
            index = index,
        ))
        .map_err(map_err)?;

        let lock = match (&self.path, self.file_lock) {
            (Some(path), true) => {
                let mut lock_path = path.clone().into_os_string();
                lock_path.push(".lock");
                Some(Arc::new(FileLock::open(PathBuf::from(lock_path)).map_err(LimiterError::fatal)?))
            }
            _ => None,
        };

        debug!(target: "ratewindow::sqlite", table = %self.table, path = ?self.path, file_lock = self.file_lock, "sqlite bucket ready");
        Ok(SqliteBucket {
            id: BucketId::next(),
            admission: admission_sql(&self.table, &self.rates),
            rates: self.rates,
            table: self.table,
            path: self.path,
            conn: Mutex::new(conn),
            lock,
            failing: Mutex::new(None),
        })
    }
}

struct Held<'a>(Option<&'a FileLock>);

impl Drop for Held<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.0 {
            lock.release();
        }
    }
}

/// Synchronous sliding-window bucket stored in SQLite.
#[derive(Debug)]
pub struct SqliteBucket {
    id: BucketId,
    rates: Vec<Rate>,
    table: String,
    path: Option<PathBuf>,
    admission: String,
    conn: Mutex<Connection>,
    lock: Option<Arc<FileLock>>,
    failing: Mutex<Option<Rate>>,
}

impl SqliteBucket {
    pub fn builder(rates: Vec<Rate>) -> SqliteBucketBuilder {
        SqliteBucketBuilder { rates, path: None, table: DEFAULT_TABLE.to_string(), file_lock: false }
    }

    /// Bucket in `path` using the default table, without a file lock.
    pub fn open(path: impl AsRef<Path>, rates: Vec<Rate>) -> Result<Self, LimiterError> {
        Self::builder(rates).path(path).build()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn with_conn<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T, LimiterError>) -> Result<T, LimiterError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let held = match &self.lock {
            Some(lock) => {
                if !lock.acquire_until(None) {
                    return Err(LimiterError::transient(format!("could not lock {}", lock.path().display())));
                }
                Held(Some(lock.as_ref()))
            }
            None => Held(None),
        };
        let out = op(&mut conn);
        drop(held);
        out
    }

    fn set_failing(&self, rate: Option<Rate>) {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner()) = rate;
    }
}

impl Bucket for SqliteBucket {
    fn id(&self) -> BucketId {
        self.id
    }

    fn rates(&self) -> &[Rate] {
        &self.rates
    }

    fn put(&self, item: &RateItem) -> Result<bool, LimiterError> {
        let failing = self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive).map_err(map_err)?;
            let counts = {
                let mut stmt = tx.prepare_cached(&self.admission).map_err(map_err)?;
                let rows = stmt
                    .query_map(params![item.timestamp()], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))
                    .map_err(map_err)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(map_err)?
            };
            let mut counts = counts;
            counts.sort_unstable_by_key(|(idx, _)| *idx);
            let failing = counts.iter().find_map(|&(idx, count)| {
                let rate = self.rates[idx as usize];
                (rate.limit().saturating_sub(count as u64) < item.weight()).then_some(rate)
            });
            if failing.is_some() {
                // dropping the transaction rolls it back
                return Ok(failing);
            }
            {
                let mut insert = tx
                    .prepare_cached(&format!("INSERT INTO {} (name, timestamp) VALUES (?1, ?2)", self.table))
                    .map_err(map_err)?;
                for _ in 0..item.weight() {
                    insert.execute(params![item.name(), item.timestamp()]).map_err(map_err)?;
                }
            }
            tx.commit().map_err(map_err)?;
            Ok(None)
        })?;
        self.set_failing(failing);
        Ok(failing.is_none())
    }

    fn count(&self) -> Result<u64, LimiterError> {
        self.with_conn(|conn| {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
                .map_err(map_err)
        })
    }

    fn peek(&self, index: u64) -> Result<Option<RateItem>, LimiterError> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT name, timestamp FROM {} ORDER BY timestamp DESC, rowid DESC LIMIT 1 OFFSET ?1", self.table),
                params![index as i64],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .map_err(map_err)
        })?;
        row.map(|(name, timestamp)| RateItem::new(name, timestamp, 1)).transpose()
    }

    fn leak(&self, now: i64) -> Result<u64, LimiterError> {
        let max_interval = self.rates.iter().map(|r| r.interval()).max().unwrap_or(0);
        let removed = self.with_conn(|conn| {
            conn.execute(&format!("DELETE FROM {} WHERE timestamp <= ?1", self.table), params![now - max_interval])
                .map_err(map_err)
        })?;
        if removed > 0 {
            debug!(target: "ratewindow::sqlite", table = %self.table, removed, "leaked expired rows");
        }
        Ok(removed as u64)
    }

    fn flush(&self) -> Result<(), LimiterError> {
        self.with_conn(|conn| conn.execute(&format!("DELETE FROM {}", self.table), []).map(|_| ()).map_err(map_err))?;
        self.set_failing(None);
        Ok(())
    }

    fn failing_rate(&self) -> Option<Rate> {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn limiter_lock(&self) -> Option<Arc<dyn TimedLock>> {
        self.lock.clone().map(|lock| lock as Arc<dyn TimedLock>)
    }
}

/// Clock read from SQLite (`julianday('now')`, epoch milliseconds).
///
/// Falls back to a local [`SystemClock`] when the query fails.
#[derive(Debug)]
pub struct SqliteClock {
    conn: Mutex<Connection>,
    fallback: SystemClock,
}

impl SqliteClock {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LimiterError> {
        Ok(Self { conn: Mutex::new(open_connection(Some(path.as_ref()))?), fallback: SystemClock::new() })
    }

    pub fn in_memory() -> Result<Self, LimiterError> {
        Ok(Self { conn: Mutex::new(open_connection(None)?), fallback: SystemClock::new() })
    }

    fn query(&self) -> rusqlite::Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row("SELECT CAST(ROUND((julianday('now') - 2440587.5) * 86400000.0) AS INTEGER)", [], |row| {
            row.get(0)
        })
    }
}

impl Clock for SqliteClock {
    fn now_millis(&self) -> i64 {
        match self.query() {
            Ok(ms) => ms,
            Err(err) => {
                warn!(target: "ratewindow::sqlite", error = %err, "sqlite clock query failed; using local time");
                self.fallback.now_millis()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_restricted() {
        assert!(valid_identifier("rate_bucket"));
        assert!(valid_identifier("Bucket2"));
        assert!(!valid_identifier(""));
        assert!(!valid_identifier("2fast"));
        assert!(!valid_identifier("drop table;"));
        assert!(!valid_identifier("a-b"));
    }

    #[test]
    fn admission_query_counts_every_rate() {
        let rates = vec![Rate::new(5, 1_000).unwrap(), Rate::new(50, 60_000).unwrap()];
        let sql = admission_sql("t", &rates);
        assert_eq!(
            sql,
            "SELECT 0 AS idx, COUNT(*) AS cnt FROM t WHERE timestamp > ?1 - 1000 UNION ALL \
             SELECT 1 AS idx, COUNT(*) AS cnt FROM t WHERE timestamp > ?1 - 60000"
        );
    }

    #[test]
    fn busy_errors_are_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error { code: ErrorCode::DatabaseBusy, extended_code: 5 },
            None,
        );
        assert!(map_err(busy).is_transient());
        assert!(map_err(rusqlite::Error::QueryReturnedNoRows).is_fatal());
    }

    #[test]
    fn clock_reads_epoch_millis() {
        let clock = SqliteClock::in_memory().unwrap();
        let local = SystemClock::new().now_millis();
        assert!((clock.now_millis() - local).abs() < 5_000);
    }
}
