//! Postgres bucket for `ratewindow` (companion crate).
//!
//! Items live in `ratelimit___{table}` as `(name TEXT, item_timestamp TIMESTAMPTZ, weight INTEGER)`,
//! one row per acquisition. Admission runs in a `READ COMMITTED` transaction that first takes
//! `SHARE ROW EXCLUSIVE` on the table: writers queue behind one another while plain readers
//! (count, peek) are never blocked, so the windowed sums and the insert commit as one step.
//!
//! Bring your own `deadpool_postgres::Pool`.

use async_trait::async_trait;
use deadpool_postgres::{Pool, PoolError};
use ratewindow::bucket::BucketId;
use ratewindow::rate::validate_rate_list;
use ratewindow::{AsyncBucket, AsyncClock, Clock, LimiterError, Rate, RateItem, SystemClock};
use std::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tracing::{debug, warn};

pub const TABLE_PREFIX: &str = "ratelimit___";

fn map_pg(err: tokio_postgres::Error) -> LimiterError {
    let transient = match err.code() {
        Some(code) => {
            *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::LOCK_NOT_AVAILABLE
                || *code == SqlState::ADMIN_SHUTDOWN
                || *code == SqlState::CANNOT_CONNECT_NOW
        }
        // no SQLSTATE: the connection itself failed
        None => true,
    };
    if transient {
        LimiterError::transient(err)
    } else {
        LimiterError::fatal(err)
    }
}

fn map_pool(err: PoolError) -> LimiterError {
    match err {
        PoolError::Backend(err) => map_pg(err),
        other => LimiterError::transient(other),
    }
}

fn valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && TABLE_PREFIX.len() + name.len() <= 63
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Milliseconds to the `float8` seconds `to_timestamp` expects.
fn seconds(ms: i64) -> f64 {
    ms as f64 / 1_000.0
}

/// One `SUM(weight)` per rate over `(bound_i, +inf)`, evaluated in a single scan.
fn admission_sql(table: &str, rates: &[Rate]) -> String {
    let sums = (1..=rates.len())
        .map(|i| format!("COALESCE(SUM(weight) FILTER (WHERE item_timestamp > to_timestamp(${}::float8)), 0)::BIGINT", i))
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT {} FROM {}", sums, table)
}

/// First rate whose window, already holding `used[i]` units, has no room for `weight`.
fn first_failing(rates: &[Rate], used: impl IntoIterator<Item = u64>, weight: u64) -> Option<Rate> {
    rates.iter().zip(used).find_map(|(rate, used)| (rate.limit().saturating_sub(used) < weight).then_some(*rate))
}

/// Async sliding-window bucket stored in Postgres.
pub struct PostgresBucket {
    id: BucketId,
    rates: Vec<Rate>,
    table: String,
    admission: String,
    pool: Pool,
    failing: Mutex<Option<Rate>>,
}

impl std::fmt::Debug for PostgresBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBucket")
            .field("table", &self.table)
            .field("rates", &self.rates)
            .field("pool", &"<deadpool_postgres::Pool>")
            .finish()
    }
}

impl PostgresBucket {
    /// Create `ratelimit___{table}` (and its timestamp index) if missing.
    pub async fn new(pool: Pool, table: &str, rates: Vec<Rate>) -> Result<Self, LimiterError> {
        validate_rate_list(&rates)?;
        if !valid_identifier(table) {
            return Err(LimiterError::InvalidConfig(format!("invalid table name {:?}", table)));
        }
        let full = format!("{}{}", TABLE_PREFIX, table);
        let client = pool.get().await.map_err(map_pool)?;
        client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {full} (name TEXT, item_timestamp TIMESTAMPTZ, weight INTEGER);
                 CREATE INDEX IF NOT EXISTS idx_{full}_ts ON {full} (item_timestamp);",
                full = full
            ))
            .await
            .map_err(map_pg)?;
        debug!(target: "ratewindow::postgres", table = %full, "postgres bucket ready");
        Ok(Self {
            id: BucketId::next(),
            admission: admission_sql(&full, &rates),
            rates,
            table: full,
            pool,
            failing: Mutex::new(None),
        })
    }

    /// Full table name, prefix included.
    pub fn table(&self) -> &str {
        &self.table
    }

    fn set_failing(&self, rate: Option<Rate>) {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner()) = rate;
    }
}

#[async_trait]
impl AsyncBucket for PostgresBucket {
    fn id(&self) -> BucketId {
        self.id
    }

    fn rates(&self) -> &[Rate] {
        &self.rates
    }

    async fn put(&self, item: &RateItem) -> Result<bool, LimiterError> {
        let mut client = self.pool.get().await.map_err(map_pool)?;
        let tx = client.transaction().await.map_err(map_pg)?;
        tx.batch_execute(&format!("LOCK TABLE {} IN SHARE ROW EXCLUSIVE MODE", self.table))
            .await
            .map_err(map_pg)?;

        let bounds: Vec<f64> = self.rates.iter().map(|r| seconds(item.timestamp() - r.interval())).collect();
        let params: Vec<&(dyn ToSql + Sync)> = bounds.iter().map(|b| b as &(dyn ToSql + Sync)).collect();
        let row = tx.query_one(self.admission.as_str(), &params).await.map_err(map_pg)?;
        let used = (0..self.rates.len()).map(|i| row.get::<_, i64>(i).max(0) as u64);
        let failing = first_failing(&self.rates, used, item.weight());

        if failing.is_none() {
            let weight = i32::try_from(item.weight()).map_err(|_| {
                LimiterError::InvalidConfig(format!("weight {} does not fit an INTEGER column", item.weight()))
            })?;
            tx.execute(
                format!("INSERT INTO {} (name, item_timestamp, weight) VALUES ($1, to_timestamp($2::float8), $3)", self.table)
                    .as_str(),
                &[&item.name(), &seconds(item.timestamp()), &weight],
            )
            .await
            .map_err(map_pg)?;
            tx.commit().await.map_err(map_pg)?;
        } else {
            tx.rollback().await.map_err(map_pg)?;
        }
        self.set_failing(failing);
        Ok(failing.is_none())
    }

    async fn count(&self) -> Result<u64, LimiterError> {
        let client = self.pool.get().await.map_err(map_pool)?;
        let row = client
            .query_one(format!("SELECT COALESCE(SUM(weight), 0)::BIGINT FROM {}", self.table).as_str(), &[])
            .await
            .map_err(map_pg)?;
        Ok(row.get::<_, i64>(0).max(0) as u64)
    }

    async fn peek(&self, index: u64) -> Result<Option<RateItem>, LimiterError> {
        let client = self.pool.get().await.map_err(map_pool)?;
        let sql = format!(
            "SELECT name, (EXTRACT(EPOCH FROM item_timestamp) * 1000)::BIGINT, weight FROM (
                 SELECT name, item_timestamp, weight,
                        SUM(weight) OVER (ORDER BY item_timestamp DESC, ctid DESC ROWS UNBOUNDED PRECEDING) AS acc
                 FROM {}
             ) ranked WHERE acc > $1 ORDER BY acc LIMIT 1",
            self.table
        );
        let row = client.query_opt(sql.as_str(), &[&(index as i64)]).await.map_err(map_pg)?;
        row.map(|row| {
            let name: String = row.get(0);
            let weight: i32 = row.get(2);
            RateItem::new(name, row.get::<_, i64>(1), weight.max(1) as u64)
        })
        .transpose()
    }

    async fn leak(&self, now: i64) -> Result<u64, LimiterError> {
        let max_interval = self.rates.iter().map(|r| r.interval()).max().unwrap_or(0);
        let client = self.pool.get().await.map_err(map_pool)?;
        let sql = format!(
            "WITH gone AS (DELETE FROM {} WHERE item_timestamp <= to_timestamp($1::float8) RETURNING weight)
             SELECT COALESCE(SUM(weight), 0)::BIGINT FROM gone",
            self.table
        );
        let row = client.query_one(sql.as_str(), &[&seconds(now - max_interval)]).await.map_err(map_pg)?;
        let removed = row.get::<_, i64>(0).max(0) as u64;
        if removed > 0 {
            debug!(target: "ratewindow::postgres", table = %self.table, removed, "leaked expired rows");
        }
        Ok(removed)
    }

    async fn flush(&self) -> Result<(), LimiterError> {
        let client = self.pool.get().await.map_err(map_pool)?;
        client.batch_execute(&format!("DELETE FROM {}", self.table)).await.map_err(map_pg)?;
        self.set_failing(None);
        Ok(())
    }

    fn failing_rate(&self) -> Option<Rate> {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Clock read from Postgres (`EXTRACT(EPOCH FROM NOW())`), in epoch milliseconds.
///
/// Falls back to a local [`SystemClock`] when the query fails.
pub struct PostgresClock {
    pool: Pool,
    fallback: SystemClock,
}

impl std::fmt::Debug for PostgresClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresClock").field("pool", &"<deadpool_postgres::Pool>").finish()
    }
}

impl PostgresClock {
    pub fn new(pool: Pool) -> Self {
        Self { pool, fallback: SystemClock::new() }
    }

    async fn query(&self) -> Result<i64, LimiterError> {
        let client = self.pool.get().await.map_err(map_pool)?;
        let row = client
            .query_one("SELECT (EXTRACT(EPOCH FROM NOW()) * 1000)::BIGINT", &[])
            .await
            .map_err(map_pg)?;
        Ok(row.get(0))
    }
}

#[async_trait]
impl AsyncClock for PostgresClock {
    async fn now_millis(&self) -> i64 {
        match self.query().await {
            Ok(ms) => ms,
            Err(err) => {
                warn!(target: "ratewindow::postgres", error = %err, "postgres clock query failed; using local time");
                self.fallback.now_millis()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_restricted() {
        assert!(valid_identifier("api_calls"));
        assert!(valid_identifier("b2"));
        assert!(!valid_identifier("Api"));
        assert!(!valid_identifier("x; drop"));
        assert!(!valid_identifier(&"a".repeat(60)));
    }

    #[test]
    fn admission_sums_one_filter_per_rate() {
        let rates = vec![Rate::new(5, 1_000).unwrap(), Rate::new(50, 60_000).unwrap()];
        let sql = admission_sql("ratelimit___t", &rates);
        assert!(sql.starts_with("SELECT COALESCE(SUM(weight) FILTER (WHERE item_timestamp > to_timestamp($1::float8)), 0)::BIGINT, "));
        assert!(sql.contains("to_timestamp($2::float8)"));
        assert!(sql.ends_with(" FROM ratelimit___t"));
    }

    #[test]
    fn oversized_weight_fails_the_tightest_rate() {
        let rates = vec![Rate::new(20, 1_000).unwrap(), Rate::new(100, 60_000).unwrap()];
        assert_eq!(first_failing(&rates, [0, 0], u64::MAX), Some(rates[0]));
        assert_eq!(first_failing(&rates, [0, 0], i32::MAX as u64 + 1), Some(rates[0]));
        assert_eq!(first_failing(&rates, [19, 95], 1), None);
        assert_eq!(first_failing(&rates, [10, 95], 6), Some(rates[1]));

        // the default waiting answer for such a rejection is the capacity sentinel
        let item = RateItem::new("pg", 0, u64::MAX).unwrap();
        assert_eq!(ratewindow::bucket::waiting_from(Some(rates[0]), &item, None), -1);
    }

    #[test]
    fn millis_convert_to_seconds() {
        assert_eq!(seconds(1_500), 1.5);
        assert_eq!(seconds(-250), -0.25);
    }
}
