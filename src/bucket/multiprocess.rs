use super::{Bucket, BucketId, SlidingLog};
use crate::lock::{FileLock, TimedLock};
use crate::rate::{validate_rate_list, Rate, RateItem};
use crate::LimiterError;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

const HEADER_LEN: usize = 8 + 8 + 4;

/// Bucket whose log lives in a file shared by every process that opens the same path.
///
/// All access is serialized by an exclusive lock on `{path}.lock`, which is also handed to the
/// limiter through [`Bucket::limiter_lock`]. Each record stores one weight unit as
/// `i64 timestamp | u64 weight | u32 name length | name bytes`, little endian.
#[derive(Debug)]
pub struct MultiprocessBucket {
    id: BucketId,
    rates: Vec<Rate>,
    path: PathBuf,
    lock: Arc<FileLock>,
    io: Mutex<()>,
    failing: Mutex<Option<Rate>>,
}

impl MultiprocessBucket {
    /// Open (creating if needed) the shared log at `path`.
    pub fn open(path: impl AsRef<Path>, rates: Vec<Rate>) -> Result<Self, LimiterError> {
        validate_rate_list(&rates)?;
        let path = path.as_ref().to_path_buf();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(LimiterError::fatal)?;
        let lock = FileLock::open(lock_path(&path)).map_err(LimiterError::fatal)?;
        Ok(Self {
            id: BucketId::next(),
            rates,
            path,
            lock: Arc::new(lock),
            io: Mutex::new(()),
            failing: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the shared log, oldest first.
    pub fn items(&self) -> Result<Vec<RateItem>, LimiterError> {
        self.locked(|| Ok(self.read_log()?.items().to_vec()))
    }

    fn locked<T>(&self, op: impl FnOnce() -> Result<T, LimiterError>) -> Result<T, LimiterError> {
        let _io = self.io.lock().unwrap_or_else(|e| e.into_inner());
        if !self.lock.acquire_until(None) {
            return Err(LimiterError::transient(format!(
                "could not lock {}",
                self.lock.path().display()
            )));
        }
        let _held = Held(&self.lock);
        op()
    }

    fn read_log(&self) -> Result<SlidingLog, LimiterError> {
        let mut bytes = Vec::new();
        File::open(&self.path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(LimiterError::transient)?;
        decode(&bytes).map(SlidingLog::from_sorted)
    }

    fn append(&self, item: &RateItem) -> Result<(), LimiterError> {
        let mut file = OpenOptions::new().append(true).open(&self.path).map_err(LimiterError::transient)?;
        let mut buf = Vec::new();
        for _ in 0..item.weight() {
            encode_unit(&mut buf, item);
        }
        file.write_all(&buf).map_err(LimiterError::transient)
    }

    fn rewrite(&self, log: &SlidingLog) -> Result<(), LimiterError> {
        let mut buf = Vec::with_capacity(log.len() * (HEADER_LEN + 8));
        for item in log.items() {
            encode_unit(&mut buf, item);
        }
        let tmp = sibling(&self.path, ".tmp");
        let write = || -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_data()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(LimiterError::transient)
    }

    fn set_failing(&self, rate: Option<Rate>) {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner()) = rate;
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn lock_path(path: &Path) -> PathBuf {
    sibling(path, ".lock")
}

/// Releases one hold on the file lock when dropped.
struct Held<'a>(&'a FileLock);

impl Drop for Held<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

fn encode_unit(buf: &mut Vec<u8>, item: &RateItem) {
    let name = item.name().as_bytes();
    buf.extend_from_slice(&item.timestamp().to_le_bytes());
    buf.extend_from_slice(&item.weight().to_le_bytes());
    buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
    buf.extend_from_slice(name);
}

fn corrupt(offset: usize, what: &str) -> LimiterError {
    LimiterError::fatal(format!("corrupt shared log at byte {}: {}", offset, what))
}

fn decode(bytes: &[u8]) -> Result<Vec<RateItem>, LimiterError> {
    let mut items = Vec::new();
    let mut at = 0;
    while at < bytes.len() {
        let header = bytes.get(at..at + HEADER_LEN).ok_or_else(|| corrupt(at, "truncated header"))?;
        let (ts, rest) = header.split_at(8);
        let (weight, len) = rest.split_at(8);
        let ts = i64::from_le_bytes(ts.try_into().map_err(|_| corrupt(at, "timestamp"))?);
        let weight = u64::from_le_bytes(weight.try_into().map_err(|_| corrupt(at, "weight"))?);
        let len = u32::from_le_bytes(len.try_into().map_err(|_| corrupt(at, "name length"))?) as usize;

        let start = at + HEADER_LEN;
        let name = bytes.get(start..start + len).ok_or_else(|| corrupt(at, "truncated name"))?;
        let name = std::str::from_utf8(name).map_err(|_| corrupt(at, "name is not utf-8"))?;
        if items.last().is_some_and(|prev: &RateItem| prev.timestamp() > ts) {
            return Err(corrupt(at, "timestamps out of order"));
        }
        items.push(RateItem::new(name, ts, weight).map_err(|_| corrupt(at, "zero weight"))?);
        at = start + len;
    }
    Ok(items)
}

impl Bucket for MultiprocessBucket {
    fn id(&self) -> BucketId {
        self.id
    }

    fn rates(&self) -> &[Rate] {
        &self.rates
    }

    fn put(&self, item: &RateItem) -> Result<bool, LimiterError> {
        self.locked(|| {
            let mut log = self.read_log()?;
            if let Some(rate) = log.check(&self.rates, item) {
                self.set_failing(Some(rate));
                return Ok(false);
            }
            match log.newest_timestamp() {
                Some(newest) if item.timestamp() < newest => {
                    log.insert(item);
                    self.rewrite(&log)?;
                }
                _ => self.append(item)?,
            }
            self.set_failing(None);
            Ok(true)
        })
    }

    fn count(&self) -> Result<u64, LimiterError> {
        self.locked(|| Ok(self.read_log()?.len() as u64))
    }

    fn peek(&self, index: u64) -> Result<Option<RateItem>, LimiterError> {
        self.locked(|| Ok(self.read_log()?.peek(index)))
    }

    fn leak(&self, now: i64) -> Result<u64, LimiterError> {
        self.locked(|| {
            let mut log = self.read_log()?;
            let removed = log.leak(&self.rates, now);
            if removed > 0 {
                self.rewrite(&log)?;
                debug!(target: "ratewindow::bucket", path = %self.path.display(), removed, "leaked shared log");
            }
            Ok(removed)
        })
    }

    fn flush(&self) -> Result<(), LimiterError> {
        self.locked(|| {
            File::create(&self.path).map_err(LimiterError::transient)?;
            self.set_failing(None);
            Ok(())
        })
    }

    fn failing_rate(&self) -> Option<Rate> {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn limiter_lock(&self) -> Option<Arc<dyn TimedLock>> {
        Some(self.lock.clone())
    }
}
