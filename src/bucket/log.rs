use crate::rate::{binary_search, max_interval, Rate, RateItem};

/// Timestamp-ordered log of weight units and the sliding-window admission check over it.
///
/// Each stored entry is one weight unit; admitting an item of weight `w` stores `w` copies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlidingLog {
    items: Vec<RateItem>,
}

impl SlidingLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from entries that are already in timestamp order.
    pub fn from_sorted(items: Vec<RateItem>) -> Self {
        debug_assert!(items.windows(2).all(|w| w[0].timestamp() <= w[1].timestamp()));
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[RateItem] {
        &self.items
    }

    pub fn newest_timestamp(&self) -> Option<i64> {
        self.items.last().map(RateItem::timestamp)
    }

    /// First rate that `item` would violate, if any.
    ///
    /// Only entries inside `(item.timestamp - interval, item.timestamp]` are counted, so expired
    /// entries that have not been leaked yet never cause a rejection.
    pub fn check(&self, rates: &[Rate], item: &RateItem) -> Option<Rate> {
        let len = self.items.len() as u64;
        for rate in rates {
            if len.saturating_add(item.weight()) <= rate.limit() {
                continue;
            }
            let lower = binary_search(&self.items, item.timestamp() - rate.interval() + 1);
            let in_window = if lower < 0 { 0 } else { len - lower as u64 };
            if rate.limit().saturating_sub(in_window) < item.weight() {
                return Some(*rate);
            }
        }
        None
    }

    /// Insert `weight` copies of `item`, keeping timestamp order.
    pub fn insert(&mut self, item: &RateItem) {
        let copies = usize::try_from(item.weight()).unwrap_or(usize::MAX);
        let at = match self.newest_timestamp() {
            Some(newest) if item.timestamp() < newest => {
                self.items.partition_point(|i| i.timestamp() <= item.timestamp())
            }
            _ => self.items.len(),
        };
        self.items.splice(at..at, std::iter::repeat(item.clone()).take(copies));
    }

    /// Check and insert in one step; `Err` carries the violated rate.
    pub fn admit(&mut self, rates: &[Rate], item: &RateItem) -> Result<(), Rate> {
        match self.check(rates, item) {
            Some(rate) => Err(rate),
            None => {
                self.insert(item);
                Ok(())
            }
        }
    }

    pub fn peek(&self, index: u64) -> Option<RateItem> {
        let index = usize::try_from(index).ok()?;
        let len = self.items.len();
        if index >= len {
            return None;
        }
        Some(self.items[len - 1 - index].clone())
    }

    /// Drop entries with `timestamp <= now - max_interval(rates)`.
    pub fn leak(&mut self, rates: &[Rate], now: i64) -> u64 {
        let lower = now - max_interval(rates);
        let cut = self.items.partition_point(|i| i.timestamp() <= lower);
        self.items.drain(..cut);
        cut as u64
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(ts: i64, weight: u64) -> RateItem {
        RateItem::new("k", ts, weight).unwrap()
    }

    fn rates(pairs: &[(u64, i64)]) -> Vec<Rate> {
        pairs.iter().map(|&(l, i)| Rate::new(l, i).unwrap()).collect()
    }

    #[test]
    fn admission_counts_only_the_open_window() {
        let rates = rates(&[(3, 100)]);
        let mut log = SlidingLog::new();
        for ts in [0, 10, 20] {
            assert!(log.admit(&rates, &item(ts, 1)).is_ok());
        }
        assert_eq!(log.admit(&rates, &item(99, 1)), Err(rates[0]));
        // window is (t - interval, t]: the entry at 0 is out at t = 100
        assert!(log.admit(&rates, &item(100, 1)).is_ok());
        assert_eq!(log.len(), 4);
    }

    #[test]
    fn unleaked_entries_do_not_block() {
        let rates = rates(&[(2, 100), (4, 1_000)]);
        let mut log = SlidingLog::new();
        for ts in [0, 0, 500, 500] {
            log.insert(&item(ts, 1));
        }
        // the 1s rate still sees four entries
        assert_eq!(log.check(&rates, &item(900, 1)), Some(rates[1]));
        // at 1_000 the two oldest have expired without being leaked
        assert!(log.admit(&rates, &item(1_000, 2)).is_ok());
        assert_eq!(log.len(), 6);
        assert_eq!(log.leak(&rates, 1_000), 2);
    }

    #[test]
    fn huge_weight_is_rejected_without_overflow() {
        let rates = rates(&[(10, 1_000)]);
        let mut log = SlidingLog::new();
        assert!(log.admit(&rates, &item(0, 1)).is_ok());
        assert_eq!(log.admit(&rates, &item(1, u64::MAX)), Err(rates[0]));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn heavy_item_rejected_on_empty_log() {
        let rates = rates(&[(5, 100)]);
        let log = SlidingLog::new();
        assert_eq!(log.check(&rates, &item(0, 6)), Some(rates[0]));
        assert_eq!(log.check(&rates, &item(0, 5)), None);
    }

    #[test]
    fn out_of_order_insert_keeps_order() {
        let mut log = SlidingLog::new();
        log.insert(&item(10, 1));
        log.insert(&item(30, 1));
        log.insert(&item(20, 2));
        let ts: Vec<i64> = log.items().iter().map(RateItem::timestamp).collect();
        assert_eq!(ts, vec![10, 20, 20, 30]);
        assert_eq!(log.peek(0).unwrap().timestamp(), 30);
        assert_eq!(log.peek(3).unwrap().timestamp(), 10);
        assert!(log.peek(4).is_none());
    }

    #[test]
    fn leak_is_idempotent() {
        let rates = rates(&[(10, 100)]);
        let mut log = SlidingLog::new();
        for ts in [0, 50, 100, 150] {
            log.insert(&item(ts, 1));
        }
        assert_eq!(log.leak(&rates, 150), 2);
        let after = log.clone();
        assert_eq!(log.leak(&rates, 150), 0);
        assert_eq!(log, after);
    }
}
