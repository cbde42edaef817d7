use super::{Bucket, BucketId, SlidingLog};
use crate::rate::{validate_rate_list, Rate, RateItem};
use crate::LimiterError;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct State {
    log: SlidingLog,
    failing: Option<Rate>,
}

/// Process-local bucket: a mutex-guarded sliding log.
///
/// ```
/// use ratewindow::{Bucket, InMemoryBucket, Rate, RateItem};
/// let bucket = InMemoryBucket::new(vec![Rate::new(2, 1_000).unwrap()]).unwrap();
/// assert!(bucket.put(&RateItem::new("a", 0, 2).unwrap()).unwrap());
/// assert!(!bucket.put(&RateItem::new("a", 500, 1).unwrap()).unwrap());
/// assert_eq!(bucket.waiting(&RateItem::new("a", 500, 1).unwrap()).unwrap(), 500);
/// ```
#[derive(Debug)]
pub struct InMemoryBucket {
    id: BucketId,
    rates: Vec<Rate>,
    state: Mutex<State>,
}

impl InMemoryBucket {
    pub fn new(rates: Vec<Rate>) -> Result<Self, LimiterError> {
        validate_rate_list(&rates)?;
        Ok(Self { id: BucketId::next(), rates, state: Mutex::new(State::default()) })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the stored entries, oldest first.
    pub fn items(&self) -> Vec<RateItem> {
        self.state().log.items().to_vec()
    }
}

impl Bucket for InMemoryBucket {
    fn id(&self) -> BucketId {
        self.id
    }

    fn rates(&self) -> &[Rate] {
        &self.rates
    }

    fn put(&self, item: &RateItem) -> Result<bool, LimiterError> {
        let mut state = self.state();
        let admitted = state.log.admit(&self.rates, item);
        state.failing = admitted.err();
        Ok(admitted.is_ok())
    }

    fn count(&self) -> Result<u64, LimiterError> {
        Ok(self.state().log.len() as u64)
    }

    fn peek(&self, index: u64) -> Result<Option<RateItem>, LimiterError> {
        Ok(self.state().log.peek(index))
    }

    fn leak(&self, now: i64) -> Result<u64, LimiterError> {
        Ok(self.state().log.leak(&self.rates, now))
    }

    fn flush(&self) -> Result<(), LimiterError> {
        let mut state = self.state();
        state.log.clear();
        state.failing = None;
        Ok(())
    }

    fn failing_rate(&self) -> Option<Rate> {
        self.state().failing
    }

    fn waiting(&self, item: &RateItem) -> Result<i64, LimiterError> {
        let state = self.state();
        let bound = super::waiting_index(state.failing, item).and_then(|i| state.log.peek(i));
        Ok(super::waiting_from(state.failing, item, bound.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn item(ts: i64, weight: u64) -> RateItem {
        RateItem::new("item", ts, weight).unwrap()
    }

    fn bucket(pairs: &[(u64, i64)]) -> InMemoryBucket {
        InMemoryBucket::new(pairs.iter().map(|&(l, i)| Rate::new(l, i).unwrap()).collect()).unwrap()
    }

    #[test]
    fn rejects_invalid_rate_lists() {
        assert!(InMemoryBucket::new(vec![]).unwrap_err().is_invalid_config());
        let rates = vec![Rate::new(2, 10).unwrap(), Rate::new(2, 20).unwrap()];
        assert!(InMemoryBucket::new(rates).is_err());
    }

    #[test]
    fn basic_weighted_admission() {
        let bucket = bucket(&[(20, 1_000)]);
        let rate = bucket.rates()[0];
        let mut expected_counts = vec![1, 11, 20].into_iter();

        for (ts, weight, admitted) in [(0, 1, true), (1, 10, true), (2, 20, false), (3, 9, true), (4, 1, false)] {
            assert_eq!(bucket.put(&item(ts, weight)).unwrap(), admitted, "weight {}", weight);
            if admitted {
                assert_eq!(bucket.count().unwrap(), expected_counts.next().unwrap());
                assert_eq!(bucket.failing_rate(), None);
            } else {
                assert_eq!(bucket.failing_rate(), Some(rate));
            }
        }
    }

    #[test]
    fn waiting_points_at_the_item_that_must_expire() {
        let bucket = bucket(&[(3, 1_000)]);
        for ts in [100, 200, 300] {
            assert!(bucket.put(&item(ts, 1)).unwrap());
        }
        let candidate = item(400, 1);
        assert!(!bucket.put(&candidate).unwrap());
        assert_eq!(bucket.waiting(&candidate).unwrap(), 700);

        let heavier = item(400, 2);
        assert!(!bucket.put(&heavier).unwrap());
        assert_eq!(bucket.waiting(&heavier).unwrap(), 800);

        // sleeping exactly the wait is enough
        assert!(bucket.put(&item(400 + 700, 1)).unwrap());
    }

    #[test]
    fn weight_above_every_limit_never_fits() {
        let bucket = bucket(&[(5, 1_000), (10, 60_000)]);
        let heavy = item(0, 11);
        assert!(!bucket.put(&heavy).unwrap());
        assert_eq!(bucket.waiting(&heavy).unwrap(), -1);
        assert_eq!(bucket.count().unwrap(), 0);
    }

    #[test]
    fn waiting_is_zero_without_failure() {
        let bucket = bucket(&[(5, 1_000)]);
        assert_eq!(bucket.waiting(&item(0, 1)).unwrap(), 0);
    }

    #[test]
    fn waiting_is_accurate_before_leak_runs() {
        let bucket = bucket(&[(2, 100), (4, 1_000)]);
        for ts in [0, 0, 500, 500] {
            assert!(bucket.put(&item(ts, 1)).unwrap());
        }
        // 1s window is full; two entries at 0 are still stored long after the 100ms window
        let candidate = item(900, 1);
        assert!(!bucket.put(&candidate).unwrap());
        let wait = bucket.waiting(&candidate).unwrap();
        assert_eq!(wait, 100);
        assert!(bucket.put(&item(900 + wait, 1)).unwrap());
        assert_eq!(bucket.count().unwrap(), 5);
    }

    #[test]
    fn leak_and_flush() {
        let bucket = bucket(&[(10, 100), (20, 1_000)]);
        for ts in [0, 400, 800, 1_200] {
            assert!(bucket.put(&item(ts, 1)).unwrap());
        }
        assert_eq!(bucket.leak(1_400).unwrap(), 2);
        assert_eq!(bucket.leak(1_400).unwrap(), 0);
        assert_eq!(bucket.count().unwrap(), 2);
        assert_eq!(bucket.peek(0).unwrap().unwrap().timestamp(), 1_200);

        assert!(!bucket.put(&item(1_200, 11)).unwrap());
        bucket.flush().unwrap();
        assert_eq!(bucket.count().unwrap(), 0);
        assert_eq!(bucket.failing_rate(), None);
    }

    #[test]
    fn concurrent_puts_never_overfill() {
        let bucket = Arc::new(bucket(&[(50, 1_000)]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = bucket.clone();
                std::thread::spawn(move || (0..20).filter(|_| bucket.put(&item(10, 1)).unwrap()).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
        assert_eq!(bucket.count().unwrap(), 50);
    }
}
