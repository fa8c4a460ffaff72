//! Record identifiers and timestamps.

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Process-wide record id counter.
///
/// Seeded from the sink's existing size so ids continue past whatever a
/// previous run already appended. The epoch is the sink file's time and is
/// embedded in every rendered id.
#[derive(Debug, Default)]
pub struct RecordIdGenerator {
    counter: AtomicU64,
    epoch: AtomicI64,
}

impl RecordIdGenerator {
    pub fn new(seed: u64, epoch: DateTime<Utc>) -> Self {
        let ids = Self::default();
        ids.init(seed, epoch);
        ids
    }

    /// Reset the counter to `seed` and the epoch to `epoch`.
    pub fn init(&self, seed: u64, epoch: DateTime<Utc>) {
        self.counter.store(seed, Ordering::SeqCst);
        self.set_epoch(epoch);
    }

    /// Replace the epoch after the sink rotated. The counter keeps going.
    pub fn set_epoch(&self, epoch: DateTime<Utc>) {
        self.epoch.store(epoch.timestamp(), Ordering::SeqCst);
    }

    pub fn epoch(&self) -> DateTime<Utc> {
        epoch_from_secs(self.epoch.load(Ordering::SeqCst))
    }

    /// Increment and return the counter.
    pub fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Allocate the next [`RecordId`].
    pub fn next_record_id(&self) -> RecordId {
        RecordId {
            seq: self.next_id(),
            epoch: self.epoch(),
        }
    }

    /// An id with the widest possible rendering under the current epoch,
    /// used when sizing a record before an id is allocated.
    pub fn widest(&self) -> RecordId {
        RecordId {
            seq: u64::MAX,
            epoch: self.epoch(),
        }
    }
}

fn epoch_from_secs(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// A rendered record id: `<seq>_<epoch>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordId {
    pub seq: u64,
    pub epoch: DateTime<Utc>,
}

impl RecordId {
    /// Upper bound of the rendered width for four-digit years.
    pub const MAX_LEN: usize = 40;
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.seq, self.epoch.format(TIME_FORMAT))
    }
}

/// A record timestamp rendered as `YYYY-MM-DDTHH:MM:SS UTC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    pub const LEN: usize = 23;

    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn from_secs(secs: i64) -> Self {
        Self(epoch_from_secs(secs))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} UTC", self.0.format(TIME_FORMAT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2016, 3, 1, 12, 30, 5).unwrap()
    }

    #[test]
    fn test_seeded_counter() {
        let ids = RecordIdGenerator::new(1024, epoch());
        assert_eq!(ids.next_id(), 1025);
        assert_eq!(ids.next_id(), 1026);
    }

    #[test]
    fn test_record_id_display() {
        let ids = RecordIdGenerator::new(7, epoch());
        assert_eq!(ids.next_record_id().to_string(), "8_2016-03-01T12:30:05");
    }

    #[test]
    fn test_widest_bounds_width() {
        let ids = RecordIdGenerator::new(0, epoch());
        assert_eq!(ids.widest().to_string().len(), RecordId::MAX_LEN);
    }

    #[test]
    fn test_epoch_change_keeps_counter() {
        let ids = RecordIdGenerator::new(10, epoch());
        ids.next_id();
        ids.set_epoch(Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap());
        let id = ids.next_record_id();
        assert_eq!(id.seq, 12);
        assert_eq!(id.to_string(), "12_2017-01-01T00:00:00");
    }

    #[test]
    fn test_timestamp_display() {
        let ts = Timestamp(epoch());
        assert_eq!(ts.to_string(), "2016-03-01T12:30:05 UTC");
        assert_eq!(ts.to_string().len(), Timestamp::LEN);
    }

    #[test]
    fn test_concurrent_ids_unique_and_increasing() {
        let ids = Arc::new(RecordIdGenerator::new(0, epoch()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || {
                    let taken: Vec<u64> = (0..1000).map(|_| ids.next_id()).collect();
                    assert!(taken.windows(2).all(|w| w[0] < w[1]));
                    taken
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id));
            }
        }
        assert_eq!(all.len(), 8000);
        assert_eq!(all.iter().max(), Some(&8000));
    }
}
