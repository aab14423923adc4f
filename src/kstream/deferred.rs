// src/kstream/deferred.rs

//! Allocation events parked until their close event supplies the object name.
//!
//! Keyed by kernel object address. One pending event per address; a newer
//! event for the same address replaces the older one.

use chrono::{DateTime, Duration, Utc};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::kevent::Kevent;

#[derive(Debug, Default)]
pub struct DeferredBuffer {
    pending: Mutex<HashMap<u64, Kevent>>,
}

impl DeferredBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Kevent>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Parks `kevt` under `object`, returning the event it displaced.
    pub fn defer(&self, object: u64, kevt: Kevent) -> Option<Kevent> {
        self.lock().insert(object, kevt)
    }

    pub fn resolve(&self, object: u64) -> Option<Kevent> {
        self.lock().remove(&object)
    }

    /// Discards every entry whose event is older than `max_age` at `now`.
    /// Returns the number discarded.
    pub fn sweep(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|_, kevt| now.signed_duration_since(kevt.timestamp) <= max_age);
        before - pending.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kevent::Ktype;
    use chrono::TimeZone;

    fn at(secs: i64, seq: u64) -> Kevent {
        let ts = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        Kevent::new(seq, Ktype::CreateHandle, 4, 4, ts)
    }

    #[test]
    fn last_write_wins() {
        let buf = DeferredBuffer::new();
        assert!(buf.defer(0x1000, at(0, 1)).is_none());
        assert_eq!(buf.defer(0x1000, at(1, 2)).map(|k| k.seq), Some(1));
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.resolve(0x1000).map(|k| k.seq), Some(2));
        assert!(buf.resolve(0x1000).is_none());
    }

    #[test]
    fn sweep_discards_only_stale_entries() {
        let buf = DeferredBuffer::new();
        buf.defer(0x1, at(0, 1));
        buf.defer(0x2, at(3, 2));
        buf.defer(0x3, at(6, 3));

        let now = Utc.timestamp_opt(1_700_000_000 + 9, 0).unwrap();
        assert_eq!(buf.sweep(now, Duration::seconds(5)), 2);
        assert_eq!(buf.len(), 1);
        assert!(buf.resolve(0x3).is_some());
        assert_eq!(buf.sweep(now, Duration::seconds(5)), 0);
    }

    #[test]
    fn concurrent_defer_and_resolve_on_distinct_objects() {
        let buf = DeferredBuffer::new();
        let matched: usize = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8u64)
                .map(|t| {
                    let buf = &buf;
                    s.spawn(move || {
                        let mut hits = 0;
                        for i in 0..250u64 {
                            let object = (t << 32) | i;
                            assert!(buf.defer(object, at(0, object)).is_none());
                            if buf.resolve(object).is_some_and(|k| k.seq == object) {
                                hits += 1;
                            }
                        }
                        hits
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });
        assert_eq!(matched, 8 * 250);
        assert_eq!(buf.len(), 0);
    }
}
