//! Filesystem change events
//!
//! A recursive watcher ([`watcher::run`]) feeds an [`EventLog`], a small
//! time-ordered window of recent changes. Consumers poll it with
//! [`EventLog::snapshot`] since their own high-water mark and collapse
//! bursts on the same path with [`coalesce`].

pub mod watcher;

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

pub use watcher::{run as watch, WatchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsEventKind {
    Create,
    Write,
    Remove,
    Rename,
    Chmod,
}

impl Display for FsEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FsEventKind::Create => "create",
            FsEventKind::Write => "write",
            FsEventKind::Remove => "remove",
            FsEventKind::Rename => "rename",
            FsEventKind::Chmod => "chmod",
        };
        f.write_str(s)
    }
}

/// Position of an event in the log. Totally ordered, even for events that
/// share a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventStamp {
    pub at: Instant,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    /// Path relative to the watched root, `/`-separated.
    pub path: String,
    pub kind: FsEventKind,
    pub stamp: EventStamp,
}

#[derive(Debug, Default)]
struct LogInner {
    events: BTreeMap<EventStamp, FsEvent>,
    next_seq: u64,
}

impl LogInner {
    fn purge(&mut self, now: Instant, max_age: Duration) {
        let Some(cutoff) = now.checked_sub(max_age) else {
            return;
        };
        // keep everything at or after the cutoff
        let keep = self.events.split_off(&EventStamp { at: cutoff, seq: 0 });
        self.events = keep;
    }
}

/// Recent filesystem events, keyed by arrival time.
#[derive(Debug)]
pub struct EventLog {
    inner: Mutex<LogInner>,
    max_age: Duration,
}

impl EventLog {
    pub fn new(max_age: Duration) -> Self {
        Self {
            inner: Mutex::new(LogInner::default()),
            max_age,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Purge expired events, then append one stamped with the current time.
    pub fn record(&self, path: impl Into<String>, kind: FsEventKind) -> EventStamp {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.purge(now, self.max_age);
        let stamp = EventStamp {
            at: now,
            seq: inner.next_seq,
        };
        inner.next_seq += 1;
        inner.events.insert(
            stamp,
            FsEvent {
                path: path.into(),
                kind,
                stamp,
            },
        );
        stamp
    }

    /// Events strictly newer than `since`, oldest first.
    pub fn snapshot(&self, since: Option<EventStamp>) -> Vec<FsEvent> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.purge(now, self.max_age);
        match since {
            Some(mark) => inner
                .events
                .range((std::ops::Bound::Excluded(mark), std::ops::Bound::Unbounded))
                .map(|(_, event)| event.clone())
                .collect(),
            None => inner.events.values().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }
}

/// Keep only the newest event per path, preserving time order.
pub fn coalesce(events: Vec<FsEvent>) -> Vec<FsEvent> {
    let mut newest: HashMap<String, FsEvent> = HashMap::with_capacity(events.len());
    for event in events {
        match newest.get(&event.path) {
            Some(existing) if existing.stamp >= event.stamp => {}
            _ => {
                newest.insert(event.path.clone(), event);
            }
        }
    }
    let mut out: Vec<FsEvent> = newest.into_values().collect();
    out.sort_by_key(|event| event.stamp);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_since_mark() {
        let log = EventLog::new(Duration::from_secs(10));
        let first = log.record("a.txt", FsEventKind::Write);
        tokio::time::advance(Duration::from_millis(5)).await;
        log.record("b.txt", FsEventKind::Create);

        let all = log.snapshot(None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].path, "a.txt");

        let newer = log.snapshot(Some(first));
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].path, "b.txt");
        assert!(log.snapshot(Some(newer[0].stamp)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_events_are_purged() {
        let log = EventLog::new(Duration::from_millis(200));
        log.record("old.txt", FsEventKind::Write);
        tokio::time::advance(Duration::from_millis(300)).await;
        log.record("new.txt", FsEventKind::Write);

        let events = log.snapshot(None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, "new.txt");

        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(log.snapshot(None).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_instant_events_are_distinct() {
        let log = EventLog::new(Duration::from_secs(1));
        log.record("x", FsEventKind::Create);
        log.record("x", FsEventKind::Write);
        log.record("x", FsEventKind::Chmod);
        assert_eq!(log.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesce_keeps_latest_per_path() {
        let log = EventLog::new(Duration::from_secs(1));
        log.record("foo.txt", FsEventKind::Create);
        tokio::time::advance(Duration::from_millis(10)).await;
        log.record("bar.txt", FsEventKind::Write);
        tokio::time::advance(Duration::from_millis(10)).await;
        log.record("foo.txt", FsEventKind::Write);
        let last = log.record("foo.txt", FsEventKind::Chmod);

        let batch = coalesce(log.snapshot(None));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].path, "bar.txt");
        assert_eq!(batch[1].path, "foo.txt");
        assert_eq!(batch[1].stamp, last);
        assert_eq!(batch[1].kind, FsEventKind::Chmod);
    }
}
