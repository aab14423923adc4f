// src/ps/snapshotter.rs

//! PID-indexed registry of [`Ps`] instances.
//!
//! The map itself sits behind one reader/writer lock that is only held for
//! the insert/remove/lookup; per-process mutations go through the `Ps`'s own
//! lock after the `Arc` has been cloned out. Handle, thread and module
//! updates for a PID we have no state for are ignored.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock},
};

use super::{PsRecord, SnapshotError, identity::ProcessIdentity, types::{Module, Ps, Thread}};
use crate::{
    handle::Handle,
    kevent::{Kevent, kparams::names},
    stats::{Counter, Gauge, Stats},
};

/// Upper bound on the ancestry walk.
pub const MAX_ANCESTRY_DEPTH: usize = 64;

pub struct Snapshotter {
    procs: RwLock<HashMap<u32, Arc<Ps>>>,
    identity: Arc<dyn ProcessIdentity>,
    stats: Arc<dyn Stats>,
}

impl Snapshotter {
    pub fn new(identity: Arc<dyn ProcessIdentity>, stats: Arc<dyn Stats>) -> Self {
        Self {
            procs: RwLock::new(HashMap::new()),
            identity,
            stats,
        }
    }

    pub fn find(&self, pid: u32) -> Option<Arc<Ps>> {
        self.procs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .cloned()
    }

    /// Inserts the process, replacing whatever state a recycled PID left behind.
    pub fn write(&self, ps: Ps) -> Arc<Ps> {
        let ps = Arc::new(ps);
        let len = {
            let mut procs = self.procs.write().unwrap_or_else(PoisonError::into_inner);
            if procs.insert(ps.pid, Arc::clone(&ps)).is_some() {
                log::debug!("pid {} reused, replacing stale process state", ps.pid);
            }
            procs.len()
        };
        self.stats.incr(Counter::ProcessesAdded, 1);
        self.stats.set(Gauge::Processes, len as f64);
        ps
    }

    pub fn remove(&self, pid: u32) -> Option<Arc<Ps>> {
        let (ps, len) = {
            let mut procs = self.procs.write().unwrap_or_else(PoisonError::into_inner);
            (procs.remove(&pid), procs.len())
        };
        if ps.is_some() {
            self.stats.incr(Counter::ProcessesRemoved, 1);
            self.stats.set(Gauge::Processes, len as f64);
        }
        ps
    }

    pub fn len(&self) -> usize {
        self.procs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves the parent by PID. A candidate that started after `ps` is a
    /// different process that inherited the recycled parent PID.
    pub fn parent_of(&self, ps: &Ps) -> Option<Arc<Ps>> {
        if ps.ppid == ps.pid {
            return None;
        }
        let parent = self.find(ps.ppid)?;
        match (parent.start_time, ps.start_time) {
            (Some(parent_start), Some(child_start)) if parent_start > child_start => None,
            _ => Some(parent),
        }
    }

    /// Parent chain of `ps` as `"name (pid)"`, nearest parent first.
    pub fn ancestors(&self, ps: &Ps) -> Vec<String> {
        let mut out = Vec::new();
        let mut visited = HashSet::from([ps.pid]);
        let mut cur = self.parent_of(ps);

        while let Some(parent) = cur {
            if !visited.insert(parent.pid) || out.len() >= MAX_ANCESTRY_DEPTH {
                break;
            }
            out.push(format!("{} ({})", parent.name, parent.pid));
            cur = self.parent_of(&parent);
        }
        out
    }

    pub fn uuid(&self, ps: &Ps) -> u64 {
        ps.uuid(self.identity.as_ref())
    }

    /// Commits the handle carried by an enriched CreateHandle event.
    pub fn write_handle(&self, kevt: &Kevent) -> Result<(), SnapshotError> {
        let handle = Handle::from_kevent(kevt)?;
        if let Some(ps) = self.find(kevt.pid) {
            ps.add_handle(handle);
        }
        Ok(())
    }

    /// Drops the handle named by a CloseHandle (or CreateHandle) event.
    pub fn remove_handle(&self, kevt: &Kevent) -> Result<(), SnapshotError> {
        let num = kevt.kparams.get_u32(names::HANDLE_ID)?;
        if let Some(ps) = self.find(kevt.pid) {
            ps.remove_handle(num);
        }
        Ok(())
    }

    pub fn add_thread(&self, thread: Thread) {
        if let Some(ps) = self.find(thread.pid) {
            ps.add_thread(thread);
        }
    }

    pub fn remove_thread(&self, pid: u32, tid: u32) {
        if let Some(ps) = self.find(pid) {
            ps.remove_thread(tid);
        }
    }

    pub fn add_module(&self, pid: u32, module: Module) {
        if let Some(ps) = self.find(pid) {
            ps.add_module(module);
        }
    }

    pub fn remove_module(&self, pid: u32, path: &str) {
        if let Some(ps) = self.find(pid) {
            ps.remove_module(path);
        }
    }

    /// Rebuilds process state from persisted records. Returns how many were loaded.
    pub fn restore(&self, records: Vec<PsRecord>) -> usize {
        let n = records.len();
        for record in records {
            self.write(Ps::from(record));
        }
        n
    }

    /// Serialisable copy of the whole store, ordered by PID.
    pub fn records(&self) -> Vec<PsRecord> {
        let procs: Vec<Arc<Ps>> = self
            .procs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut records: Vec<_> = procs.iter().map(|ps| ps.to_record()).collect();
        records.sort_by_key(|r| r.pid);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kevent::{Hex, Ktype, Value},
        ps::identity::StaticIdentity,
        stats::MemoryStats,
    };
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn snapshotter() -> (Snapshotter, Arc<MemoryStats>) {
        let stats = Arc::new(MemoryStats::new());
        let snap = Snapshotter::new(Arc::new(StaticIdentity::new(2)), stats.clone());
        (snap, stats)
    }

    fn ps(pid: u32, ppid: u32, exe: &str) -> Ps {
        Ps::new(pid, ppid, exe, r"C:\", exe, None, BTreeMap::new())
    }

    #[test]
    fn write_find_remove() {
        let (snap, stats) = snapshotter();
        snap.write(ps(10, 4, "a.exe"));
        assert_eq!(snap.find(10).map(|p| p.name.clone()), Some("a.exe".into()));
        assert!(snap.remove(10).is_some());
        assert!(snap.remove(10).is_none());
        assert!(snap.is_empty());
        assert_eq!(stats.count(Counter::ProcessesAdded), 1);
        assert_eq!(stats.count(Counter::ProcessesRemoved), 1);
        assert_eq!(stats.gauge(Gauge::Processes), Some(0.0));
    }

    #[test]
    fn ancestors_nearest_first() {
        let (snap, _) = snapshotter();
        snap.write(ps(4, 0, "System"));
        snap.write(ps(500, 4, "services.exe"));
        let child = snap.write(ps(600, 500, "svchost.exe"));
        assert_eq!(snap.ancestors(&child), ["services.exe (500)", "System (4)"]);
    }

    #[test]
    fn ancestors_terminate_on_cycle() {
        let (snap, _) = snapshotter();
        snap.write(ps(1, 2, "a.exe"));
        snap.write(ps(2, 3, "b.exe"));
        let c = snap.write(ps(3, 1, "c.exe"));
        assert_eq!(snap.ancestors(&c), ["a.exe (1)", "b.exe (2)"]);

        let selfish = snap.write(ps(9, 9, "self.exe"));
        assert!(snap.ancestors(&selfish).is_empty());
    }

    #[test]
    fn recycled_parent_pid_is_not_an_ancestor() {
        let (snap, _) = snapshotter();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut parent = ps(100, 4, "late.exe");
        parent.start_time = Some(t0 + Duration::seconds(10));
        snap.write(parent);
        let mut child = ps(200, 100, "early.exe");
        child.start_time = Some(t0);
        let child = snap.write(child);
        assert!(snap.parent_of(&child).is_none());
    }

    #[test]
    fn handle_updates_for_known_and_unknown_processes() {
        let (snap, _) = snapshotter();
        snap.write(ps(880, 4, "x.exe"));
        let kevt = |pid| {
            Kevent::new(1, Ktype::CreateHandle, pid, 1, Utc::now())
                .with_param(names::HANDLE_ID, Value::Uint32(0x44))
                .with_param(names::HANDLE_OBJECT, Value::Hex(Hex(0xffff_1000)))
                .with_param(names::HANDLE_OBJECT_TYPE_NAME, Value::AnsiString("Event".into()))
                .with_param(names::HANDLE_OBJECT_NAME, Value::AnsiString(String::new()))
        };
        snap.write_handle(&kevt(880)).unwrap();
        assert_eq!(snap.find(880).unwrap().handles().len(), 1);
        snap.write_handle(&kevt(1)).unwrap();

        snap.remove_handle(&kevt(880)).unwrap();
        assert!(snap.find(880).unwrap().handles().is_empty());

        let bare = Kevent::new(2, Ktype::CloseHandle, 880, 1, Utc::now());
        assert!(matches!(snap.remove_handle(&bare), Err(SnapshotError::Decode(_))));
    }

    #[test]
    fn restore_rebuilds_from_records() {
        let (snap, _) = snapshotter();
        snap.write(ps(20, 4, "b.exe"));
        snap.write(ps(10, 4, "a.exe"));
        let records = snap.records();
        assert_eq!(records.iter().map(|r| r.pid).collect::<Vec<_>>(), [10, 20]);

        let (fresh, _) = snapshotter();
        assert_eq!(fresh.restore(records.clone()), 2);
        assert_eq!(fresh.records(), records);
    }

    #[test]
    fn uuid_is_idempotent_per_instance() {
        let (snap, _) = snapshotter();
        let p = snap.write(ps(77, 4, "x.exe"));
        assert_eq!(snap.uuid(&p), snap.uuid(&p));
        assert_eq!(snap.uuid(&p), (2u64 << 30) + 77);
    }
}
