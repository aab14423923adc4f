// tests/common/mod.rs
#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use crossbeam::channel::{Receiver, unbounded};
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use ktrace::{
    fs::DeviceMap,
    handle::{HandleError, HandleIntrospector, ObjectTypeStore},
    kevent::{Hex, Kevent, Ktype, Value, kparams::names},
    kstream::{Chain, HandleInterceptor, PsInterceptor},
    ps::{Ps, Snapshotter, StaticIdentity},
    stats::MemoryStats,
};

pub const PID: u32 = 1_024;
pub const KEY_TYPE: u16 = 44;
pub const FILE_TYPE: u16 = 37;
pub const EVENT_TYPE: u16 = 16;

/// Answers every type query with a fixed name and counts the calls.
#[derive(Default)]
pub struct CountingIntrospector {
    pub calls: AtomicUsize,
    pub answer: String,
}

impl CountingIntrospector {
    pub fn answering(answer: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            answer: answer.into(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HandleIntrospector for CountingIntrospector {
    fn query_type(&self, _pid: u32, _handle: u32) -> Result<String, HandleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer.clone())
    }
}

/// Everything a test needs to drive the chain and inspect its effects.
pub struct Harness {
    pub chain: Chain,
    pub snap: Arc<Snapshotter>,
    pub types: Arc<ObjectTypeStore>,
    pub introspector: Arc<CountingIntrospector>,
    pub deferred: Receiver<Kevent>,
    pub stats: Arc<MemoryStats>,
}

pub fn harness() -> Harness {
    let stats = Arc::new(MemoryStats::new());
    let snap = Arc::new(Snapshotter::new(Arc::new(StaticIdentity::new(7)), stats.clone()));
    snap.write(Ps::new(PID, 4, r"C:\Windows\regedit.exe", r"C:\", "regedit.exe", None, BTreeMap::new()));

    let types = Arc::new(ObjectTypeStore::new());
    types.register_type(KEY_TYPE, "Key");
    types.register_type(FILE_TYPE, "File");
    let introspector = Arc::new(CountingIntrospector::answering("Event"));

    let (tx, rx) = unbounded();
    let handles = HandleInterceptor::new(
        snap.clone(),
        types.clone(),
        introspector.clone(),
        Arc::new(DeviceMap::new([(r"\Device\HarddiskVolume3", "C:")])),
        tx,
        stats.clone(),
    );
    let chain = Chain::new().with(PsInterceptor::new(snap.clone())).with(handles);

    Harness {
        chain,
        snap,
        types,
        introspector,
        deferred: rx,
        stats,
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_760_000_000, 0).unwrap()
}

/// Raw handle event as the transport ships it: hex handle id, numeric type.
pub fn handle_kevt(
    seq: u64,
    ktype: Ktype,
    handle_id: u32,
    object: u64,
    type_id: u16,
    name: &str,
    after: Duration,
) -> Kevent {
    Kevent::new(seq, ktype, PID, 2_048, t0() + after)
        .with_param(names::HANDLE_ID, Value::Hex(Hex(u64::from(handle_id))))
        .with_param(names::HANDLE_OBJECT, Value::Hex(Hex(object)))
        .with_param(names::HANDLE_OBJECT_TYPE_ID, Value::Uint16(type_id))
        .with_param(names::HANDLE_OBJECT_NAME, Value::UnicodeString(name.into()))
}

pub fn handle_names(snap: &Snapshotter) -> Vec<String> {
    snap.find(PID)
        .map(|ps| ps.handles().into_iter().map(|h| h.name).collect())
        .unwrap_or_default()
}
