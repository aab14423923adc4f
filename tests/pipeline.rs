// tests/pipeline.rs

mod common;

use chrono::Duration;
use crossbeam::channel::unbounded;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;

use common::*;
use ktrace::{
    fs::DeviceMap,
    handle::ObjectTypeStore,
    kevent::{Kevent, Ktype, Value, kparams::names},
    kstream::{Chain, ChannelSource, Consumer, HandleInterceptor, PsInterceptor},
    ps::{Ps, Snapshotter, StaticIdentity},
    stats::{Counter, MemoryStats},
};

#[tokio::test]
async fn deferred_create_reaches_output_through_consumer() {
    let stats = Arc::new(MemoryStats::new());
    let snap = Arc::new(Snapshotter::new(Arc::new(StaticIdentity::new(3)), stats.clone()));
    snap.write(Ps::new(PID, 4, "x.exe", "", "x.exe", None, BTreeMap::new()));
    let types = Arc::new(ObjectTypeStore::new());
    types.register_type(KEY_TYPE, "Key");

    let (deferred_tx, deferred_rx) = unbounded();
    let handles = HandleInterceptor::new(
        snap.clone(),
        types,
        Arc::new(CountingIntrospector::answering("Event")),
        Arc::new(DeviceMap::default()),
        deferred_tx,
        stats.clone(),
    )
    .with_current_user_sid("S-1-5-21-9-9-9-1001");
    let chain = Chain::new().with(PsInterceptor::new(snap.clone())).with(handles);

    let (src_tx, src_rx) = unbounded();
    let (out_tx, mut out_rx) = mpsc::channel(64);
    let consumer = Consumer::new(chain, stats.clone()).spawn(
        Arc::new(ChannelSource::new(src_rx)),
        deferred_rx,
        out_tx,
    );

    src_tx
        .send(Kevent::new(1, Ktype::CreateFile, PID, 1, t0()))
        .unwrap();
    src_tx
        .send(handle_kevt(2, Ktype::CreateHandle, 0x8, 0x1000, KEY_TYPE, "", Duration::zero()))
        .unwrap();
    src_tx
        .send(handle_kevt(
            3,
            Ktype::CloseHandle,
            0x8,
            0x1000,
            KEY_TYPE,
            r"\REGISTRY\USER\S-1-5-21-9-9-9-1001\Environment",
            Duration::seconds(1),
        ))
        .unwrap();
    drop(src_tx);
    consumer.join().await;

    let mut out = Vec::new();
    while let Ok(kevt) = out_rx.try_recv() {
        out.push(kevt);
    }
    let mut seqs: Vec<u64> = out.iter().map(|k| k.seq).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, [1, 2, 3]);

    let create = out.iter().find(|k| k.seq == 2).unwrap();
    assert_eq!(
        create.kparams.get_string(names::HANDLE_OBJECT_NAME).as_deref(),
        Ok(r"HKEY_CURRENT_USER\Environment")
    );
    assert_eq!(stats.count(Counter::KeventsProcessed), 3);
    assert_eq!(stats.count(Counter::KeventsDropped), 1);
    assert_eq!(stats.count(Counter::KeventsReinjected), 1);
    assert_eq!(stats.count(Counter::SeqGaps), 0);
}

#[tokio::test]
async fn failed_events_are_still_forwarded() {
    let h = harness();
    let (src_tx, src_rx) = unbounded();
    let (out_tx, mut out_rx) = mpsc::channel(8);
    let consumer = Consumer::new(h.chain, h.stats.clone()).spawn(
        Arc::new(ChannelSource::new(src_rx)),
        h.deferred,
        out_tx,
    );

    // CreateProcess missing its mandatory parameters
    let broken = Kevent::new(10, Ktype::CreateProcess, 4, 4, t0())
        .with_param(names::PROCESS_ID, Value::Uint32(5000));
    src_tx.send(broken).unwrap();
    drop(src_tx);
    consumer.join().await;

    let kevt = out_rx.try_recv().expect("failed event forwarded");
    assert_eq!(kevt.seq, 10);
    assert_eq!(h.stats.count(Counter::KeventsFailed), 1);
    assert!(h.snap.find(5000).is_none());
}
