//! Event sources and the dispatch loop around the interceptor chain.
//! -----------------------------------------------------------------------------
//! An **event source** pulls kernel events from its transport and pushes them
//! into a bounded queue. The **consumer** drains that queue on a blocking
//! thread, runs every event through the [`Chain`] in order, and forwards what
//! survives to the output channel. A third task forwards CreateHandle events
//! re-injected by the handle interceptor, so their emission never waits on
//! the close event that resolved them.

use async_trait::async_trait;
use crossbeam::channel::Receiver as CbReceiver;
use std::{
    io::BufRead,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{sync::mpsc, task};

use super::interceptors::{Chain, Verdict};
use crate::{
    kevent::Kevent,
    stats::{Counter, Stats},
};

#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Display name for logs.
    fn name(&self) -> &'static str;

    /// Capacity of the queue between ingest and dispatch.
    fn capacity(&self) -> usize {
        16_384
    }

    /// Pulls events from the transport into `tx` until either side closes.
    async fn ingest(self: Arc<Self>, tx: mpsc::Sender<Kevent>);
}

/// Counts sequence numbers that do not follow their predecessor.
#[derive(Debug, Default)]
pub struct SeqTracker {
    last: Option<u64>,
}

impl SeqTracker {
    /// Returns `false` when `seq` is not exactly one past the previous value.
    pub fn observe(&mut self, seq: u64) -> bool {
        let in_order = match self.last {
            None => true,
            Some(last) => seq == last.wrapping_add(1),
        };
        if !in_order {
            match self.last {
                Some(last) if seq <= last => log::debug!("seq {seq} arrived after {last}"),
                Some(last) => log::debug!("seq gap: {last} -> {seq}"),
                None => {}
            }
        }
        self.last = Some(self.last.map_or(seq, |last| last.max(seq)));
        in_order
    }
}

/// Join handles of a running consumer.
pub struct ConsumerHandle {
    name: &'static str,
    tasks: Vec<task::JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Waits until the source is exhausted and every event has been forwarded.
    pub async fn join(self) {
        for t in self.tasks {
            if let Err(e) = t.await {
                log::error!("consumer task for '{}' failed: {e}", self.name);
            }
        }
    }
}

pub struct Consumer {
    chain: Chain,
    stats: Arc<dyn Stats>,
}

impl Consumer {
    pub fn new(chain: Chain, stats: Arc<dyn Stats>) -> Self {
        Self { chain, stats }
    }

    /// Launches ingest, dispatch and deferred forwarding. `deferred_rx` is
    /// the receiving end of the channel handed to the handle interceptor.
    /// Must be called within a tokio runtime.
    pub fn spawn<S: EventSource>(
        self,
        source: Arc<S>,
        deferred_rx: CbReceiver<Kevent>,
        out: mpsc::Sender<Kevent>,
    ) -> ConsumerHandle {
        let name = source.name();
        let (raw_tx, mut raw_rx) = mpsc::channel::<Kevent>(source.capacity());

        let ingest = task::spawn(async move {
            log::info!("event source '{name}' started");
            source.ingest(raw_tx).await;
            log::info!("event source '{name}' exited");
        });

        let Consumer { chain, stats } = self;
        let dispatch_out = out.clone();
        let dispatch = task::spawn_blocking(move || {
            let mut seq = SeqTracker::default();
            while let Some(kevt) = raw_rx.blocking_recv() {
                stats.incr(Counter::KeventsProcessed, 1);
                if !seq.observe(kevt.seq) {
                    stats.incr(Counter::SeqGaps, 1);
                }
                let forward = match chain.dispatch(kevt) {
                    Ok(Verdict::Forward(kevt)) => Some(kevt),
                    Ok(Verdict::Drop) => {
                        stats.incr(Counter::KeventsDropped, 1);
                        None
                    }
                    Err(e) => {
                        stats.incr(Counter::KeventsFailed, 1);
                        log::warn!("{e}");
                        e.kevt
                    }
                };
                if let Some(kevt) = forward {
                    if dispatch_out.blocking_send(kevt).is_err() {
                        log::warn!("output closed, stopping dispatch for '{name}'");
                        break;
                    }
                }
            }
            // dropping the chain closes the deferred channel
            drop(chain);
            log::info!("dispatch for '{name}' terminated");
        });

        let forwarder = task::spawn_blocking(move || {
            while let Ok(kevt) = deferred_rx.recv() {
                if out.blocking_send(kevt).is_err() {
                    break;
                }
            }
            log::debug!("deferred forwarder for '{name}' terminated");
        });

        ConsumerHandle {
            name,
            tasks: vec![ingest, dispatch, forwarder],
        }
    }
}

/// Source backed by a crossbeam channel, standing in for a kernel ring.
pub struct ChannelSource {
    rx: CbReceiver<Kevent>,
}

impl ChannelSource {
    pub fn new(rx: CbReceiver<Kevent>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn ingest(self: Arc<Self>, tx: mpsc::Sender<Kevent>) {
        let rx = self.rx.clone();
        // blocking recv stays off the tokio workers
        let res = task::spawn_blocking(move || {
            while let Ok(kevt) = rx.recv() {
                if tx.blocking_send(kevt).is_err() {
                    break;
                }
            }
        })
        .await;
        if let Err(e) = res {
            log::error!("channel ingest task failed: {e}");
        }
    }
}

/// Source reading one JSON-encoded [`Kevent`] per line.
pub struct JsonLinesSource {
    reader: Mutex<Option<Box<dyn BufRead + Send>>>,
}

impl JsonLinesSource {
    pub fn new(reader: impl BufRead + Send + 'static) -> Self {
        Self {
            reader: Mutex::new(Some(Box::new(reader))),
        }
    }
}

#[async_trait]
impl EventSource for JsonLinesSource {
    fn name(&self) -> &'static str {
        "json-lines"
    }

    async fn ingest(self: Arc<Self>, tx: mpsc::Sender<Kevent>) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(reader) = reader else {
            log::warn!("json-lines source already consumed");
            return;
        };
        let res = task::spawn_blocking(move || {
            for (n, line) in reader.lines().enumerate() {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        log::error!("read error on line {}: {e}", n + 1);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Kevent>(&line) {
                    Ok(kevt) => {
                        if tx.blocking_send(kevt).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("skipping malformed event on line {}: {e}", n + 1),
                }
            }
        })
        .await;
        if let Err(e) = res {
            log::error!("json-lines ingest task failed: {e}");
        }
    }
}
