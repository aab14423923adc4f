// src/stats.rs

//! Counters and gauges emitted by the pipeline.
//!
//! Interceptors never touch process-wide statics. They receive an
//! `Arc<dyn Stats>` at construction; production wires [`MetricsStats`]
//! (backed by the `metrics` facade and, optionally, the Prometheus
//! exporter), tests wire [`MemoryStats`] and assert on the counts.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    KeventsProcessed,
    KeventsDropped,
    KeventsFailed,
    KeventsReinjected,
    SeqGaps,
    HandleDefers,
    HandleDeferOverwrites,
    HandleDeferMatches,
    HandleDeferEvictions,
    ObjectTypeQueries,
    ProcessesAdded,
    ProcessesRemoved,
}

impl Counter {
    pub fn name(self) -> &'static str {
        match self {
            Counter::KeventsProcessed => "kstream.kevents.processed",
            Counter::KeventsDropped => "kstream.kevents.dropped",
            Counter::KeventsFailed => "kstream.kevents.failed",
            Counter::KeventsReinjected => "kstream.kevents.reinjected",
            Counter::SeqGaps => "kstream.kevents.seq.gaps",
            Counter::HandleDefers => "handle.deferred.count",
            Counter::HandleDeferOverwrites => "handle.deferred.overwrites",
            Counter::HandleDeferMatches => "handle.deferred.matches",
            Counter::HandleDeferEvictions => "handle.deferred.evictions",
            Counter::ObjectTypeQueries => "handle.types.queries",
            Counter::ProcessesAdded => "ps.processes.added",
            Counter::ProcessesRemoved => "ps.processes.removed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gauge {
    PendingDefers,
    Processes,
}

impl Gauge {
    pub fn name(self) -> &'static str {
        match self {
            Gauge::PendingDefers => "handle.deferred.pending",
            Gauge::Processes => "ps.processes",
        }
    }
}

/// Sink for pipeline observability.
pub trait Stats: Send + Sync {
    fn incr(&self, counter: Counter, by: u64);
    fn set(&self, gauge: Gauge, value: f64);
}

/// Forwards to whatever `metrics` recorder is installed globally.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsStats;

impl Stats for MetricsStats {
    fn incr(&self, counter: Counter, by: u64) {
        ::metrics::counter!(counter.name()).increment(by);
    }

    fn set(&self, gauge: Gauge, value: f64) {
        ::metrics::gauge!(gauge.name()).set(value);
    }
}

/// In-memory sink; cheap to assert on.
#[derive(Debug, Default)]
pub struct MemoryStats {
    counters: Mutex<HashMap<Counter, u64>>,
    gauges: Mutex<HashMap<Gauge, f64>>,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, counter: Counter) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&counter)
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge(&self, gauge: Gauge) -> Option<f64> {
        self.gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&gauge)
            .copied()
    }
}

impl Stats for MemoryStats {
    fn incr(&self, counter: Counter, by: u64) {
        *self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(counter)
            .or_insert(0) += by;
    }

    fn set(&self, gauge: Gauge, value: f64) {
        self.gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(gauge, value);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl Stats for NoopStats {
    fn incr(&self, _: Counter, _: u64) {}
    fn set(&self, _: Gauge, _: f64) {}
}
