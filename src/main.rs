// src/main.rs

//! Agent entry-point.
//!
//! 1. Load configuration & set up logging
//! 2. Restore the persisted process snapshot
//! 3. Build the interceptor chain and its collaborators
//! 4. Stream JSON events from stdin through the chain to stdout
//! 5. Persist the snapshot once the input is exhausted or on Ctrl-C

use anyhow::Context;
use chrono::Local;
use log::Level;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    runtime::Runtime,
    sync::mpsc,
    task::{self, JoinHandle},
};

use ktrace::{
    config::{self, Config},
    fs::DeviceMap,
    handle::{ObjectTypeStore, QueryPool, sys::SysIntrospector},
    kevent::Kevent,
    kstream::{Chain, Consumer, ConsumerHandle, HandleInterceptor, JsonLinesSource, PsInterceptor},
    ktrace_log,
    logging::setup_logging,
    ps::{Snapshotter, SysIdentity, persist},
    stats::{MetricsStats, Stats},
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Print an error with context and terminate the process.
macro_rules! fatal {
    ($ctx:expr, $($arg:tt)+) => {{
        eprintln!(
            "[{}][ERROR][{}] {}",
            Local::now().to_rfc3339(),
            $ctx,
            format!($($arg)+)
        );
        std::process::exit(1);
    }};
}

/// Directory that contains the running executable, or the working
/// directory when that cannot be determined.
fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Drains forwarded events to stdout, one JSON document per line.
fn write_events(mut rx: mpsc::Receiver<Kevent>) -> anyhow::Result<u64> {
    let mut out = BufWriter::new(io::stdout().lock());
    let mut n = 0;
    while let Some(kevt) = rx.blocking_recv() {
        serde_json::to_writer(&mut out, &kevt)?;
        out.write_all(b"\n")?;
        n += 1;
        // keep latency low when the producer goes quiet
        if rx.is_empty() {
            out.flush()?;
        }
    }
    out.flush()?;
    Ok(n)
}

/// Waits for the input to run dry or for `shutdown` to fire, whichever
/// comes first. `None` means the stream was interrupted.
async fn drain(
    consumer: ConsumerHandle,
    writer: JoinHandle<anyhow::Result<u64>>,
    shutdown: impl Future<Output = io::Result<()>>,
) -> anyhow::Result<Option<u64>> {
    tokio::select! {
        _ = consumer.join() => {
            let written = writer.await.context("event writer panicked")??;
            Ok(Some(written))
        }
        res = shutdown => {
            res.context("listening for ctrl-c")?;
            Ok(None)
        }
    }
}

async fn run(base: PathBuf, cfg: Config) -> anyhow::Result<()> {
    if let Some(addr) = cfg.metrics.listen {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .with_context(|| format!("installing Prometheus exporter on {addr}"))?;
        log::info!("metrics exposed on http://{addr}/metrics");
    }
    let stats: Arc<dyn Stats> = Arc::new(MetricsStats);

    // ── Snapshot ────────────────────────────────────────────────────────
    let snap = Arc::new(Snapshotter::new(Arc::new(SysIdentity), stats.clone()));
    let snapshot_path = cfg.snapshot.path.as_ref().map(|p| base.join(p));
    let key = cfg.snapshot.key.as_bytes();
    if let Some(path) = &snapshot_path {
        match persist::load_snapshot(path, key) {
            Ok(records) => {
                let n = snap.restore(records);
                ktrace_log!(Level::Info, "snapshot", "restored {} process(es)", n);
            }
            Err(e) => ktrace_log!(Level::Warn, "snapshot", "{}; starting empty", e),
        }
    }

    // ── Chain ───────────────────────────────────────────────────────────
    let pool = QueryPool::new(
        Arc::new(SysIntrospector),
        cfg.query.workers,
        cfg.query.queue_depth,
        cfg.query.timeout,
    );
    let (deferred_tx, deferred_rx) = crossbeam::channel::unbounded();
    let mut handles = HandleInterceptor::new(
        snap.clone(),
        Arc::new(ObjectTypeStore::new()),
        Arc::new(pool),
        Arc::new(DeviceMap::from_system()),
        deferred_tx,
        stats.clone(),
    )
    .with_wait_window(cfg.handle.wait_window);
    if let Some(sid) = &cfg.handle.current_user_sid {
        handles = handles.with_current_user_sid(sid.clone());
    }
    let chain = Chain::new()
        .with(PsInterceptor::new(snap.clone()))
        .with(handles);

    // ── Stream ──────────────────────────────────────────────────────────
    let (out_tx, out_rx) = mpsc::channel::<Kevent>(4_096);
    let writer = task::spawn_blocking(move || write_events(out_rx));

    let source = Arc::new(JsonLinesSource::new(BufReader::new(io::stdin())));
    let consumer = Consumer::new(chain, stats).spawn(source, deferred_rx, out_tx);

    match drain(consumer, writer, tokio::signal::ctrl_c()).await? {
        Some(written) => log::info!("input exhausted, {written} event(s) written"),
        None => log::warn!("Shutdown initiated"),
    }

    if let Some(path) = &snapshot_path {
        persist::save_snapshot(path, key, &snap.records())
            .with_context(|| format!("saving snapshot to {path:?}"))?;
    }
    Ok(())
}

fn main() {
    let base = exe_dir();
    let cfg_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| base.join("ktrace.toml"));

    let cfg = config::load_or_default(&cfg_path).unwrap_or_else(|e| fatal!("config", "{}", e));
    setup_logging(&base, &cfg.logging).unwrap_or_else(|e| fatal!("logging", "{}", e));
    log::info!("agent bootstrap initiated");

    let rt = Runtime::new().unwrap_or_else(|e| fatal!("runtime", "{}", e));
    if let Err(e) = rt.block_on(run(base, cfg)) {
        fatal!("agent", "{:#}", e);
    }
    // the stdin reader may still be parked in a blocking read
    rt.shutdown_timeout(SHUTDOWN_GRACE);
    log::info!("agent stopped cleanly");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::{Sender, unbounded};
    use ktrace::{kstream::ChannelSource, stats::NoopStats};
    use std::future;

    fn idle_consumer() -> (Sender<Kevent>, ConsumerHandle) {
        let (src_tx, src_rx) = unbounded();
        let (_, deferred_rx) = unbounded();
        let (out_tx, _) = mpsc::channel(8);
        let consumer = Consumer::new(Chain::new(), Arc::new(NoopStats)).spawn(
            Arc::new(ChannelSource::new(src_rx)),
            deferred_rx,
            out_tx,
        );
        (src_tx, consumer)
    }

    #[tokio::test]
    async fn interrupt_ends_an_open_stream() {
        let (src_tx, consumer) = idle_consumer();
        let writer = tokio::spawn(async { anyhow::Ok(0) });
        let out = drain(consumer, writer, future::ready(Ok(()))).await.unwrap();
        assert_eq!(out, None);
        drop(src_tx);
    }

    #[tokio::test]
    async fn exhausted_input_reports_written_events() {
        let (src_tx, consumer) = idle_consumer();
        drop(src_tx);
        let writer = tokio::spawn(async { anyhow::Ok(3) });
        let out = drain(consumer, writer, future::pending()).await.unwrap();
        assert_eq!(out, Some(3));
    }
}
