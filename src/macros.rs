/// Logs a component-tagged line carrying the emitting pid and thread.
///
/// The component becomes the record's target, so the fern formatter prints
/// it in the target column.
/// ```ignore
/// ktrace_log!(Level::Info, "snapshot", "restored {} process(es)", n);
/// ```
/// Logs like:
/// [2026-10-16T16:32:10+02:00][INFO][snapshot] [pid=4568][tid=ThreadId(1)] restored 12 process(es)
#[macro_export]
macro_rules! ktrace_log {
    ($level:expr, $component:expr, $fmt:expr $(, $($arg:tt)+)?) => {
        ::log::log!(
            target: $component,
            $level,
            concat!("[pid={}][tid={:?}] ", $fmt),
            ::std::process::id(),
            ::std::thread::current().id()
            $(, $($arg)+)?
        )
    };
}

#[cfg(test)]
mod tests {
    use log::{Level, LevelFilter, Log, Metadata, Record};
    use std::sync::Mutex;

    /// Captures `target|message` lines up to DEBUG.
    struct MemoryLogger {
        buffer: Mutex<String>,
    }

    impl MemoryLogger {
        const fn new() -> Self {
            MemoryLogger {
                buffer: Mutex::new(String::new()),
            }
        }

        fn take(&self) -> String {
            std::mem::take(&mut *self.buffer.lock().unwrap())
        }
    }

    static LOGGER: MemoryLogger = MemoryLogger::new();

    impl Log for MemoryLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= Level::Debug
        }
        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                let mut buf = self.buffer.lock().unwrap();
                buf.push_str(&format!("{}|{}\n", record.target(), record.args()));
            }
        }
        fn flush(&self) {}
    }

    #[test]
    fn ktrace_log_tags_component_and_thread() {
        log::set_logger(&LOGGER).unwrap();
        log::set_max_level(LevelFilter::Debug);
        LOGGER.take();

        ktrace_log!(Level::Debug, "handle", "deferred {}", "0x1000");
        ktrace_log!(Level::Info, "snapshot", "no arguments");

        let output = LOGGER.take();
        assert!(output.contains("handle|[pid="), "missing component: {output}");
        assert!(output.contains("deferred 0x1000"), "missing payload: {output}");
        assert!(output.contains("snapshot|[pid="), "missing second line: {output}");
        assert!(output.contains("][tid=ThreadId("), "missing tid: {output}");
    }
}
