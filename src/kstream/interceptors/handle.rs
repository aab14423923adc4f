// src/kstream/interceptors/handle.rs

//! Handle lifecycle correlation.
//!
//! Every CreateHandle/CloseHandle gets a normalised handle id, a resolved
//! object type name and a canonical object name. Some object types (keys,
//! files, desktops, symbolic links) are usually opened without a name; the
//! name only shows up when the handle is closed. Such CreateHandle events are
//! parked in a [`DeferredBuffer`] under the kernel object address and
//! re-emitted, name attached, once the matching CloseHandle arrives.
//!
//! Per object address the states are `Unseen -> PendingName -> Resolved`,
//! or `Unseen -> Resolved` when the name is known at allocation time.

use crossbeam::channel::Sender;
use std::{sync::Arc, time::Duration};

use super::{Interceptor, InterceptorError, InterceptorType, Outcome};
use crate::{
    fs::DevMapper,
    handle::{self, HandleIntrospector, ObjectTypeStore, key},
    kevent::{Kevent, Ktype, Value, kparams::names},
    kstream::deferred::DeferredBuffer,
    ps::Snapshotter,
    stats::{Counter, Gauge, Stats},
};

/// How long a parked CreateHandle may wait for its CloseHandle.
pub const DEFAULT_WAIT_WINDOW: Duration = Duration::from_secs(5);

/// Object identity and names resolved for one handle event.
struct Resolved {
    object: u64,
    type_name: String,
    name: String,
}

pub struct HandleInterceptor {
    snap: Arc<Snapshotter>,
    types: Arc<ObjectTypeStore>,
    introspector: Arc<dyn HandleIntrospector>,
    dev_mapper: Arc<dyn DevMapper>,
    defers: DeferredBuffer,
    deferred_tx: Sender<Kevent>,
    stats: Arc<dyn Stats>,
    wait_window: chrono::Duration,
    current_user_sid: Option<String>,
}

impl HandleInterceptor {
    /// Resolved deferred events are sent on `deferred_tx`, independently of
    /// the CloseHandle that resolved them.
    pub fn new(
        snap: Arc<Snapshotter>,
        types: Arc<ObjectTypeStore>,
        introspector: Arc<dyn HandleIntrospector>,
        dev_mapper: Arc<dyn DevMapper>,
        deferred_tx: Sender<Kevent>,
        stats: Arc<dyn Stats>,
    ) -> Self {
        Self {
            snap,
            types,
            introspector,
            dev_mapper,
            defers: DeferredBuffer::new(),
            deferred_tx,
            stats,
            wait_window: to_chrono(DEFAULT_WAIT_WINDOW),
            current_user_sid: None,
        }
    }

    pub fn with_wait_window(mut self, wait_window: Duration) -> Self {
        self.wait_window = to_chrono(wait_window);
        self
    }

    /// SID whose hive is reported as `HKEY_CURRENT_USER`.
    pub fn with_current_user_sid(mut self, sid: impl Into<String>) -> Self {
        self.current_user_sid = Some(sid.into());
        self
    }

    /// Number of CreateHandle events waiting for their name.
    pub fn pending(&self) -> usize {
        self.defers.len()
    }

    fn resolve(&self, kevt: &mut Kevent) -> Result<Resolved, InterceptorError> {
        let kpars = &mut kevt.kparams;

        // the transport ships handle ids in hex form
        if let Ok(id) = kpars.get_hex_as_u32(names::HANDLE_ID) {
            kpars.set(names::HANDLE_ID, Value::Uint32(id))?;
        }
        let type_id = kpars.get_u16(names::HANDLE_OBJECT_TYPE_ID)?;
        let object = kpars.get_hex_as_u64(names::HANDLE_OBJECT)?;

        let type_name = match self.types.find_by_id(type_id) {
            Some(name) => name,
            None => {
                let raw = kpars.get_u32(names::HANDLE_ID)?;
                self.stats.incr(Counter::ObjectTypeQueries, 1);
                let name = self.introspector.query_type(kevt.pid, raw)?;
                self.types.register_type(type_id, name.clone());
                name
            }
        };
        kpars.append(names::HANDLE_OBJECT_TYPE_NAME, Value::AnsiString(type_name.clone()));
        kpars.remove(names::HANDLE_OBJECT_TYPE_ID);

        let raw_name = kpars.get_string(names::HANDLE_OBJECT_NAME)?;
        let name = match type_name.as_str() {
            handle::KEY => key::format_key(&raw_name, self.current_user_sid.as_deref()),
            handle::FILE => self.dev_mapper.convert(&raw_name),
            _ => raw_name,
        };
        kpars.set(names::HANDLE_OBJECT_NAME, Value::AnsiString(name.clone()))?;

        Ok(Resolved {
            object,
            type_name,
            name,
        })
    }

    fn on_create(&self, kevt: Kevent, r: Resolved) -> Outcome {
        if r.name.is_empty() && handle::name_arrives_on_close(&r.type_name) {
            self.stats.incr(Counter::HandleDefers, 1);
            if let Some(prev) = self.defers.defer(r.object, kevt) {
                self.stats.incr(Counter::HandleDeferOverwrites, 1);
                log::debug!(
                    "object {:#x}: CreateHandle seq {} superseded before close",
                    r.object,
                    prev.seq
                );
            }
            self.stats.set(Gauge::PendingDefers, self.defers.len() as f64);
            return Outcome::Drop;
        }
        match self.snap.write_handle(&kevt) {
            Ok(()) => Outcome::Stop(kevt),
            Err(e) => Outcome::Fail {
                kevt,
                error: e.into(),
                proceed: false,
            },
        }
    }

    fn on_close(&self, kevt: Kevent, r: Resolved) -> Outcome {
        let Some(mut deferred) = self.defers.resolve(r.object) else {
            let evicted = self.defers.sweep(kevt.timestamp, self.wait_window);
            if evicted > 0 {
                self.stats.incr(Counter::HandleDeferEvictions, evicted as u64);
                self.stats.set(Gauge::PendingDefers, self.defers.len() as f64);
                log::debug!("evicted {evicted} CreateHandle event(s) that never saw a close");
            }
            return self.finalize(kevt);
        };
        self.stats.set(Gauge::PendingDefers, self.defers.len() as f64);
        self.stats.incr(Counter::HandleDeferMatches, 1);

        deferred
            .kparams
            .append(names::HANDLE_OBJECT_NAME, Value::AnsiString(r.name));
        let committed = self.snap.write_handle(&deferred);
        self.reinject(deferred);

        if let Err(e) = committed {
            // the close below still clears whatever was written
            log::warn!("object {:#x}: cannot commit deferred handle: {e}", r.object);
        }
        self.finalize(kevt)
    }

    /// The close always ends handle tracking for its id.
    fn finalize(&self, kevt: Kevent) -> Outcome {
        match self.snap.remove_handle(&kevt) {
            Ok(()) => Outcome::Stop(kevt),
            Err(e) => Outcome::Fail {
                kevt,
                error: e.into(),
                proceed: false,
            },
        }
    }

    fn reinject(&self, kevt: Kevent) {
        let seq = kevt.seq;
        match self.deferred_tx.send(kevt) {
            Ok(()) => self.stats.incr(Counter::KeventsReinjected, 1),
            Err(_) => log::warn!("deferred channel closed, CreateHandle seq {seq} lost"),
        }
    }
}

impl Interceptor for HandleInterceptor {
    fn intercept(&self, mut kevt: Kevent) -> Outcome {
        if !kevt.is_handle() {
            return Outcome::Continue(kevt);
        }
        let resolved = match self.resolve(&mut kevt) {
            Ok(r) => r,
            Err(error) => {
                return Outcome::Fail {
                    kevt,
                    error,
                    proceed: true,
                };
            }
        };
        match kevt.ktype {
            Ktype::CreateHandle => self.on_create(kevt, resolved),
            _ => self.on_close(kevt, resolved),
        }
    }

    fn name(&self) -> InterceptorType {
        InterceptorType::Handle
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
