// src/kstream/interceptors/ps.rs

//! Keeps the process snapshot in step with process, thread and image events.
//! Events are always passed on; a decode failure is reported but the rest of
//! the chain still runs.

use std::sync::Arc;

use super::{Interceptor, InterceptorError, InterceptorType, Outcome};
use crate::{
    kevent::{Kevent, Ktype, kparams::names},
    ps::{Module, Ps, Snapshotter, Thread},
};

pub struct PsInterceptor {
    snap: Arc<Snapshotter>,
}

impl PsInterceptor {
    pub fn new(snap: Arc<Snapshotter>) -> Self {
        Self { snap }
    }

    fn apply(&self, kevt: &Kevent) -> Result<(), InterceptorError> {
        let kpars = &kevt.kparams;
        match kevt.ktype {
            Ktype::CreateProcess | Ktype::EnumProcess => {
                let ps = Ps::from_kevent(kevt)?;
                log::trace!("new process {ps}");
                self.snap.write(ps);
            }
            Ktype::TerminateProcess => {
                let pid = kpars.get_u32(names::PROCESS_ID)?;
                self.snap.remove(pid);
            }
            Ktype::CreateThread | Ktype::EnumThread => {
                self.snap.add_thread(Thread::from_kevent(kevt)?);
            }
            Ktype::TerminateThread => {
                let pid = kpars.get_u32(names::PROCESS_ID).unwrap_or(kevt.pid);
                let tid = kpars.get_u32(names::THREAD_ID)?;
                self.snap.remove_thread(pid, tid);
            }
            Ktype::LoadImage | Ktype::EnumImage => {
                let pid = kpars.get_u32(names::PROCESS_ID).unwrap_or(kevt.pid);
                self.snap.add_module(pid, Module::from_kevent(kevt)?);
            }
            Ktype::UnloadImage => {
                let pid = kpars.get_u32(names::PROCESS_ID).unwrap_or(kevt.pid);
                let path = kpars.get_string(names::IMAGE_FILENAME)?;
                self.snap.remove_module(pid, &path);
            }
            _ => {}
        }
        Ok(())
    }
}

impl Interceptor for PsInterceptor {
    fn intercept(&self, kevt: Kevent) -> Outcome {
        match self.apply(&kevt) {
            Ok(()) => Outcome::Continue(kevt),
            Err(error) => Outcome::Fail {
                kevt,
                error,
                proceed: true,
            },
        }
    }

    fn name(&self) -> InterceptorType {
        InterceptorType::Ps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kevent::{Hex, Value},
        ps::StaticIdentity,
        stats::NoopStats,
    };
    use chrono::Utc;

    fn icpt() -> (PsInterceptor, Arc<Snapshotter>) {
        let snap = Arc::new(Snapshotter::new(Arc::new(StaticIdentity::new(1)), Arc::new(NoopStats)));
        (PsInterceptor::new(snap.clone()), snap)
    }

    fn create_process(pid: u32) -> Kevent {
        Kevent::new(1, Ktype::CreateProcess, 4, 4, Utc::now())
            .with_param(names::PROCESS_ID, Value::Uint32(pid))
            .with_param(names::PROCESS_PARENT_ID, Value::Uint32(4))
            .with_param(names::PROCESS_NAME, Value::AnsiString("cmd.exe".into()))
            .with_param(names::COMM, Value::UnicodeString("cmd.exe /c ver".into()))
    }

    fn image(ktype: Ktype, pid: u32) -> Kevent {
        Kevent::new(2, ktype, pid, 1, Utc::now())
            .with_param(names::IMAGE_FILENAME, Value::UnicodeString(r"C:\Windows\System32\ntdll.dll".into()))
            .with_param(names::IMAGE_SIZE, Value::Uint32(0x1f0000))
            .with_param(names::IMAGE_CHECKSUM, Value::Uint32(0xabc))
            .with_param(names::IMAGE_BASE, Value::Hex(Hex(0x7ffa_0000_0000)))
            .with_param(names::IMAGE_DEFAULT_BASE, Value::Hex(Hex(0x1_8000_0000)))
    }

    #[test]
    fn process_lifecycle() {
        let (icpt, snap) = icpt();
        assert!(matches!(icpt.intercept(create_process(700)), Outcome::Continue(_)));
        assert_eq!(snap.find(700).unwrap().args, ["cmd.exe", "/c", "ver"]);

        icpt.intercept(image(Ktype::LoadImage, 700));
        assert!(snap.find(700).unwrap().find_module("ntdll.dll").is_some());
        icpt.intercept(image(Ktype::UnloadImage, 700));
        assert!(snap.find(700).unwrap().modules().is_empty());

        let exit = Kevent::new(3, Ktype::TerminateProcess, 700, 1, Utc::now())
            .with_param(names::PROCESS_ID, Value::Uint32(700));
        icpt.intercept(exit);
        assert!(snap.find(700).is_none());
    }

    #[test]
    fn thread_events_update_owner() {
        let (icpt, snap) = icpt();
        icpt.intercept(create_process(700));
        let t = Kevent::new(4, Ktype::CreateThread, 700, 12, Utc::now())
            .with_param(names::THREAD_ID, Value::Uint32(12))
            .with_param(names::IO_PRIO, Value::Uint8(2))
            .with_param(names::BASE_PRIO, Value::Uint8(8))
            .with_param(names::PAGE_PRIO, Value::Uint8(5))
            .with_param(names::USTACK_BASE, Value::Hex(Hex(0x1000)))
            .with_param(names::USTACK_LIMIT, Value::Hex(Hex(0x800)))
            .with_param(names::KSTACK_BASE, Value::Hex(Hex(0xf000)))
            .with_param(names::KSTACK_LIMIT, Value::Hex(Hex(0xe000)))
            .with_param(names::START_ADDR, Value::Hex(Hex(0x7ff1_0000)));
        icpt.intercept(t);
        assert!(snap.find(700).unwrap().thread(12).is_some());

        let end = Kevent::new(5, Ktype::TerminateThread, 700, 12, Utc::now())
            .with_param(names::THREAD_ID, Value::Uint32(12));
        icpt.intercept(end);
        assert!(snap.find(700).unwrap().thread(12).is_none());
    }

    #[test]
    fn decode_failure_still_carries_event() {
        let (icpt, _) = icpt();
        let bad = Kevent::new(9, Ktype::CreateProcess, 4, 4, Utc::now());
        assert!(matches!(
            icpt.intercept(bad),
            Outcome::Fail { kevt, proceed: true, .. } if kevt.seq == 9
        ));
    }
}
