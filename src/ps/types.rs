// src/ps/types.rs

//! Process, thread and module state.
//!
//! A [`Ps`] keeps its immutable identity (pid, image, command line, ...) as
//! plain fields and puts everything that changes while the process lives
//! (threads, modules, handles) behind its own reader/writer lock. Unrelated
//! processes therefore never contend with each other.
//!
//! The parent is *not* stored as a pointer. It is resolved through the
//! snapshotter by `ppid` at the time it is needed; see
//! [`Snapshotter::ancestors`](super::Snapshotter::ancestors).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use super::{cmdline, identity::{ProcessIdentity, compute_uuid}};
use crate::{
    handle::Handle,
    kevent::{Hex, Kevent, KparamsError, kparams::names},
};

/// A thread running in a process' address space. Never mutated in place;
/// updates replace the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub tid: u32,
    pub pid: u32,
    pub io_prio: u8,
    pub base_prio: u8,
    pub page_prio: u8,
    pub ustack_base: Hex,
    pub ustack_limit: Hex,
    pub kstack_base: Hex,
    pub kstack_limit: Hex,
    pub entrypoint: Hex,
}

impl Thread {
    /// The owning pid comes from the `pid` parameter when present, else
    /// from the event header.
    pub fn from_kevent(kevt: &Kevent) -> Result<Self, KparamsError> {
        let kpars = &kevt.kparams;
        Ok(Self {
            tid: kpars.get_u32(names::THREAD_ID)?,
            pid: kpars.get_u32(names::PROCESS_ID).unwrap_or(kevt.pid),
            io_prio: kpars.get_u8(names::IO_PRIO)?,
            base_prio: kpars.get_u8(names::BASE_PRIO)?,
            page_prio: kpars.get_u8(names::PAGE_PRIO)?,
            ustack_base: kpars.get_hex(names::USTACK_BASE)?,
            ustack_limit: kpars.get_hex(names::USTACK_LIMIT)?,
            kstack_base: kpars.get_hex(names::KSTACK_BASE)?,
            kstack_limit: kpars.get_hex(names::KSTACK_LIMIT)?,
            entrypoint: kpars.get_hex(names::START_ADDR)?,
        })
    }
}

impl fmt::Display for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ID: {} IO prio: {}, Base prio: {}, Page prio: {}, Ustack base: {}, Ustack limit: {}, \
             Kstack base: {}, Kstack limit: {}, Entrypoint: {}",
            self.tid,
            self.io_prio,
            self.base_prio,
            self.page_prio,
            self.ustack_base,
            self.ustack_limit,
            self.kstack_base,
            self.kstack_limit,
            self.entrypoint
        )
    }
}

/// An executable image mapped into a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    /// Full path of the image.
    pub name: String,
    pub size: u32,
    pub checksum: u32,
    pub base_address: Hex,
    pub default_base_address: Hex,
}

impl Module {
    pub fn from_kevent(kevt: &Kevent) -> Result<Self, KparamsError> {
        let kpars = &kevt.kparams;
        Ok(Self {
            name: kpars.get_string(names::IMAGE_FILENAME)?,
            size: kpars.get_u32(names::IMAGE_SIZE)?,
            checksum: kpars.get_u32(names::IMAGE_CHECKSUM)?,
            base_address: kpars.get_hex(names::IMAGE_BASE)?,
            default_base_address: kpars.get_hex(names::IMAGE_DEFAULT_BASE)?,
        })
    }

    /// File name component of the image path.
    pub fn base_name(&self) -> &str {
        base_name(&self.name)
    }
}

#[derive(Debug, Default)]
struct PsState {
    threads: HashMap<u32, Thread>,
    modules: Vec<Module>,
    handles: Vec<Handle>,
}

/// Live state of one process.
#[derive(Debug)]
pub struct Ps {
    pub pid: u32,
    pub ppid: u32,
    /// Image name including extension, e.g. `cmd.exe`.
    pub name: String,
    /// Full command line.
    pub comm: String,
    pub args: Vec<String>,
    pub exe: String,
    pub cwd: String,
    pub sid: String,
    pub session_id: u8,
    pub envs: BTreeMap<String, String>,
    pub start_time: Option<DateTime<Utc>>,
    state: RwLock<PsState>,
    uuid: OnceLock<u64>,
}

impl Ps {
    /// Builds a process from its identity fields; the image name is derived
    /// from `exe` and the argument vector from `comm`.
    pub fn new(
        pid: u32,
        ppid: u32,
        exe: impl Into<String>,
        cwd: impl Into<String>,
        comm: impl Into<String>,
        thread: Option<Thread>,
        envs: BTreeMap<String, String>,
    ) -> Self {
        let exe = exe.into();
        let comm = comm.into();
        let mut state = PsState::default();
        if let Some(t) = thread {
            state.threads.insert(t.tid, t);
        }
        Self {
            pid,
            ppid,
            name: base_name(&exe).to_owned(),
            args: cmdline::split(&comm),
            comm,
            exe,
            cwd: cwd.into(),
            sid: String::new(),
            session_id: 0,
            envs,
            start_time: None,
            state: RwLock::new(state),
            uuid: OnceLock::new(),
        }
    }

    /// Builds a process from a CreateProcess/EnumProcess event. `pid`,
    /// `ppid`, `name` and `comm` are mandatory; the rest degrade to empty.
    pub fn from_kevent(kevt: &Kevent) -> Result<Self, KparamsError> {
        let kpars = &kevt.kparams;
        let pid = kpars.get_u32(names::PROCESS_ID)?;
        let ppid = kpars.get_u32(names::PROCESS_PARENT_ID)?;
        let name = kpars.get_string(names::PROCESS_NAME)?;
        let comm = kpars.get_string(names::COMM)?;
        let args = cmdline::split(&comm);
        let exe = kpars
            .get_string(names::EXE)
            .ok()
            .or_else(|| args.first().cloned())
            .unwrap_or_default();

        Ok(Self {
            pid,
            ppid,
            name,
            args,
            comm,
            exe,
            cwd: kpars.get_string(names::CWD).unwrap_or_default(),
            sid: kpars.get_string(names::USER_SID).unwrap_or_default(),
            session_id: kpars.get_u8(names::SESSION_ID).unwrap_or_default(),
            envs: BTreeMap::new(),
            start_time: Some(kevt.timestamp),
            state: RwLock::new(PsState::default()),
            uuid: OnceLock::new(),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, PsState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PsState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Computed on first use, then fixed for the life of this instance.
    pub fn uuid(&self, identity: &dyn ProcessIdentity) -> u64 {
        *self
            .uuid
            .get_or_init(|| compute_uuid(identity, self.pid, self.start_time))
    }

    pub fn add_thread(&self, thread: Thread) {
        self.write().threads.insert(thread.tid, thread);
    }

    pub fn remove_thread(&self, tid: u32) {
        self.write().threads.remove(&tid);
    }

    pub fn thread(&self, tid: u32) -> Option<Thread> {
        self.read().threads.get(&tid).cloned()
    }

    pub fn threads(&self) -> Vec<Thread> {
        let mut threads: Vec<_> = self.read().threads.values().cloned().collect();
        threads.sort_by_key(|t| t.tid);
        threads
    }

    pub fn add_handle(&self, handle: Handle) {
        self.write().handles.push(handle);
    }

    /// Removes the first handle with value `num`.
    pub fn remove_handle(&self, num: u32) -> Option<Handle> {
        let mut state = self.write();
        let i = state.handles.iter().position(|h| h.num == num)?;
        Some(state.handles.remove(i))
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.read().handles.clone()
    }

    /// Appends the module unless one with the same path is already loaded.
    pub fn add_module(&self, module: Module) {
        let mut state = self.write();
        if state
            .modules
            .iter()
            .any(|m| m.name.eq_ignore_ascii_case(&module.name))
        {
            return;
        }
        state.modules.push(module);
    }

    pub fn remove_module(&self, path: &str) -> Option<Module> {
        let mut state = self.write();
        let i = state
            .modules
            .iter()
            .position(|m| m.name.eq_ignore_ascii_case(path))?;
        Some(state.modules.remove(i))
    }

    /// Looks a module up by full path or by file name.
    pub fn find_module(&self, name: &str) -> Option<Module> {
        self.read()
            .modules
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name) || m.base_name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn modules(&self) -> Vec<Module> {
        self.read().modules.clone()
    }

    pub fn to_record(&self) -> PsRecord {
        let state = self.read();
        let mut threads: Vec<_> = state.threads.values().cloned().collect();
        threads.sort_by_key(|t| t.tid);
        PsRecord {
            pid: self.pid,
            ppid: self.ppid,
            name: self.name.clone(),
            comm: self.comm.clone(),
            args: self.args.clone(),
            exe: self.exe.clone(),
            cwd: self.cwd.clone(),
            sid: self.sid.clone(),
            session_id: self.session_id,
            envs: self.envs.clone(),
            start_time: self.start_time,
            threads,
            modules: state.modules.clone(),
            handles: state.handles.clone(),
        }
    }
}

impl From<PsRecord> for Ps {
    fn from(r: PsRecord) -> Self {
        let state = PsState {
            threads: r.threads.into_iter().map(|t| (t.tid, t)).collect(),
            modules: r.modules,
            handles: r.handles,
        };
        Self {
            pid: r.pid,
            ppid: r.ppid,
            name: r.name,
            comm: r.comm,
            args: r.args,
            exe: r.exe,
            cwd: r.cwd,
            sid: r.sid,
            session_id: r.session_id,
            envs: r.envs,
            start_time: r.start_time,
            state: RwLock::new(state),
            uuid: OnceLock::new(),
        }
    }
}

impl fmt::Display for Ps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pid: {} Ppid: {} Name: {} Cmdline: {} Exe: {} Cwd: {} SID: {} Session ID: {}",
            self.pid, self.ppid, self.name, self.comm, self.exe, self.cwd, self.sid, self.session_id
        )
    }
}

/// Serialisable form of [`Ps`], used to rebuild the snapshot on cold start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsRecord {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub comm: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub exe: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub sid: String,
    #[serde(default)]
    pub session_id: u8,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub threads: Vec<Thread>,
    #[serde(default)]
    pub modules: Vec<Module>,
    #[serde(default)]
    pub handles: Vec<Handle>,
}

/// File name part of a Windows or POSIX path.
pub(crate) fn base_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}
