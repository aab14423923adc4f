//! Canonical in-memory representation of one kernel event.
//!
//! A `Kevent` is created by the transport for every observed kernel
//! notification, mutated in place while it travels the interceptor chain,
//! and dropped once the chain is done with it (or parked in the deferred
//! buffer until its correlating event shows up).

pub mod kparams;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub use kparams::{Hex, Kparam, Kparams, KparamsError, Value};

/// Closed set of kernel event types the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ktype {
    CreateProcess,
    TerminateProcess,
    EnumProcess,
    CreateThread,
    TerminateThread,
    EnumThread,
    LoadImage,
    UnloadImage,
    EnumImage,
    CreateHandle,
    CloseHandle,
    CreateFile,
    ReadFile,
    WriteFile,
    DeleteFile,
    RegOpenKey,
    RegSetValue,
    RegDeleteKey,
    Connect,
    Accept,
}

/// Coarse grouping used for logs and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Process,
    Thread,
    Image,
    Handle,
    File,
    Registry,
    Net,
}

impl Ktype {
    pub fn all() -> &'static [Ktype] {
        use Ktype::*;
        &[
            CreateProcess, TerminateProcess, EnumProcess, CreateThread, TerminateThread,
            EnumThread, LoadImage, UnloadImage, EnumImage, CreateHandle, CloseHandle,
            CreateFile, ReadFile, WriteFile, DeleteFile, RegOpenKey, RegSetValue,
            RegDeleteKey, Connect, Accept,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Ktype::CreateProcess => "CreateProcess",
            Ktype::TerminateProcess => "TerminateProcess",
            Ktype::EnumProcess => "EnumProcess",
            Ktype::CreateThread => "CreateThread",
            Ktype::TerminateThread => "TerminateThread",
            Ktype::EnumThread => "EnumThread",
            Ktype::LoadImage => "LoadImage",
            Ktype::UnloadImage => "UnloadImage",
            Ktype::EnumImage => "EnumImage",
            Ktype::CreateHandle => "CreateHandle",
            Ktype::CloseHandle => "CloseHandle",
            Ktype::CreateFile => "CreateFile",
            Ktype::ReadFile => "ReadFile",
            Ktype::WriteFile => "WriteFile",
            Ktype::DeleteFile => "DeleteFile",
            Ktype::RegOpenKey => "RegOpenKey",
            Ktype::RegSetValue => "RegSetValue",
            Ktype::RegDeleteKey => "RegDeleteKey",
            Ktype::Connect => "Connect",
            Ktype::Accept => "Accept",
        }
    }

    pub fn category(&self) -> Category {
        match self {
            Ktype::CreateProcess | Ktype::TerminateProcess | Ktype::EnumProcess => Category::Process,
            Ktype::CreateThread | Ktype::TerminateThread | Ktype::EnumThread => Category::Thread,
            Ktype::LoadImage | Ktype::UnloadImage | Ktype::EnumImage => Category::Image,
            Ktype::CreateHandle | Ktype::CloseHandle => Category::Handle,
            Ktype::CreateFile | Ktype::ReadFile | Ktype::WriteFile | Ktype::DeleteFile => {
                Category::File
            }
            Ktype::RegOpenKey | Ktype::RegSetValue | Ktype::RegDeleteKey => Category::Registry,
            Ktype::Connect | Ktype::Accept => Category::Net,
        }
    }
}

impl fmt::Display for Ktype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type '{0}'")]
pub struct UnknownKtype(pub String);

impl FromStr for Ktype {
    type Err = UnknownKtype;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ktype::all()
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownKtype(s.to_owned()))
    }
}

/// One kernel event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kevent {
    /// Strictly increasing per stream.
    pub seq: u64,
    #[serde(rename = "type")]
    pub ktype: Ktype,
    pub pid: u32,
    pub tid: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub kparams: Kparams,
}

impl Kevent {
    pub fn new(seq: u64, ktype: Ktype, pid: u32, tid: u32, timestamp: DateTime<Utc>) -> Self {
        Self {
            seq,
            ktype,
            pid,
            tid,
            timestamp,
            kparams: Kparams::new(),
        }
    }

    /// Builder-style parameter append, mostly for sources and tests.
    pub fn with_param(mut self, name: &str, value: Value) -> Self {
        self.kparams.append(name, value);
        self
    }

    pub fn is_handle(&self) -> bool {
        self.ktype.category() == Category::Handle
    }
}

impl fmt::Display for Kevent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seq={} type={} pid={} tid={}",
            self.seq, self.ktype, self.pid, self.tid
        )?;
        for p in self.kparams.iter() {
            write!(f, " {}={}", p.name, p.value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ktype_parses_case_insensitively() {
        assert_eq!("createhandle".parse::<Ktype>(), Ok(Ktype::CreateHandle));
        assert_eq!("CloseHandle".parse::<Ktype>(), Ok(Ktype::CloseHandle));
        assert!("Bogus".parse::<Ktype>().is_err());
    }

    #[test]
    fn every_ktype_round_trips_through_its_name() {
        for k in Ktype::all() {
            assert_eq!(k.as_str().parse::<Ktype>().as_ref(), Ok(k));
        }
    }

    #[test]
    fn kevent_json_uses_type_key() {
        let kevt = Kevent::new(7, Ktype::CreateHandle, 4, 8, Utc::now())
            .with_param(kparams::names::HANDLE_OBJECT, Value::Hex(Hex(0x1000)));
        let json = serde_json::to_value(&kevt).unwrap();
        assert_eq!(json["type"], "CreateHandle");
        assert_eq!(json["seq"], 7);

        let back: Kevent = serde_json::from_value(json).unwrap();
        assert_eq!(back, kevt);
    }
}
