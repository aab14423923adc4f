// src/kevent/kparams.rs

//! Typed, ordered parameter set carried by every kernel event.
//!
//! Parameters keep their insertion order and names are unique inside one
//! event. Accessors are typed and fallible: asking for a missing parameter
//! yields [`KparamsError::ParameterNotFound`], asking for the wrong width or
//! kind yields [`KparamsError::TypeMismatch`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Well-known parameter names shared by the transport and the interceptors.
pub mod names {
    // handles
    pub const HANDLE_ID: &str = "handle_id";
    pub const HANDLE_OBJECT: &str = "handle_object";
    pub const HANDLE_OBJECT_NAME: &str = "handle_name";
    pub const HANDLE_OBJECT_TYPE_ID: &str = "type_id";
    pub const HANDLE_OBJECT_TYPE_NAME: &str = "type_name";

    // processes
    pub const PROCESS_ID: &str = "pid";
    pub const PROCESS_PARENT_ID: &str = "ppid";
    pub const PROCESS_NAME: &str = "name";
    pub const COMM: &str = "comm";
    pub const EXE: &str = "exe";
    pub const CWD: &str = "cwd";
    pub const USER_SID: &str = "sid";
    pub const SESSION_ID: &str = "session_id";

    // threads
    pub const THREAD_ID: &str = "tid";
    pub const IO_PRIO: &str = "io_prio";
    pub const BASE_PRIO: &str = "base_prio";
    pub const PAGE_PRIO: &str = "page_prio";
    pub const USTACK_BASE: &str = "ustack_base";
    pub const USTACK_LIMIT: &str = "ustack_limit";
    pub const KSTACK_BASE: &str = "kstack_base";
    pub const KSTACK_LIMIT: &str = "kstack_limit";
    pub const START_ADDR: &str = "start_address";

    // images
    pub const IMAGE_FILENAME: &str = "file_name";
    pub const IMAGE_SIZE: &str = "image_size";
    pub const IMAGE_CHECKSUM: &str = "checksum";
    pub const IMAGE_BASE: &str = "base_address";
    pub const IMAGE_DEFAULT_BASE: &str = "default_address";
}

/// All the ways a parameter lookup or mutation can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KparamsError {
    #[error("parameter '{0}' not found")]
    ParameterNotFound(String),

    #[error("parameter '{name}' is {actual}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("parameter '{name}' value {value} does not fit in {width}")]
    OutOfRange {
        name: String,
        value: Hex,
        width: &'static str,
    },
}

/// An integer the transport ships in hexadecimal form (addresses, handles).
///
/// Serialized as a `0x`-prefixed string so captured JSON stays readable.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hex(pub u64);

impl Hex {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for Hex {
    fn from(v: u64) -> Self {
        Hex(v)
    }
}

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl FromStr for Hex {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        u64::from_str_radix(digits, 16).map(Hex)
    }
}

impl Serialize for Hex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Typed parameter value. The variant is the parameter's type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Hex(Hex),
    AnsiString(String),
    UnicodeString(String),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Uint8(_) => "uint8",
            Value::Uint16(_) => "uint16",
            Value::Uint32(_) => "uint32",
            Value::Uint64(_) => "uint64",
            Value::Hex(_) => "hex",
            Value::AnsiString(_) => "ansi_string",
            Value::UnicodeString(_) => "unicode_string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Uint8(v) => write!(f, "{v}"),
            Value::Uint16(v) => write!(f, "{v}"),
            Value::Uint32(v) => write!(f, "{v}"),
            Value::Uint64(v) => write!(f, "{v}"),
            Value::Hex(v) => write!(f, "{v}"),
            Value::AnsiString(s) | Value::UnicodeString(s) => f.write_str(s),
        }
    }
}

/// One named parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kparam {
    pub name: String,
    #[serde(flatten)]
    pub value: Value,
}

/// Ordered parameter set. Lookups are linear; events carry a handful of
/// parameters so a map would only cost more.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Kparams(Vec<Kparam>);

// Repeated names collapse onto the first position; the last value wins.
impl<'de> Deserialize<'de> for Kparams {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<Kparam>::deserialize(deserializer)?;
        let mut kpars = Kparams::new();
        for Kparam { name, value } in raw {
            kpars.append(&name, value);
        }
        Ok(kpars)
    }
}

macro_rules! typed_getter {
    ($fn_name:ident, $variant:ident, $ty:ty, $label:literal) => {
        pub fn $fn_name(&self, name: &str) -> Result<$ty, KparamsError> {
            match self.find(name)? {
                Value::$variant(v) => Ok(*v),
                other => Err(mismatch(name, $label, other)),
            }
        }
    };
}

impl Kparams {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Kparam> {
        self.0.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.position(name).map(|i| &self.0[i].value)
    }

    /// Inserts `value` under `name`, overwriting an existing parameter in place.
    pub fn append(&mut self, name: &str, value: Value) {
        match self.position(name) {
            Some(i) => self.0[i].value = value,
            None => self.0.push(Kparam {
                name: name.to_owned(),
                value,
            }),
        }
    }

    /// Replaces the value (and possibly the type) of an existing parameter.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), KparamsError> {
        let i = self
            .position(name)
            .ok_or_else(|| KparamsError::ParameterNotFound(name.to_owned()))?;
        self.0[i].value = value;
        Ok(())
    }

    /// Removes the parameter. Missing names are ignored.
    pub fn remove(&mut self, name: &str) {
        if let Some(i) = self.position(name) {
            self.0.remove(i);
        }
    }

    typed_getter!(get_u8, Uint8, u8, "uint8");
    typed_getter!(get_u16, Uint16, u16, "uint16");
    typed_getter!(get_u32, Uint32, u32, "uint32");
    typed_getter!(get_u64, Uint64, u64, "uint64");
    typed_getter!(get_hex, Hex, Hex, "hex");

    pub fn get_hex_as_u64(&self, name: &str) -> Result<u64, KparamsError> {
        self.get_hex(name).map(Hex::value)
    }

    pub fn get_hex_as_u32(&self, name: &str) -> Result<u32, KparamsError> {
        let hex = self.get_hex(name)?;
        u32::try_from(hex.0).map_err(|_| KparamsError::OutOfRange {
            name: name.to_owned(),
            value: hex,
            width: "uint32",
        })
    }

    /// Returns either string flavour.
    pub fn get_string(&self, name: &str) -> Result<String, KparamsError> {
        match self.find(name)? {
            Value::AnsiString(s) | Value::UnicodeString(s) => Ok(s.clone()),
            other => Err(mismatch(name, "string", other)),
        }
    }

    fn find(&self, name: &str) -> Result<&Value, KparamsError> {
        self.get(name)
            .ok_or_else(|| KparamsError::ParameterNotFound(name.to_owned()))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|p| p.name == name)
    }
}

impl FromIterator<(&'static str, Value)> for Kparams {
    fn from_iter<I: IntoIterator<Item = (&'static str, Value)>>(iter: I) -> Self {
        let mut kparams = Kparams::new();
        for (name, value) in iter {
            kparams.append(name, value);
        }
        kparams
    }
}

fn mismatch(name: &str, expected: &'static str, actual: &Value) -> KparamsError {
    KparamsError::TypeMismatch {
        name: name.to_owned(),
        expected,
        actual: actual.kind(),
    }
}
