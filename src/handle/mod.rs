//! Handle objects, object type resolution and name canonicalisation.

pub mod key;
pub mod query;
pub mod store;
pub mod sys;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::kevent::{Kevent, KparamsError, kparams::names};

pub use query::{HandleIntrospector, QueryPool};
pub use store::ObjectTypeStore;

// Object type names as reported by the object manager.
pub const KEY: &str = "Key";
pub const FILE: &str = "File";
pub const DESKTOP: &str = "Desktop";
pub const SYMBOLIC_LINK: &str = "SymbolicLink";

/// Types whose CreateHandle commonly lacks the object name. The name
/// shows up on the matching CloseHandle instead.
pub fn name_arrives_on_close(type_name: &str) -> bool {
    matches!(type_name, KEY | FILE | DESKTOP | SYMBOLIC_LINK)
}

/// Failures of the OS handle duplicate-and-query path. None of these are
/// retried; each one fails the single event that triggered the query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("cannot open process {pid} for handle duplication (os error {code})")]
    OpenProcess { pid: u32, code: i32 },

    #[error("cannot duplicate handle {handle:#x} of process {pid} (os error {code})")]
    Duplicate { pid: u32, handle: u32, code: i32 },

    #[error("object type query on handle {handle:#x} failed with status {status:#x}")]
    Query { handle: u32, status: i32 },

    #[error("object type query timed out after {0:?}")]
    Timeout(Duration),

    #[error("object type query pool is saturated")]
    Busy,

    #[error("object type query pool is shut down")]
    Closed,

    #[error("object introspection is not supported on this platform")]
    Unsupported,
}

/// An open handle tracked in the owning process' snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handle {
    pub num: u32,
    pub object: u64,
    #[serde(rename = "type")]
    pub type_name: String,
    pub name: String,
    pub pid: u32,
}

impl Handle {
    /// Builds the handle from an enriched CreateHandle/CloseHandle event. The
    /// event must already carry the normalised id and the resolved type name.
    pub fn from_kevent(kevt: &Kevent) -> Result<Self, KparamsError> {
        let kpars = &kevt.kparams;
        Ok(Self {
            num: kpars.get_u32(names::HANDLE_ID)?,
            object: kpars.get_hex_as_u64(names::HANDLE_OBJECT)?,
            type_name: kpars.get_string(names::HANDLE_OBJECT_TYPE_NAME)?,
            name: kpars.get_string(names::HANDLE_OBJECT_NAME)?,
            pid: kevt.pid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kevent::{Hex, Ktype, Value};
    use chrono::Utc;

    #[test]
    fn deferrable_types() {
        for t in [KEY, FILE, DESKTOP, SYMBOLIC_LINK] {
            assert!(name_arrives_on_close(t), "{t}");
        }
        for t in ["Process", "Thread", "Mutant", ""] {
            assert!(!name_arrives_on_close(t), "{t}");
        }
    }

    #[test]
    fn handle_from_enriched_kevent() {
        let kevt = Kevent::new(1, Ktype::CreateHandle, 880, 1, Utc::now())
            .with_param(names::HANDLE_ID, Value::Uint32(0x1a4))
            .with_param(names::HANDLE_OBJECT, Value::Hex(Hex(0xffff_a000)))
            .with_param(names::HANDLE_OBJECT_TYPE_NAME, Value::AnsiString("Mutant".into()))
            .with_param(names::HANDLE_OBJECT_NAME, Value::AnsiString(r"\Sessions\1\BaseNamedObjects\m".into()));

        let h = Handle::from_kevent(&kevt).unwrap();
        assert_eq!(h.num, 0x1a4);
        assert_eq!(h.object, 0xffff_a000);
        assert_eq!(h.type_name, "Mutant");
        assert_eq!(h.pid, 880);
    }

    #[test]
    fn handle_from_raw_kevent_fails_on_hex_id() {
        let kevt = Kevent::new(1, Ktype::CreateHandle, 880, 1, Utc::now())
            .with_param(names::HANDLE_ID, Value::Hex(Hex(0x1a4)));
        assert!(matches!(
            Handle::from_kevent(&kevt),
            Err(KparamsError::TypeMismatch { .. })
        ));
    }
}
