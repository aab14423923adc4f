//! Process snapshot: the agent's model of every live process.

pub mod cmdline;
pub mod identity;
pub mod persist;
pub mod snapshotter;
pub mod types;

use thiserror::Error;

use crate::kevent::KparamsError;

pub use identity::{ProcessIdentity, StaticIdentity, SysIdentity};
pub use snapshotter::Snapshotter;
pub use types::{Module, Ps, PsRecord, Thread};

/// Failure to apply an event to the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("cannot decode snapshot update: {0}")]
    Decode(#[from] KparamsError),
}
