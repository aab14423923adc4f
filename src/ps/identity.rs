// src/ps/identity.rs

//! Inputs for the process UUID.
//!
//! PIDs are recycled, so downstream consumers key processes by a 64-bit
//! UUID instead. The preferred form combines the per-boot identifier with
//! the process sequence number the kernel assigns to every process object
//! (Windows 10 1507 and later). Older systems, or processes we cannot open,
//! fall back to boot id + PID + start time. Neither form is guaranteed
//! collision-free; both are best effort.

use chrono::{DateTime, Utc};

pub trait ProcessIdentity: Send + Sync {
    /// Identifier of the current boot session.
    fn boot_id(&self) -> u64;

    /// Kernel sequence number of the process object, when the OS exposes it.
    fn sequence_number(&self, pid: u32) -> Option<u64>;
}

/// Derives the UUID for `pid`.
pub fn compute_uuid(
    identity: &dyn ProcessIdentity,
    pid: u32,
    start_time: Option<DateTime<Utc>>,
) -> u64 {
    let boot = identity.boot_id();
    match identity.sequence_number(pid).filter(|&seq| seq != 0) {
        Some(seq) => (boot << 30) | seq,
        None => {
            let nanos = start_time
                .and_then(|t| t.timestamp_nanos_opt())
                .unwrap_or(0) as u64;
            (boot << 30).wrapping_add(u64::from(pid)) | nanos
        }
    }
}

/// Fixed boot id and sequence numbers. Useful off Windows and in tests.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentity {
    pub boot_id: u64,
    pub sequences: std::collections::HashMap<u32, u64>,
}

impl StaticIdentity {
    pub fn new(boot_id: u64) -> Self {
        Self {
            boot_id,
            sequences: Default::default(),
        }
    }

    pub fn with_sequence(mut self, pid: u32, seq: u64) -> Self {
        self.sequences.insert(pid, seq);
        self
    }
}

impl ProcessIdentity for StaticIdentity {
    fn boot_id(&self) -> u64 {
        self.boot_id
    }

    fn sequence_number(&self, pid: u32) -> Option<u64> {
        self.sequences.get(&pid).copied()
    }
}

/// Reads the live boot id and sequence numbers from the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysIdentity;

#[cfg(not(windows))]
impl ProcessIdentity for SysIdentity {
    fn boot_id(&self) -> u64 {
        0
    }

    fn sequence_number(&self, _pid: u32) -> Option<u64> {
        None
    }
}

#[cfg(windows)]
impl ProcessIdentity for SysIdentity {
    fn boot_id(&self) -> u64 {
        // KUSER_SHARED_DATA is mapped read-only at this address in every process.
        const KUSER_SHARED_DATA_BOOT_ID: usize = 0x7FFE_02C4;
        u64::from(unsafe { std::ptr::read_volatile(KUSER_SHARED_DATA_BOOT_ID as *const u32) })
    }

    fn sequence_number(&self, pid: u32) -> Option<u64> {
        use crate::handle::sys::imp::OwnedHandle;
        use windows_sys::{
            Wdk::System::Threading::NtQueryInformationProcess,
            Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION},
        };
        const PROCESS_SEQUENCE_NUMBER: i32 = 82;

        let process = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid) };
        if process.is_null() {
            return None;
        }
        let process = OwnedHandle(process);
        let mut seq = 0u64;
        let status = unsafe {
            NtQueryInformationProcess(
                process.0,
                PROCESS_SEQUENCE_NUMBER,
                (&mut seq as *mut u64).cast(),
                std::mem::size_of::<u64>() as u32,
                std::ptr::null_mut(),
            )
        };
        (status >= 0 && seq != 0).then_some(seq)
    }
}
