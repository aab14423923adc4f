// src/handle/sys.rs

//! System-backed [`HandleIntrospector`].
//!
//! On Windows the handle is duplicated out of the owning process with no
//! access rights beyond what `NtQueryObject(ObjectTypeInformation)` needs,
//! and both the process and the duplicate are closed through RAII guards on
//! every path. Elsewhere every query reports [`HandleError::Unsupported`].

use super::{HandleError, HandleIntrospector};

#[derive(Debug, Default, Clone, Copy)]
pub struct SysIntrospector;

#[cfg(not(windows))]
impl HandleIntrospector for SysIntrospector {
    fn query_type(&self, _pid: u32, _handle: u32) -> Result<String, HandleError> {
        Err(HandleError::Unsupported)
    }
}

#[cfg(windows)]
impl HandleIntrospector for SysIntrospector {
    fn query_type(&self, pid: u32, handle: u32) -> Result<String, HandleError> {
        imp::query_type(pid, handle)
    }
}

#[cfg(windows)]
pub(crate) mod imp {
    use std::{ptr, slice};
    use windows_sys::{
        Wdk::Foundation::NtQueryObject,
        Win32::{
            Foundation::{CloseHandle, DuplicateHandle, GetLastError, HANDLE, UNICODE_STRING},
            System::Threading::{GetCurrentProcess, OpenProcess, PROCESS_DUP_HANDLE},
        },
    };

    use crate::handle::HandleError;

    const OBJECT_TYPE_INFORMATION: i32 = 2;
    const STATUS_INFO_LENGTH_MISMATCH: i32 = 0xC000_0004_u32 as i32;

    /// Closes the wrapped handle on drop.
    pub(crate) struct OwnedHandle(pub(crate) HANDLE);

    impl Drop for OwnedHandle {
        fn drop(&mut self) {
            if !self.0.is_null() {
                unsafe { CloseHandle(self.0) };
            }
        }
    }

    pub(crate) fn query_type(pid: u32, handle: u32) -> Result<String, HandleError> {
        let process = unsafe { OpenProcess(PROCESS_DUP_HANDLE, 0, pid) };
        if process.is_null() {
            let code = unsafe { GetLastError() } as i32;
            return Err(HandleError::OpenProcess { pid, code });
        }
        let process = OwnedHandle(process);

        let mut dup: HANDLE = ptr::null_mut();
        // desired access 0, no DUPLICATE_SAME_ACCESS: the copy can only be queried
        let ok = unsafe {
            DuplicateHandle(
                process.0,
                handle as usize as HANDLE,
                GetCurrentProcess(),
                &mut dup,
                0,
                0,
                0,
            )
        };
        if ok == 0 {
            let code = unsafe { GetLastError() } as i32;
            return Err(HandleError::Duplicate { pid, handle, code });
        }
        let dup = OwnedHandle(dup);

        query_object_type(&dup, handle)
    }

    fn query_object_type(dup: &OwnedHandle, handle: u32) -> Result<String, HandleError> {
        // u64 backing keeps UNICODE_STRING aligned
        let mut buf = vec![0u64; 128];
        for _ in 0..2 {
            let len = (buf.len() * 8) as u32;
            let mut needed = 0u32;
            let status = unsafe {
                NtQueryObject(
                    dup.0,
                    OBJECT_TYPE_INFORMATION,
                    buf.as_mut_ptr().cast(),
                    len,
                    &mut needed,
                )
            };
            if status == STATUS_INFO_LENGTH_MISMATCH && needed > len {
                buf = vec![0u64; (needed as usize).div_ceil(8)];
                continue;
            }
            if status < 0 {
                return Err(HandleError::Query { handle, status });
            }
            let info = unsafe { &*(buf.as_ptr() as *const UNICODE_STRING) };
            if info.Buffer.is_null() || info.Length == 0 {
                return Ok(String::new());
            }
            let wide = unsafe { slice::from_raw_parts(info.Buffer, info.Length as usize / 2) };
            return Ok(String::from_utf16_lossy(wide));
        }
        Err(HandleError::Query {
            handle,
            status: STATUS_INFO_LENGTH_MISMATCH,
        })
    }
}

#[cfg(all(test, not(windows)))]
mod tests {
    use super::*;

    #[test]
    fn unsupported_off_windows() {
        assert_eq!(SysIntrospector.query_type(4, 0x10), Err(HandleError::Unsupported));
    }
}
