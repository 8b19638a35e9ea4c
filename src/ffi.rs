// CLASSIFICATION: COMMUNITY
// Filename: ffi.rs v0.4
// Author: Lukas Bower
// Date Modified: 2026-06-08

//! C ABI shared with the runtime and payload libraries.
//!
//! The entry points are plain exported symbols with fixed signatures; no
//! vtables, no discovery. The pre-init blob is magic-framed at both ends
//! so a half-smashed handoff is caught before the runtime trusts it.

use std::ffi::{CString, NulError, OsString};
use std::os::raw::{c_char, c_int};

/// Frame magic for [`PreInitData`] ("SUPm").
pub const PRE_INIT_MAGIC: u32 = 0x5355_506d;

/// Version sentinel passed to `init_runtime_ex`.
pub const INIT_VERSION: u32 = 0x0001_0000;

/// `init_runtime_ex` flag: the support device is open and handed over.
pub const RUNTIME_FLAG_WITH_DRIVER: u32 = 1 << 0;

/// Nil device value inside [`PreInitData`].
pub const DEVICE_NIL: isize = -1;

/// Blob carrying the open device and driver cookies from the stub to the
/// runtime. Produced by the driver opener, consumed exactly once by
/// runtime pre-init; after the handoff the stub never touches the device
/// again.
#[repr(C)]
#[derive(Debug)]
pub struct PreInitData {
    pub magic: u32,
    /// Raw descriptor (UNIX) or handle (Windows); [`DEVICE_NIL`] if the
    /// device was not opened.
    pub device: isize,
    pub cookie: u32,
    pub session_cookie: u32,
    pub driver_version: u32,
    pub end_magic: u32,
}

impl PreInitData {
    pub fn nil() -> PreInitData {
        PreInitData {
            magic: PRE_INIT_MAGIC,
            device: DEVICE_NIL,
            cookie: 0,
            session_cookie: 0,
            driver_version: 0,
            end_magic: PRE_INIT_MAGIC,
        }
    }

    pub fn has_device(&self) -> bool {
        self.device != DEVICE_NIL
    }
}

pub type InitRuntimeExFn = unsafe extern "C" fn(
    version: u32,
    flags: u32,
    argc: c_int,
    argv: *mut *mut c_char,
    exe_path: *const c_char,
) -> c_int;

pub type PreInitFn = unsafe extern "C" fn(data: *const PreInitData, flags: u32) -> c_int;

pub type LogRelPrintfFn = unsafe extern "C" fn(fmt: *const c_char, ...);

pub type TrustedMainFn =
    unsafe extern "C" fn(argc: c_int, argv: *mut *mut c_char, envp: *mut *mut c_char) -> c_int;

/// Optional fatal-error export. The message arrives pre-rendered as the
/// format string.
pub type TrustedErrorFn =
    unsafe extern "C" fn(where_: *const c_char, what: c_int, rc: c_int, msg: *const c_char);

pub const SYM_INIT_RUNTIME_EX: &[u8] = b"init_runtime_ex";
pub const SYM_PRE_INIT: &[u8] = b"pre_init";
pub const SYM_LOG_REL_PRINTF: &[u8] = b"log_rel_printf";
pub const SYM_TRUSTED_MAIN: &[u8] = b"TrustedMain";
pub const SYM_TRUSTED_ERROR: &[u8] = b"TrustedError";

/// Owned NUL-terminated string vector with the trailing null slot C main
/// conventions expect.
pub struct CStrVec {
    _strings: Vec<CString>,
    ptrs: Vec<*mut c_char>,
}

impl CStrVec {
    pub fn new<I>(items: I) -> Result<CStrVec, NulError>
    where
        I: IntoIterator<Item = OsString>,
    {
        let strings = items
            .into_iter()
            .map(os_to_cstring)
            .collect::<Result<Vec<_>, _>>()?;
        let mut ptrs: Vec<*mut c_char> =
            strings.iter().map(|s| s.as_ptr() as *mut c_char).collect();
        ptrs.push(std::ptr::null_mut());
        Ok(CStrVec {
            _strings: strings,
            ptrs,
        })
    }

    /// Element count, excluding the trailing null slot.
    pub fn len(&self) -> usize {
        self.ptrs.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_mut_ptr(&mut self) -> *mut *mut c_char {
        self.ptrs.as_mut_ptr()
    }
}

#[cfg(unix)]
fn os_to_cstring(s: OsString) -> Result<CString, NulError> {
    use std::os::unix::ffi::OsStringExt;
    CString::new(s.into_vec())
}

#[cfg(windows)]
fn os_to_cstring(s: OsString) -> Result<CString, NulError> {
    CString::new(s.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_init_nil_is_framed_and_deviceless() {
        let d = PreInitData::nil();
        assert_eq!(d.magic, PRE_INIT_MAGIC);
        assert_eq!(d.end_magic, PRE_INIT_MAGIC);
        assert!(!d.has_device());
    }

    #[test]
    fn cstrvec_has_trailing_null_slot() {
        let mut v = CStrVec::new(vec![OsString::from("a"), OsString::from("bc")]).unwrap();
        assert_eq!(v.len(), 2);
        let ptrs = v.as_mut_ptr();
        unsafe {
            assert!(!(*ptrs).is_null());
            assert!(!(*ptrs.add(1)).is_null());
            assert!((*ptrs.add(2)).is_null());
        }
    }

    #[test]
    fn interior_nul_is_rejected() {
        let bad = OsString::from("a\0b");
        assert!(CStrVec::new(vec![bad]).is_err());
    }
}
