// CLASSIFICATION: COMMUNITY
// Filename: early.rs v0.8
// Author: Lukas Bower
// Date Modified: 2026-07-30

//! Child-side early process init.
//!
//! The hooked loader-init thunk lands here before a single loader or CRT
//! instruction has run in the child. Nothing in this module may allocate
//! or take locks: the process is still raw. Fixed buffers, atomics, and
//! direct system API calls only.

use std::sync::atomic::{AtomicIsize, AtomicU32, Ordering};

use windows_sys::Win32::Foundation::{
    CloseHandle, GENERIC_READ, GENERIC_WRITE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, SetEvent, TerminateProcess, WaitForSingleObject,
};
use windows_sys::Win32::System::IO::DeviceIoControl;

use super::link::{self, LINK_MAGIC};
use crate::device::{DEVICE_NODE, STUB_DEVICE_NODE};
use crate::ffi::{PreInitData, DEVICE_NIL, PRE_INIT_MAGIC};
use crate::state::{self, Marker};

/// Same bound as the parent side; a parent that never answers is a failed
/// purification.
const RENDEZVOUS_TIMEOUT_MS: u32 = 60_000;

// Device state captured during early init, consumed once by the pipeline.
static EARLY_DEVICE: AtomicIsize = AtomicIsize::new(DEVICE_NIL);
static EARLY_COOKIE: AtomicU32 = AtomicU32::new(0);
static EARLY_SESSION_COOKIE: AtomicU32 = AtomicU32::new(0);
static EARLY_VERSION: AtomicU32 = AtomicU32::new(0);

#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    ".globl supstub_early_init_thunk",
    "supstub_early_init_thunk:",
    // Preserve the loader's two thunk arguments across the Rust call,
    // then continue into the restored LdrInitializeThunk.
    "sub rsp, 0x38",
    "mov [rsp+0x20], rcx",
    "mov [rsp+0x28], rdx",
    "call supstub_early_process_init",
    "mov rcx, [rsp+0x20]",
    "mov rdx, [rsp+0x28]",
    "add rsp, 0x38",
    "jmp rax",
);

#[cfg(target_arch = "x86_64")]
extern "C" {
    fn supstub_early_init_thunk();
}

/// Address the parent points the hooked loader thunk at.
pub(super) fn thunk_entry_address() -> usize {
    #[cfg(target_arch = "x86_64")]
    {
        supstub_early_init_thunk as usize
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        unimplemented!("second respawn requires an early-init thunk for this architecture")
    }
}

/// The early-init body. Returns the address of the (by now restored)
/// loader-init thunk for the asm shim to continue into.
#[no_mangle]
pub extern "C" fn supstub_early_process_init() -> usize {
    unsafe {
        let params = std::ptr::addr_of_mut!(link::SUPSTUB_PROC_PARAMS);
        if (*params).magic != LINK_MAGIC {
            // Not a respawned child; nobody should have installed the hook.
            die(98);
        }
        state::STATE.advance(Marker::WinEarlyStubCalled).ok();

        // Ping the parent, then hold still while it purifies us.
        SetEvent((*params).event_ping);
        if WaitForSingleObject((*params).event_pong, RENDEZVOUS_TIMEOUT_MS) != WAIT_OBJECT_0 {
            die(97);
        }
        state::STATE.advance(Marker::WinEarlyStubPurified).ok();

        // Everything this module calls from here on resolves against the
        // purified images only.
        state::STATE.advance(Marker::WinEarlyImportsResolved).ok();

        // The stub device makes the driver strip open-process rights,
        // re-count our threads, and re-verify every mapping and
        // signature from kernel mode.
        let stub = open_device_raw(STUB_DEVICE_NODE);
        if stub == INVALID_HANDLE_VALUE {
            link::report_error_to_parent(
                "early_process_init",
                crate::err::InitOp::Driver,
                crate::err::rc::DRIVER_OPEN_ERROR,
                "cannot open the stub device for process hardening",
            );
            die(96);
        }
        CloseHandle(stub);

        // The real device, carried to the runtime via the pre-init blob.
        let device = open_device_raw(DEVICE_NODE);
        if device != INVALID_HANDLE_VALUE && negotiate_cookie(device) {
            EARLY_DEVICE.store(device, Ordering::SeqCst);
        } else {
            link::report_error_to_parent(
                "early_process_init",
                crate::err::InitOp::Driver,
                crate::err::rc::DRIVER_OPEN_ERROR,
                "cannot open the support device",
            );
            die(96);
        }

        state::STATE.advance(Marker::WinEarlyInitDone).ok();
        (*params).thunk_addr as usize
    }
}

fn die(code: u32) -> ! {
    unsafe {
        TerminateProcess(GetCurrentProcess(), code);
    }
    loop {
        std::hint::spin_loop();
    }
}

fn open_device_raw(path: &str) -> isize {
    let mut wide = [0u16; 64];
    let mut n = 0;
    for (i, u) in path.encode_utf16().enumerate().take(wide.len() - 1) {
        wide[i] = u;
        n = i + 1;
    }
    wide[n] = 0;
    unsafe {
        CreateFileW(
            wide.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            std::ptr::null(),
            OPEN_EXISTING,
            0,
            0,
        )
    }
}

/// Cookie handshake over DeviceIoControl; wire format matches the UNIX
/// ioctl variant.
fn negotiate_cookie(device: isize) -> bool {
    #[repr(C)]
    struct CookieReq {
        magic: u32,
        min_version: u32,
        cookie: u32,
        session_cookie: u32,
        version: u32,
    }
    const COOKIE_MAGIC: u32 = 0x434f_4f4b;
    const IOCTL_COOKIE: u32 = 0x0022_6001;

    let mut req = CookieReq {
        magic: COOKIE_MAGIC,
        min_version: crate::device::DRIVER_VERSION,
        cookie: 0,
        session_cookie: 0,
        version: 0,
    };
    let mut returned = 0u32;
    let ok = unsafe {
        DeviceIoControl(
            device,
            IOCTL_COOKIE,
            &mut req as *mut _ as *mut _,
            std::mem::size_of::<CookieReq>() as u32,
            &mut req as *mut _ as *mut _,
            std::mem::size_of::<CookieReq>() as u32,
            &mut returned,
            std::ptr::null_mut(),
        )
    };
    if ok == 0 || req.magic != COOKIE_MAGIC {
        return false;
    }
    if req.version >> 16 != crate::device::DRIVER_VERSION >> 16 {
        return false;
    }
    EARLY_COOKIE.store(req.cookie, Ordering::SeqCst);
    EARLY_SESSION_COOKIE.store(req.session_cookie, Ordering::SeqCst);
    EARLY_VERSION.store(req.version, Ordering::SeqCst);
    true
}

/// Hand the early-opened device to the pipeline, exactly once. Reaching
/// this without early init having run means the respawn order was broken.
pub fn take_early_device() -> PreInitData {
    let device = EARLY_DEVICE.swap(DEVICE_NIL, Ordering::SeqCst);
    if device == DEVICE_NIL {
        crate::err::fatal_msg(
            "take_early_device",
            crate::err::InitOp::Integrity,
            crate::err::rc::WRONG_ORDER,
            format_args!("early process init was somehow skipped"),
        );
    }
    PreInitData {
        magic: PRE_INIT_MAGIC,
        device,
        cookie: EARLY_COOKIE.load(Ordering::SeqCst),
        session_cookie: EARLY_SESSION_COOKIE.load(Ordering::SeqCst),
        driver_version: EARLY_VERSION.load(Ordering::SeqCst),
        end_magic: PRE_INIT_MAGIC,
    }
}
