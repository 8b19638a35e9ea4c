// CLASSIFICATION: COMMUNITY
// Filename: link.rs v0.6
// Author: Lukas Bower
// Date Modified: 2026-07-28

//! Rendezvous structure shared between the respawn parent and child.
//!
//! The parent writes this block directly into the suspended child at the
//! address of our own static; both processes run the same image at the
//! same base, so the address is known before the child ever executes. The
//! protocol over it is strict ping-pong; no field has two writers at the
//! same time.

use windows_sys::Win32::Foundation::HANDLE;

pub const LINK_MAGIC: u32 = 0x5250_4c4b;

pub const ERR_WHERE_LEN: usize = 64;
pub const ERR_MSG_LEN: usize = 256;

/// Maximum bytes a loader-thunk hook can occupy.
pub const HOOK_MAX: usize = 16;

#[repr(C)]
pub struct RespawnLink {
    pub magic: u32,
    /// NTDLL base in the child, as mapped at hook-install time.
    pub ntdll_base: u64,
    /// Address of the hooked loader-init thunk.
    pub thunk_addr: u64,
    /// Original bytes found under the hook.
    pub saved_thunk: [u8; HOOK_MAX],
    pub saved_thunk_len: u32,
    /// Inherited event handles: child signals ping, parent answers pong.
    pub event_ping: HANDLE,
    pub event_pong: HANDLE,
    /// Inherited handle to the parent process, for the watcher thread.
    pub parent_process: HANDLE,
    /// Child-to-parent error report; `err_pending` flips last.
    pub err_what: i32,
    pub err_rc: i32,
    pub err_where: [u8; ERR_WHERE_LEN],
    pub err_msg: [u8; ERR_MSG_LEN],
    pub err_pending: u32,
}

impl RespawnLink {
    pub const fn zeroed() -> RespawnLink {
        RespawnLink {
            magic: 0,
            ntdll_base: 0,
            thunk_addr: 0,
            saved_thunk: [0; HOOK_MAX],
            saved_thunk_len: 0,
            event_ping: 0,
            event_pong: 0,
            parent_process: 0,
            err_what: 0,
            err_rc: 0,
            err_where: [0; ERR_WHERE_LEN],
            err_msg: [0; ERR_MSG_LEN],
            err_pending: 0,
        }
    }
}

/// The block the parent fills in before the child resumes. Written by
/// exactly one side at any protocol step.
#[no_mangle]
pub static mut SUPSTUB_PROC_PARAMS: RespawnLink = RespawnLink::zeroed();

/// Address of the link inside this image; identical in the child because
/// the image section is shared at the same base.
pub fn link_address() -> usize {
    unsafe { std::ptr::addr_of!(SUPSTUB_PROC_PARAMS) as usize }
}

pub fn link_size() -> usize {
    std::mem::size_of::<RespawnLink>()
}

pub fn parent_process_handle() -> HANDLE {
    unsafe { std::ptr::addr_of!(SUPSTUB_PROC_PARAMS.parent_process).read() }
}

fn fill_bytes(dst: &mut [u8], src: &str) {
    let n = src.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
    dst[n] = 0;
}

/// Forward a fatal error to the respawn parent through the link. Only
/// meaningful in a child whose link was initialized; a no-op elsewhere.
pub fn report_error_to_parent(where_: &str, what: crate::err::InitOp, rc: i32, msg: &str) {
    use std::sync::atomic::{fence, Ordering};
    use windows_sys::Win32::System::Threading::SetEvent;

    unsafe {
        let link = std::ptr::addr_of_mut!(SUPSTUB_PROC_PARAMS);
        if (*link).magic != LINK_MAGIC {
            return;
        }
        (*link).err_what = what.as_i32();
        (*link).err_rc = rc;
        fill_bytes(&mut (*link).err_where, where_);
        fill_bytes(&mut (*link).err_msg, msg);
        fence(Ordering::SeqCst);
        (*link).err_pending = 1;
        if (*link).event_ping != 0 {
            SetEvent((*link).event_ping);
        }
    }
}

/// Parent side: read back a pending child error after the child stopped.
pub fn take_child_error(link: &RespawnLink) -> Option<(i32, i32, String, String)> {
    if link.err_pending == 0 {
        return None;
    }
    let cstr = |b: &[u8]| {
        let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
        String::from_utf8_lossy(&b[..end]).into_owned()
    };
    Some((
        link.err_what,
        link.err_rc,
        cstr(&link.err_where),
        cstr(&link.err_msg),
    ))
}
