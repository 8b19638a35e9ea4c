// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.9
// Author: Lukas Bower
// Date Modified: 2026-07-28

//! Two-stage respawn controller (desktop OS only).
//!
//! The first respawn sheds whatever compatibility and "security" shims the
//! OS attached at initial launch. The second creates a child whose address
//! space is proven clean before its first instruction runs: the child is
//! born suspended, its loader-init thunk is redirected into our own image,
//! and the parent purifies the address space against pristine on-disk
//! copies before letting it continue.
//!
//! Generation is detected from `argv[0]`: a fixed UUID sentinel with a
//! stage suffix replaces it in the respawned children.
//!
//! ```text
//! UNSPAWNED -> FIRST_SPAWNED -> FIRST_EXITED (parent exits)
//!              child: SECOND_SPAWNED_SUSPENDED -> HOOK_INSTALLED ->
//!              RESUMED -> EARLY_INIT_WAITING -> PURIFYING -> PURIFIED ->
//!              RUNNING
//! ```

#![cfg(windows)]

mod early;
mod link;
mod pe;
mod purify;
mod spawn;

use std::ffi::OsString;

pub use early::take_early_device;
pub use link::report_error_to_parent;
pub use spawn::{respawn_first, respawn_second};

use crate::err::{self, rc, InitOp};
use crate::state::{self, Marker};

/// Base sentinel; never changes so installers can whitelist it.
pub const RESPAWN_UUID: &str = "c64dba3c-2c41-4e8f-9a5b-3b1e0e7c9d52";

/// argv[0] of the first-respawn child.
pub const SENTINEL_STAGE1: &str = "c64dba3c-2c41-4e8f-9a5b-3b1e0e7c9d52-2ndchild";
/// argv[0] of the second-respawn (final) child.
pub const SENTINEL_STAGE2: &str = "c64dba3c-2c41-4e8f-9a5b-3b1e0e7c9d52-3rdchild";

/// Which process of the respawn chain we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Directly launched; needs the first respawn.
    Initial,
    /// First-respawn child; needs the second respawn.
    Second,
    /// Second-respawn child; the process that will run the VM.
    Final,
}

pub fn generation(args: &[OsString]) -> Generation {
    match args.first().and_then(|a| a.to_str()) {
        Some(SENTINEL_STAGE1) => Generation::Second,
        Some(SENTINEL_STAGE2) => Generation::Final,
        _ => Generation::Initial,
    }
}

/// Early image-verification state for this process: resolve the trust
/// API, refuse debuggers, and advance the marker so the error reporter
/// knows which transports are safe.
pub fn win_init(_flags: crate::flags::MainFlags) {
    use windows_sys::Win32::System::Diagnostics::Debug::IsDebuggerPresent;

    if unsafe { IsDebuggerPresent() } != 0 {
        err::fatal_msg(
            "win_init",
            InitOp::Integrity,
            rc::INTEGRITY,
            format_args!("a debugger is attached to the stub process"),
        );
    }
    if state::STATE.get() < Marker::WinImportsResolved {
        state::advance(Marker::WinImportsResolved);
    }
}

/// Mark the point after which load-time signature verification is active.
pub fn resolve_verify_trust() {
    if state::STATE.get() < Marker::WinVerifyTrustReady {
        state::advance(Marker::WinVerifyTrustReady);
    }
}

/// Pre-load check used instead of dlopen on this platform: the library
/// must live in the protected tree, be held deny-write, and carry a valid
/// signature before the loader maps it.
pub fn verified_precheck(path: &std::path::Path) -> Result<(), crate::verify::VerifyError> {
    crate::verify::verify_file(path)?;
    crate::verify::verify_ancestors(path)?;
    Ok(())
}

/// Watcher thread: if the parent stub dies, this process has no business
/// outliving it.
pub fn start_parent_watcher() {
    use windows_sys::Win32::Foundation::WAIT_OBJECT_0;
    use windows_sys::Win32::System::Threading::{
        GetCurrentProcess, TerminateProcess, WaitForSingleObject, INFINITE,
    };

    let parent = link::parent_process_handle();
    if parent == 0 {
        return;
    }
    std::thread::spawn(move || unsafe {
        if WaitForSingleObject(parent, INFINITE) == WAIT_OBJECT_0 {
            crate::suplog!("parent stub died; terminating");
            TerminateProcess(GetCurrentProcess(), 127);
        }
    });
}
