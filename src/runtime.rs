// CLASSIFICATION: COMMUNITY
// Filename: runtime.rs v0.6
// Author: Lukas Bower
// Date Modified: 2026-07-18

//! Runtime library loader.
//!
//! Loads the internal runtime shared library, hands it the open driver
//! through `pre_init`, and runs `init_runtime_ex`. The library handle is
//! leaked on purpose; the runtime stays resident for the life of the
//! process.

use std::ffi::CString;

use libloading::Library;

use crate::err::{self, rc, InitOp};
use crate::ffi::{
    self, InitRuntimeExFn, LogRelPrintfFn, PreInitData, PreInitFn, INIT_VERSION,
    RUNTIME_FLAG_WITH_DRIVER,
};
use crate::identity::ProcessIdentity;
use crate::paths;

/// Load the runtime, hand over the device, initialize. Consumes the blob;
/// after this call the stub never references the device again.
pub fn init_runtime(identity: &ProcessIdentity, blob: PreInitData) {
    let path = paths::runtime_lib_path(&identity.app_bin_dir);
    crate::suplog!("init_runtime: loading {}", path.display());

    // On the desktop OS every load goes through the image-verifying
    // wrapper the respawn controller established.
    #[cfg(windows)]
    if let Err(e) = crate::respawn::verified_precheck(&path) {
        err::fatal_msg(
            "init_runtime",
            InitOp::Integrity,
            rc::INTEGRITY,
            format_args!("{e}"),
        );
    }

    let lib = match unsafe { Library::new(&path) } {
        Ok(lib) => lib,
        Err(e) => err::fatal_msg(
            "init_runtime",
            InitOp::Iprt,
            rc::MODULE_NOT_FOUND,
            format_args!("loading \"{}\" failed: {e}", path.display()),
        ),
    };

    let init_ex: InitRuntimeExFn = match unsafe { lib.get(ffi::SYM_INIT_RUNTIME_EX) } {
        Ok(sym) => *sym,
        Err(e) => err::fatal_msg(
            "init_runtime",
            InitOp::Iprt,
            rc::SYMBOL_NOT_FOUND,
            format_args!(
                "entry point \"init_runtime_ex\" not found in \"{}\": {e}",
                path.display()
            ),
        ),
    };
    let pre_init: PreInitFn = match unsafe { lib.get(ffi::SYM_PRE_INIT) } {
        Ok(sym) => *sym,
        Err(e) => err::fatal_msg(
            "init_runtime",
            InitOp::Iprt,
            rc::SYMBOL_NOT_FOUND,
            format_args!(
                "entry point \"pre_init\" not found in \"{}\": {e}",
                path.display()
            ),
        ),
    };
    if let Ok(sym) = unsafe { lib.get::<LogRelPrintfFn>(ffi::SYM_LOG_REL_PRINTF) } {
        err::set_release_log_fn(*sym);
    }

    // Resident from here on; never dlclose the process runtime.
    std::mem::forget(lib);

    let with_driver = blob.has_device();
    let rc_pre = unsafe { pre_init(&blob, identity.flags.bits()) };
    if rc_pre != 0 {
        err::fatal_msg(
            "init_runtime",
            InitOp::Iprt,
            rc::INIT_FAILED,
            format_args!("pre_init failed with rc={rc_pre}"),
        );
    }
    // The device now belongs to the runtime.
    drop(blob);

    let exe_override = exe_path_override(identity);
    let exe_ptr = exe_override
        .as_ref()
        .map_or(std::ptr::null(), |c| c.as_ptr());
    let runtime_flags = if with_driver { RUNTIME_FLAG_WITH_DRIVER } else { 0 };
    let rc_init =
        unsafe { init_ex(INIT_VERSION, runtime_flags, 0, std::ptr::null_mut(), exe_ptr) };
    if rc_init != 0 {
        err::fatal_msg(
            "init_runtime",
            InitOp::Iprt,
            rc::INIT_FAILED,
            format_args!("init_runtime_ex failed with rc={rc_init}"),
        );
    }

    #[cfg(windows)]
    if with_driver {
        crate::respawn::start_parent_watcher();
    }
}

/// After the privilege drop `/proc/self/exe` can become unreadable; pass
/// the captured path so the runtime does not have to guess.
#[cfg(target_os = "linux")]
fn exe_path_override(identity: &ProcessIdentity) -> Option<CString> {
    if crate::identity::proc_self_exe_accessible() {
        return None;
    }
    CString::new(identity.exe_path.to_string_lossy().into_owned()).ok()
}

#[cfg(not(target_os = "linux"))]
fn exe_path_override(_identity: &ProcessIdentity) -> Option<CString> {
    None
}
