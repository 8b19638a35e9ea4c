// CLASSIFICATION: COMMUNITY
// Filename: payload.rs v0.5
// Author: Lukas Bower
// Date Modified: 2026-07-18

//! Trusted-payload loader.
//!
//! Loads the payload library named by the program short-name, resolves
//! `TrustedMain`, and runs it with the original argv/envp. `TrustedError`
//! is only ever resolved on the fatal path, after the privilege drop, and
//! never reports problems of its own.

use std::ffi::OsString;

use libloading::Library;

use crate::err;
use crate::ffi::{self, CStrVec, TrustedErrorFn, TrustedMainFn};
use crate::flags::MainFlags;
use crate::identity::ProcessIdentity;
use crate::paths;

/// The payload short-name, with the macOS VM-app substitution applied.
fn effective_prog_name(identity: &ProcessIdentity) -> &str {
    #[cfg(target_os = "macos")]
    if identity.flags.contains(MainFlags::DARWIN_VM_APP) {
        return paths::VM_APP_NAME;
    }
    &identity.prog_name
}

/// Load the payload and resolve `TrustedMain`. Does not return on failure.
pub fn get_trusted_main(identity: &ProcessIdentity) -> TrustedMainFn {
    let path = paths::trusted_lib_path(
        &identity.app_bin_dir,
        effective_prog_name(identity),
        identity.flags,
    );
    #[cfg(windows)]
    if let Err(e) = crate::respawn::verified_precheck(&path) {
        err::fatal(format_args!("get_trusted_main: {e}"));
    }
    let lib = match unsafe { Library::new(&path) } {
        Ok(lib) => lib,
        Err(e) => err::fatal(format_args!(
            "get_trusted_main: loading \"{}\" failed: {e}",
            path.display()
        )),
    };
    let main_fn: TrustedMainFn = match unsafe { lib.get(ffi::SYM_TRUSTED_MAIN) } {
        Ok(sym) => *sym,
        Err(e) => err::fatal(format_args!(
            "get_trusted_main: entry point \"TrustedMain\" not found in \"{}\": {e}",
            path.display()
        )),
    };
    // The payload stays loaded until the process ends.
    std::mem::forget(lib);
    main_fn
}

/// Resolve `TrustedError` quietly. Failures yield `None`; piling a
/// second error on top of a fatal report helps nobody.
pub fn get_trusted_error(identity: &ProcessIdentity) -> Option<TrustedErrorFn> {
    if !identity.flags.contains(MainFlags::HAS_TRUSTED_ERROR) {
        return None;
    }
    let path = paths::trusted_lib_path(
        &identity.app_bin_dir,
        effective_prog_name(identity),
        identity.flags,
    );
    let lib = unsafe { Library::new(&path) }.ok()?;
    let f: TrustedErrorFn = *unsafe { lib.get(ffi::SYM_TRUSTED_ERROR) }.ok()?;
    std::mem::forget(lib);
    Some(f)
}

/// Hand control to the payload; its return value is the exit status.
pub fn run_trusted_main(main_fn: TrustedMainFn, args: Vec<OsString>) -> i32 {
    let mut argv = match CStrVec::new(args) {
        Ok(v) => v,
        Err(e) => err::fatal(format_args!("argv contains an interior NUL: {e}")),
    };
    let mut envp = match CStrVec::new(environment()) {
        Ok(v) => v,
        Err(e) => err::fatal(format_args!("environment contains an interior NUL: {e}")),
    };
    let argc = argv.len() as std::os::raw::c_int;
    unsafe { main_fn(argc, argv.as_mut_ptr(), envp.as_mut_ptr()) }
}

fn environment() -> Vec<OsString> {
    std::env::vars_os()
        .map(|(mut k, v)| {
            k.push("=");
            k.push(v);
            k
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_entries_are_key_value() {
        std::env::set_var("SUPSTUB_PAYLOAD_TEST", "42");
        let env = environment();
        assert!(env
            .iter()
            .any(|e| e.to_str() == Some("SUPSTUB_PAYLOAD_TEST=42")));
        std::env::remove_var("SUPSTUB_PAYLOAD_TEST");
    }
}
