// CLASSIFICATION: COMMUNITY
// Filename: err.rs v0.8
// Author: Lukas Bower
// Date Modified: 2026-07-03

//! Fatal-error reporting for the launch pipeline.
//!
//! Every error raised by the pipeline is fatal. The reporter writes the
//! tagged record to the startup log and stderr, prints the per-category
//! hint, and, only once the state marker proves the payload side is safe
//! to touch, drops privileges and gives the payload's `TrustedError`
//! export one recursion-guarded chance to surface the failure in its own
//! UI before the process exits.

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::OnceCell;

use crate::state::{Marker, STATE};

/// Stable status codes used in diagnostics and handed to `TrustedError`.
pub mod rc {
    pub const PERMISSION_DENIED: i32 = -10;
    pub const WRONG_ORDER: i32 = -22;
    pub const BUFFER_OVERFLOW: i32 = -41;
    pub const INTEGRITY: i32 = -600;
    pub const MODULE_NOT_FOUND: i32 = -610;
    pub const SYMBOL_NOT_FOUND: i32 = -611;
    pub const INIT_FAILED: i32 = -612;
    pub const DRIVER_NOT_INSTALLED: i32 = -1901;
    pub const DRIVER_NOT_ACCESSIBLE: i32 = -1902;
    pub const DRIVER_LOAD_ERROR: i32 = -1903;
    pub const DRIVER_OPEN_ERROR: i32 = -1904;
    pub const DRIVER_VERSION_MISMATCH: i32 = -1905;
    pub const OUT_OF_MEMORY: i32 = -8;
    pub const PURIFICATION_FAILED: i32 = -1920;
}

/// The five fixed error categories. The display strings are part of the
/// external contract: they appear in messages and are passed to
/// `TrustedError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOp {
    Driver,
    Iprt,
    Integrity,
    RootCheck,
    Misc,
}

impl InitOp {
    pub fn as_i32(self) -> i32 {
        match self {
            InitOp::Driver => 1,
            InitOp::Iprt => 2,
            InitOp::Integrity => 3,
            InitOp::RootCheck => 4,
            InitOp::Misc => 5,
        }
    }
}

impl fmt::Display for InitOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InitOp::Driver => "Driver",
            InitOp::Iprt => "IPRT",
            InitOp::Integrity => "Integrity",
            InitOp::RootCheck => "RootCheck",
            InitOp::Misc => "Misc",
        })
    }
}

static PROG_NAME: OnceCell<String> = OnceCell::new();

pub fn set_prog_name(name: &str) {
    let _ = PROG_NAME.set(name.to_owned());
}

pub fn prog_name() -> &'static str {
    PROG_NAME.get().map(String::as_str).unwrap_or("supstub")
}

fn stderr_prefixed(args: fmt::Arguments) {
    let mut err = std::io::stderr().lock();
    let _ = write!(err, "{}: ", prog_name());
    let _ = err.write_fmt(args);
    let _ = err.write_all(b"\n");
}

fn hint_for(what: InitOp) {
    match what {
        InitOp::Driver => {
            stderr_prefixed(format_args!(
                "Tip: make sure the support kernel module is loaded; reinstalling may also help."
            ));
        }
        InitOp::Iprt | InitOp::Integrity | InitOp::RootCheck | InitOp::Misc => {
            stderr_prefixed(format_args!("Tip: reinstalling the application may help."));
        }
    }
}

/// Fatal error with a category, a status code, and the place it happened.
pub fn fatal_msg(where_: &str, what: InitOp, rc: i32, args: fmt::Arguments) -> ! {
    let msg = fmt::format(args);

    crate::hardlog::log(format_args!("Error {rc} in {where_}! ({what})"));
    crate::hardlog::log(format_args!("{msg}"));
    crate::hardlog::flush();

    release_log(format_args!("fatal: {where_} {what} rc={rc}: {msg}"));

    stderr_prefixed(format_args!("Error {rc} in {where_}!"));
    stderr_prefixed(format_args!("{msg}"));
    hint_for(what);

    dispatch_trusted_error(where_, what, rc, &msg);
    exit_fast(1)
}

/// Fatal error without a category; the message is the whole story.
pub fn fatal(args: fmt::Arguments) -> ! {
    let msg = fmt::format(args);

    crate::hardlog::log(format_args!("Fatal error:"));
    crate::hardlog::log(format_args!("{msg}"));
    crate::hardlog::flush();

    #[cfg(windows)]
    {
        let marker = STATE.get();
        if marker > Marker::NotYetCalled && marker < Marker::WinImportsResolved {
            crate::respawn::report_error_to_parent("", InitOp::Misc, -1, &msg);
        }
    }
    release_log(format_args!("fatal: {msg}"));

    stderr_prefixed(format_args!("{msg}"));
    exit_fast(1)
}

/// Non-fatal error reporting; returns `rc` so call sites can thread it
/// through. With `fatal` set this never returns.
pub fn error(rc: i32, fatal_flag: bool, args: fmt::Arguments) -> i32 {
    if fatal_flag {
        fatal(args);
    }
    let msg = fmt::format(args);
    crate::hardlog::log(format_args!("Error (rc={rc}):"));
    crate::hardlog::log(format_args!("{msg}"));
    release_log(format_args!("error rc={rc}: {msg}"));
    stderr_prefixed(format_args!("{msg}"));
    rc
}

fn dispatch_trusted_error(where_: &str, what: InitOp, rc: i32, msg: &str) {
    // Loader hooks can re-enter the fatal path; one attempt only.
    static RECURSIVE: AtomicBool = AtomicBool::new(false);
    if RECURSIVE.swap(true, Ordering::SeqCst) {
        return;
    }

    let marker = STATE.get();
    if marker >= Marker::WinImportsResolved {
        // The payload side is reachable. Shed any root authority we still
        // hold before touching it; the drop is idempotent.
        #[cfg(unix)]
        crate::caps::drop_privileges_if_captured();

        // Fork so session management sees the stub exit immediately; the
        // child carries the error into the payload's reporter.
        #[cfg(unix)]
        {
            let pid = unsafe { libc::fork() };
            if pid > 0 {
                return;
            }
            call_trusted_error(where_, what, rc, msg);
            if pid == 0 {
                unsafe { libc::_exit(1) };
            }
        }
        #[cfg(windows)]
        call_trusted_error(where_, what, rc, msg);
    } else {
        #[cfg(windows)]
        if marker > Marker::NotYetCalled {
            crate::respawn::report_error_to_parent(where_, what, rc, msg);
        }
    }
}

fn call_trusted_error(where_: &str, what: InitOp, rc: i32, msg: &str) {
    if let Some(identity) = crate::identity::IDENTITY.get() {
        if let Some(trusted_error) = crate::payload::get_trusted_error(identity) {
            let c_where = std::ffi::CString::new(where_).unwrap_or_default();
            let c_msg = std::ffi::CString::new(msg).unwrap_or_default();
            unsafe { trusted_error(c_where.as_ptr(), what.as_i32(), rc, c_msg.as_ptr()) };
        }
    }
}

/// Release-log callback resolved from the runtime library, when present.
static RELEASE_LOG_FN: OnceCell<crate::ffi::LogRelPrintfFn> = OnceCell::new();

pub fn set_release_log_fn(f: crate::ffi::LogRelPrintfFn) {
    let _ = RELEASE_LOG_FN.set(f);
}

fn release_log(args: fmt::Arguments) {
    if let Some(f) = RELEASE_LOG_FN.get() {
        let msg = fmt::format(args);
        if let Ok(c) = std::ffi::CString::new(msg) {
            // Pre-rendered text; "%s" keeps payload-side formatting inert.
            if let Ok(fmt_str) = std::ffi::CString::new("%s\n") {
                unsafe { f(fmt_str.as_ptr(), c.as_ptr()) };
            }
        }
    }
}

fn exit_fast(code: i32) -> ! {
    std::process::exit(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_have_fixed_strings() {
        assert_eq!(InitOp::Driver.to_string(), "Driver");
        assert_eq!(InitOp::Iprt.to_string(), "IPRT");
        assert_eq!(InitOp::Integrity.to_string(), "Integrity");
        assert_eq!(InitOp::RootCheck.to_string(), "RootCheck");
        assert_eq!(InitOp::Misc.to_string(), "Misc");
    }

    #[test]
    fn non_fatal_error_returns_code() {
        let rc = error(rc::DRIVER_OPEN_ERROR, false, format_args!("probe only"));
        assert_eq!(rc, rc::DRIVER_OPEN_ERROR);
    }
}
