// CLASSIFICATION: COMMUNITY
// Filename: main.rs v0.6
// Author: Lukas Bower
// Date Modified: 2026-07-30

//! Multi-call stub entry point.
//!
//! The stub binary is installed once, set-uid root, and hard-linked under
//! each frontend name; the link name picks the payload library. Testcase
//! links (`tst*`) run driverless out of the `testcase/` subdirectory.

use std::ffi::OsString;

use supstub::MainFlags;

fn main() {
    env_logger::init();

    let args: Vec<OsString> = std::env::args_os().collect();
    let prog = program_name(&args);
    let flags = default_flags(&prog);

    std::process::exit(supstub::hardened_main(&prog, flags, args));
}

/// The program short-name. Normally the basename of argv[0]; in respawned
/// generations argv[0] is the sentinel, so fall back to the executable's
/// own link name.
fn program_name(args: &[OsString]) -> String {
    let from_argv0 = args
        .first()
        .map(std::path::PathBuf::from)
        .as_deref()
        .and_then(basename);

    match from_argv0 {
        Some(name) if !is_sentinel(&name) => name,
        _ => std::env::current_exe()
            .ok()
            .as_deref()
            .and_then(basename)
            .unwrap_or_else(|| "supstub".to_owned()),
    }
}

fn basename(path: &std::path::Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    Some(name.strip_suffix(".exe").unwrap_or(name).to_owned())
}

#[cfg(windows)]
fn is_sentinel(name: &str) -> bool {
    name.starts_with(supstub::respawn::RESPAWN_UUID)
}

#[cfg(not(windows))]
fn is_sentinel(_name: &str) -> bool {
    false
}

fn default_flags(prog: &str) -> MainFlags {
    if prog.starts_with("tst") {
        MainFlags::DONT_OPEN_DEVICE | MainFlags::LOC_TESTCASE
    } else {
        MainFlags::empty()
    }
}
