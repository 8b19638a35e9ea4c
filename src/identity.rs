// CLASSIFICATION: COMMUNITY
// Filename: identity.rs v0.7
// Author: Lukas Bower
// Date Modified: 2026-08-01

//! Process identity captured at bootstrap, immutable thereafter.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;

use crate::err::{self, rc, InitOp};
use crate::flags::{Location, MainFlags};
use crate::{stub_bail, StubError};

/// Everything later stages may ask about the process itself. Captured
/// once, before any privilege change, and frozen.
#[derive(Debug, Clone)]
pub struct ProcessIdentity {
    /// Absolute path of the running executable, from the kernel's view.
    pub exe_path: PathBuf,
    /// Directory holding the application binaries.
    pub app_bin_dir: PathBuf,
    /// Program short-name; selects the payload library.
    pub prog_name: String,
    pub flags: MainFlags,
    /// Real IDs at startup, before the set-uid bit took effect.
    #[cfg(unix)]
    pub real_uid: nix::unistd::Uid,
    #[cfg(unix)]
    pub real_gid: nix::unistd::Gid,
}

/// The captured identity. Error paths reach it through this cell; the
/// pipeline itself passes the reference explicitly.
pub static IDENTITY: OnceCell<ProcessIdentity> = OnceCell::new();

impl ProcessIdentity {
    /// Resolve the executable path and derive the rest. Does not return on
    /// failure: an identity that cannot be established is an integrity
    /// violation, full stop.
    pub fn capture(prog_name: &str, flags: MainFlags) -> &'static ProcessIdentity {
        let exe_path = match resolve_exe_path() {
            Ok(p) => p,
            Err(e) => err::fatal_msg(
                "ProcessIdentity::capture",
                InitOp::Integrity,
                rc::INTEGRITY,
                format_args!("cannot resolve own executable path: {e}"),
            ),
        };
        if let Err(e) = validate_exe_path(&exe_path) {
            err::fatal_msg(
                "ProcessIdentity::capture",
                InitOp::Integrity,
                rc::BUFFER_OVERFLOW,
                format_args!("executable path rejected: {e}"),
            );
        }
        let Some(app_bin_dir) = derive_app_bin_dir(&exe_path, flags) else {
            err::fatal_msg(
                "ProcessIdentity::capture",
                InitOp::Integrity,
                rc::INTEGRITY,
                format_args!(
                    "cannot derive application directory from {}",
                    exe_path.display()
                ),
            );
        };

        let identity = ProcessIdentity {
            exe_path,
            app_bin_dir,
            prog_name: prog_name.to_owned(),
            flags,
            #[cfg(unix)]
            real_uid: nix::unistd::getuid(),
            #[cfg(unix)]
            real_gid: nix::unistd::getgid(),
        };
        log::debug!(
            "identity: exe={} app_bin={} prog={}",
            identity.exe_path.display(),
            identity.app_bin_dir.display(),
            identity.prog_name
        );
        if IDENTITY.get().is_some() {
            err::fatal_msg(
                "ProcessIdentity::capture",
                InitOp::Integrity,
                rc::WRONG_ORDER,
                format_args!("identity captured twice"),
            );
        }
        IDENTITY.get_or_init(|| identity)
    }
}

/// Ask the kernel who we are. `/proc/self/exe` is authoritative on Linux;
/// elsewhere the platform's equivalent sits behind `current_exe`.
fn resolve_exe_path() -> std::io::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_link("/proc/self/exe")
    }
    #[cfg(not(target_os = "linux"))]
    {
        std::env::current_exe()
    }
}

fn validate_exe_path(path: &Path) -> Result<(), StubError> {
    if path.as_os_str().is_empty() {
        stub_bail!("empty path");
    }
    if !path.is_absolute() {
        stub_bail!("not absolute: {}", path.display());
    }
    let max = max_path_len();
    if path.as_os_str().len() >= max {
        stub_bail!("longer than {max} bytes");
    }
    Ok(())
}

#[cfg(unix)]
fn max_path_len() -> usize {
    libc::PATH_MAX as usize
}

#[cfg(windows)]
fn max_path_len() -> usize {
    32767
}

/// Strip the filename once; testcase binaries sit one directory deeper, so
/// strip twice for those.
pub fn derive_app_bin_dir(exe_path: &Path, flags: MainFlags) -> Option<PathBuf> {
    let mut dir = exe_path.parent()?;
    if flags.location() == Location::Testcase {
        dir = dir.parent()?;
    }
    if dir.as_os_str().is_empty() {
        return None;
    }
    Some(dir.to_path_buf())
}

/// Whether `/proc/self/exe` is still readable. The answer can change after
/// the privilege drop, which is why the runtime init wants to know.
#[cfg(target_os = "linux")]
pub fn proc_self_exe_accessible() -> bool {
    std::fs::read_link("/proc/self/exe").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_bin_dir_strips_once_for_app_bin() {
        let dir = derive_app_bin_dir(Path::new("/opt/app/bin/VBoxSDL"), MainFlags::empty());
        assert_eq!(dir, Some(PathBuf::from("/opt/app/bin")));
    }

    #[test]
    fn app_bin_dir_strips_twice_for_testcase() {
        let dir = derive_app_bin_dir(
            Path::new("/opt/app/bin/testcase/tstFoo"),
            MainFlags::LOC_TESTCASE,
        );
        assert_eq!(dir, Some(PathBuf::from("/opt/app/bin")));
    }

    #[test]
    fn shallow_paths_are_rejected() {
        assert_eq!(
            derive_app_bin_dir(Path::new("/VBoxSDL"), MainFlags::LOC_TESTCASE),
            None
        );
        assert_eq!(derive_app_bin_dir(Path::new("VBoxSDL"), MainFlags::empty()), None);
    }

    #[test]
    fn exe_path_validation() {
        assert!(validate_exe_path(Path::new("/opt/app/bin/VBoxSDL")).is_ok());
        assert!(validate_exe_path(Path::new("")).is_err());
        assert!(validate_exe_path(Path::new("relative/path")).is_err());
        let long = format!("/{}", "a".repeat(max_path_len()));
        assert!(validate_exe_path(Path::new(&long)).is_err());
    }
}
