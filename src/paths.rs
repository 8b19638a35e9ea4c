// CLASSIFICATION: COMMUNITY
// Filename: paths.rs v0.5
// Author: Lukas Bower
// Date Modified: 2026-05-29

//! Path construction for the runtime and payload libraries.

use std::path::{Path, PathBuf};

use crate::flags::{Location, MainFlags};

/// Base name of the internal runtime shared library.
pub const RUNTIME_LIB_BASE: &str = "VBoxRT";

/// Payload short-name used for macOS VM application bundles.
pub const VM_APP_NAME: &str = "VirtualBox";

/// Shared-object suffix of the host platform.
#[cfg(target_os = "macos")]
pub const DLL_SUFFIX: &str = ".dylib";
#[cfg(windows)]
pub const DLL_SUFFIX: &str = ".dll";
#[cfg(all(unix, not(target_os = "macos")))]
pub const DLL_SUFFIX: &str = ".so";

/// Last path component as UTF-8, if there is one.
pub fn filename(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// `app_bin_dir` + `/` + `VBoxRT` + suffix.
pub fn runtime_lib_path(app_bin_dir: &Path) -> PathBuf {
    app_bin_dir.join(format!("{RUNTIME_LIB_BASE}{DLL_SUFFIX}"))
}

/// `app_bin_dir` + sub-dir + short-name + suffix, where the sub-dir is
/// `testcase/` exactly when the testcase location flag is set.
pub fn trusted_lib_path(app_bin_dir: &Path, prog_name: &str, flags: MainFlags) -> PathBuf {
    let mut path = app_bin_dir.to_path_buf();
    if flags.location() == Location::Testcase {
        path.push("testcase");
    }
    path.push(format!("{prog_name}{DLL_SUFFIX}"));
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_path_is_fixed_name_in_app_bin() {
        let p = runtime_lib_path(Path::new("/opt/app/bin"));
        assert_eq!(p, PathBuf::from(format!("/opt/app/bin/VBoxRT{DLL_SUFFIX}")));
    }

    #[test]
    fn trusted_path_app_bin_location() {
        let p = trusted_lib_path(Path::new("/opt/app/bin"), "VBoxSDL", MainFlags::empty());
        assert_eq!(p, PathBuf::from(format!("/opt/app/bin/VBoxSDL{DLL_SUFFIX}")));
    }

    #[test]
    fn trusted_path_testcase_location() {
        let flags = MainFlags::DONT_OPEN_DEVICE | MainFlags::LOC_TESTCASE;
        let p = trusted_lib_path(Path::new("/opt/app/bin"), "tstFoo", flags);
        assert_eq!(
            p,
            PathBuf::from(format!("/opt/app/bin/testcase/tstFoo{DLL_SUFFIX}"))
        );
    }

    #[test]
    fn trusted_path_every_flag_combination_only_depends_on_location() {
        for bits in 0..16u32 {
            let flags = MainFlags::from_bits_truncate(bits);
            let p = trusted_lib_path(Path::new("/x"), "prog", flags);
            let expect = if flags.contains(MainFlags::LOC_TESTCASE) {
                format!("/x/testcase/prog{DLL_SUFFIX}")
            } else {
                format!("/x/prog{DLL_SUFFIX}")
            };
            assert_eq!(p, PathBuf::from(expect));
        }
    }

    #[test]
    fn filename_extracts_last_component() {
        assert_eq!(filename(Path::new("/opt/app/bin/VBoxSDL")), Some("VBoxSDL"));
        assert_eq!(filename(Path::new("/")), None);
    }
}
