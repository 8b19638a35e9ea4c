// CLASSIFICATION: COMMUNITY
// Filename: payload_paths.rs v0.3
// Author: Lukas Bower
// Date Modified: 2026-07-30

//! Frontend launch scenarios: which libraries a given argv[0] resolves to.

use std::path::{Path, PathBuf};

use supstub::identity::derive_app_bin_dir;
use supstub::paths::{self, DLL_SUFFIX};
use supstub::MainFlags;

#[test]
fn frontend_resolves_runtime_and_payload_next_to_itself() {
    // argv = ["/opt/app/bin/VBoxSDL", "--startvm", "uuid"], default flags.
    let exe = Path::new("/opt/app/bin/VBoxSDL");
    let flags = MainFlags::empty();

    let app_bin = derive_app_bin_dir(exe, flags).unwrap();
    assert_eq!(app_bin, PathBuf::from("/opt/app/bin"));

    assert_eq!(
        paths::runtime_lib_path(&app_bin),
        PathBuf::from(format!("/opt/app/bin/VBoxRT{DLL_SUFFIX}"))
    );
    assert_eq!(
        paths::trusted_lib_path(&app_bin, "VBoxSDL", flags),
        PathBuf::from(format!("/opt/app/bin/VBoxSDL{DLL_SUFFIX}"))
    );
}

#[test]
fn testcase_resolves_under_testcase_subdirectory() {
    // A tst* link two levels down, driverless.
    let exe = Path::new("/opt/app/bin/testcase/tstFoo");
    let flags = MainFlags::DONT_OPEN_DEVICE | MainFlags::LOC_TESTCASE;

    let app_bin = derive_app_bin_dir(exe, flags).unwrap();
    assert_eq!(app_bin, PathBuf::from("/opt/app/bin"));

    assert_eq!(
        paths::trusted_lib_path(&app_bin, "tstFoo", flags),
        PathBuf::from(format!("/opt/app/bin/testcase/tstFoo{DLL_SUFFIX}"))
    );
    // The runtime always sits in the app-bin directory proper.
    assert_eq!(
        paths::runtime_lib_path(&app_bin),
        PathBuf::from(format!("/opt/app/bin/VBoxRT{DLL_SUFFIX}"))
    );
    assert!(!flags.opens_device());
}
