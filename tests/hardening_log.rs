// CLASSIFICATION: COMMUNITY
// Filename: hardening_log.rs v0.4
// Author: Lukas Bower
// Date Modified: 2026-07-30

//! Round trip of the `--sup-hardening-log=` option: the channel opens,
//! the banner lands in the file, and the payload never sees the option.

use std::ffi::OsString;

use supstub::hardlog;

fn argv(items: &[&str]) -> Vec<OsString> {
    items.iter().map(OsString::from).collect()
}

#[test]
fn log_option_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("h.log");

    let mut args = argv(&["/opt/app/bin/tstFoo", "x"]);
    args.insert(
        1,
        OsString::from(format!("--sup-hardening-log={}", log_path.display())),
    );

    // One argument out, everything else untouched and in order.
    hardlog::open_from_args(&mut args);
    assert_eq!(args, argv(&["/opt/app/bin/tstFoo", "x"]));

    hardlog::log(format_args!("driverless self-test run"));
    hardlog::flush();

    let text = std::fs::read_to_string(&log_path).unwrap();
    // The open banner identifies the runtime and the raw log handle.
    assert!(
        text.contains("VBoxRT g_hStartupLog="),
        "banner missing from startup log: {text}"
    );
    assert!(text.contains("driverless self-test run"));

    // Every record is newline-terminated and pid.tid-prefixed.
    let prefix = format!("{:x}.", std::process::id());
    for line in text.lines().filter(|l| !l.is_empty()) {
        assert!(line.starts_with(&prefix), "bad record prefix: {line}");
    }
}

#[test]
fn missing_option_leaves_argv_alone() {
    let mut args = argv(&["/opt/app/bin/VBoxSDL", "--startvm", "uuid"]);
    let before = args.clone();
    assert!(hardlog::extract_log_option(&mut args).is_none());
    assert_eq!(args, before);
}
