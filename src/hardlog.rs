// CLASSIFICATION: COMMUNITY
// Filename: hardlog.rs v0.7
// Author: Lukas Bower
// Date Modified: 2026-06-19

//! Best-effort append-only startup log.
//!
//! The channel is opened from a single recognized command-line option and
//! never gates progress: a failed open is silent, a failed write is
//! dropped. Records carry a `pid.tid:` prefix so interleaving from the
//! watcher thread stays readable without any serialization beyond the
//! atomic byte counter.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::OnceCell;

/// The one option the stub interprets itself.
pub const LOG_OPTION: &str = "--sup-hardening-log=";

/// Lifetime output cap for one process.
pub const LOG_CAP_BYTES: u64 = 16 * 1024 * 1024;

pub struct LogSink {
    file: File,
    written: AtomicU64,
    cap: u64,
    /// Volume root of the log path, kept so flush can flush the volume too.
    #[cfg(windows)]
    volume_root: Option<OsString>,
}

static STARTUP_LOG: OnceCell<LogSink> = OnceCell::new();

impl LogSink {
    pub fn open(path: &OsStr) -> std::io::Result<LogSink> {
        Self::open_with_cap(path, LOG_CAP_BYTES)
    }

    pub(crate) fn open_with_cap(path: &OsStr, cap: u64) -> std::io::Result<LogSink> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(LogSink {
            file,
            written: AtomicU64::new(0),
            cap,
            #[cfg(windows)]
            volume_root: volume_root_of(path),
        })
    }

    /// Raw descriptor/handle value, for the open banner.
    pub fn raw_handle(&self) -> u64 {
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            self.file.as_raw_fd() as u64
        }
        #[cfg(windows)]
        {
            use std::os::windows::io::AsRawHandle;
            self.file.as_raw_handle() as u64
        }
    }

    /// Append one newline-terminated record, silently dropped past the cap.
    pub fn write_record(&self, args: fmt::Arguments) {
        let mut rec = format!("{:x}.{:x}: {}", std::process::id(), thread_id(), args);
        if !rec.ends_with('\n') {
            rec.push('\n');
        }
        let before = self.written.fetch_add(rec.len() as u64, Ordering::Relaxed);
        if before >= self.cap {
            return;
        }
        let _ = (&self.file).write_all(rec.as_bytes());
    }

    pub fn flush(&self) {
        if self.written.load(Ordering::Relaxed) >= self.cap {
            return;
        }
        let _ = self.file.sync_all();
        #[cfg(windows)]
        if let Some(root) = &self.volume_root {
            flush_volume(root);
        }
    }
}

#[cfg(target_os = "linux")]
fn thread_id() -> u64 {
    unsafe { libc::gettid() as u64 }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(windows)]
fn thread_id() -> u64 {
    unsafe { windows_sys::Win32::System::Threading::GetCurrentThreadId() as u64 }
}

#[cfg(windows)]
fn volume_root_of(path: &OsStr) -> Option<OsString> {
    let s = path.to_str()?;
    let bytes = s.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        Some(OsString::from(format!(
            r"\\.\{}:",
            bytes[0].to_ascii_uppercase() as char
        )))
    } else {
        None
    }
}

#[cfg(windows)]
fn flush_volume(root: &OsStr) {
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::Storage::FileSystem::{
        CreateFileW, FlushFileBuffers, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
    };
    use windows_sys::Win32::Foundation::GENERIC_WRITE;

    let wide: Vec<u16> = root.encode_wide().chain(std::iter::once(0)).collect();
    unsafe {
        let h = CreateFileW(
            wide.as_ptr(),
            GENERIC_WRITE,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            std::ptr::null(),
            OPEN_EXISTING,
            0,
            0,
        );
        if h != INVALID_HANDLE_VALUE {
            FlushFileBuffers(h);
            CloseHandle(h);
        }
    }
}

/// Scan argv (positions >= 1) for the log option and excise every
/// occurrence, keeping the order of all other arguments. Returns the PATH
/// of the first occurrence.
pub fn extract_log_option(args: &mut Vec<OsString>) -> Option<OsString> {
    let mut found: Option<OsString> = None;
    let mut i = 1;
    while i < args.len() {
        let path = args[i]
            .to_str()
            .filter(|s| s.starts_with(LOG_OPTION))
            .map(|s| OsString::from(&s[LOG_OPTION.len()..]));
        match path {
            Some(p) => {
                args.remove(i);
                if found.is_none() {
                    found = Some(p);
                }
            }
            None => i += 1,
        }
    }
    found
}

/// Excise the log option from argv and open the channel if present. The
/// first open wins; failures are silent by contract.
pub fn open_from_args(args: &mut Vec<OsString>) {
    let Some(path) = extract_log_option(args) else {
        return;
    };
    if STARTUP_LOG.get().is_some() {
        return;
    }
    if let Ok(sink) = LogSink::open(&path) {
        let handle = sink.raw_handle();
        if STARTUP_LOG.set(sink).is_ok() {
            log(format_args!(
                "Log file opened: {} g_hStartupLog={:#x} cap={}MiB",
                crate::paths::RUNTIME_LIB_BASE,
                handle,
                LOG_CAP_BYTES / (1024 * 1024)
            ));
        }
    }
}

/// Write to the startup log if it is open.
pub fn log(args: fmt::Arguments) {
    if let Some(sink) = STARTUP_LOG.get() {
        sink.write_record(args);
    }
}

pub fn flush() {
    if let Some(sink) = STARTUP_LOG.get() {
        sink.flush();
    }
}

/// Startup-log formatting shorthand used across the pipeline.
#[macro_export]
macro_rules! suplog {
    ($($arg:tt)+) => {
        $crate::hardlog::log(format_args!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn argv(items: &[&str]) -> Vec<OsString> {
        items.iter().map(OsString::from).collect()
    }

    #[test]
    fn option_is_excised_and_order_kept() {
        let mut args = argv(&[
            "/opt/app/bin/tstFoo",
            "--sup-hardening-log=/tmp/h.log",
            "x",
        ]);
        let path = extract_log_option(&mut args).unwrap();
        assert_eq!(path, OsString::from("/tmp/h.log"));
        assert_eq!(args, argv(&["/opt/app/bin/tstFoo", "x"]));
    }

    #[test]
    fn first_occurrence_wins_all_are_excised() {
        let mut args = argv(&[
            "prog",
            "--sup-hardening-log=/a",
            "mid",
            "--sup-hardening-log=/b",
        ]);
        let path = extract_log_option(&mut args).unwrap();
        assert_eq!(path, OsString::from("/a"));
        assert_eq!(args, argv(&["prog", "mid"]));
    }

    #[test]
    fn argv0_is_never_scanned() {
        let mut args = argv(&["--sup-hardening-log=/zero", "y"]);
        assert!(extract_log_option(&mut args).is_none());
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn records_carry_pid_tid_prefix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h.log");
        let sink = LogSink::open(path.as_os_str()).unwrap();
        sink.write_record(format_args!("hello {}", 7));
        sink.flush();
        let text = fs::read_to_string(&path).unwrap();
        let expect = format!("{:x}.", std::process::id());
        assert!(text.starts_with(&expect), "got: {text}");
        assert!(text.ends_with("hello 7\n"));
    }

    #[test]
    fn writes_past_cap_are_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capped.log");
        let sink = LogSink::open_with_cap(path.as_os_str(), 64).unwrap();
        for i in 0..32 {
            sink.write_record(format_args!("record number {i}"));
        }
        let len = fs::metadata(&path).unwrap().len();
        // One record may straddle the cap; nothing after it lands.
        assert!(len < 128, "log grew past cap: {len}");
    }
}
