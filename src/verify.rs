// CLASSIFICATION: COMMUNITY
// Filename: verify.rs v0.9
// Author: Lukas Bower
// Date Modified: 2026-07-22

//! Installation verifier.
//!
//! Walks the protected set (the stub executable, the runtime library and
//! the payload library) and every ancestor directory up to the filesystem
//! root, insisting that only the superuser can have modified any of them.
//! On Windows the files are additionally opened share-deny-write and held
//! for the life of the process, and their signatures must chain to the
//! driver's certificate.

use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::err::{self, rc, InitOp};
use crate::flags::MainFlags;
use crate::identity::ProcessIdentity;
use crate::paths;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("{path}: not owned by root:root (uid={uid} gid={gid})")]
    NotOwned { path: PathBuf, uid: u32, gid: u32 },
    #[error("{path}: not owned exclusively by root (mode {mode:04o} grants group/other write)")]
    WritableMode { path: PathBuf, mode: u32 },
    #[error("{path}: not a regular file")]
    NotRegular { path: PathBuf },
    #[error("{path}: cannot inspect: {source}")]
    Inaccessible {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: mount point below a directory writable by non-root")]
    UntrustedMount { path: PathBuf },
    #[error("{path}: not part of the protected install set")]
    NotProtected { path: PathBuf },
    #[error("{path}: signature does not chain to the driver certificate")]
    BadSignature { path: PathBuf },
}

/// One protected file. The table is built at bootstrap and read-only
/// afterwards.
#[derive(Debug)]
pub struct VerificationRecord {
    pub path: PathBuf,
    /// Optional entries are allowed to be absent but are fully checked
    /// when present.
    pub optional: bool,
    /// Whether a code signature is expected where the platform has one.
    pub want_signature: bool,
}

static PROTECTED_SET: OnceCell<Vec<VerificationRecord>> = OnceCell::new();

/// Freeze the protected set derived from the captured identity.
pub fn build_protected_set(identity: &ProcessIdentity) -> &'static [VerificationRecord] {
    PROTECTED_SET.get_or_init(|| {
        vec![
            VerificationRecord {
                path: identity.exe_path.clone(),
                optional: false,
                want_signature: true,
            },
            VerificationRecord {
                path: paths::runtime_lib_path(&identity.app_bin_dir),
                optional: false,
                want_signature: true,
            },
            VerificationRecord {
                path: paths::trusted_lib_path(
                    &identity.app_bin_dir,
                    &identity.prog_name,
                    identity.flags,
                ),
                // Some stubs run driverless self-tests before the payload
                // library is installed alongside them.
                optional: true,
                want_signature: true,
            },
        ]
    })
}

/// Verify the whole installation. With `fatal` set this reports through
/// the fatal path and does not return on failure; otherwise the first
/// defect is returned after being logged.
pub fn verify_all(
    fatal: bool,
    prog_name: &str,
    exe_path: &Path,
    _flags: MainFlags,
) -> Result<(), VerifyError> {
    let set = PROTECTED_SET
        .get()
        .map(Vec::as_slice)
        .unwrap_or_default();

    let result = verify_set(set, exe_path);
    if let Err(e) = &result {
        log::warn!("verify_all failed for {prog_name}: {e}");
        if fatal {
            err::fatal_msg(
                "verify_all",
                InitOp::Integrity,
                rc::INTEGRITY,
                format_args!("{e}"),
            );
        }
        err::error(rc::INTEGRITY, false, format_args!("{e}"));
    }
    result
}

/// Table-driven verification core; separated from the global table so the
/// policy is testable against arbitrary trees.
pub fn verify_set(set: &[VerificationRecord], exe_path: &Path) -> Result<(), VerifyError> {
    // The file named by argv[0] must be one of ours.
    let named = paths::filename(exe_path).unwrap_or_default();
    let known = !named.is_empty()
        && set
            .iter()
            .any(|rec| paths::filename(&rec.path) == Some(named));
    if !known {
        return Err(VerifyError::NotProtected {
            path: exe_path.to_path_buf(),
        });
    }

    for rec in set {
        match verify_file(&rec.path) {
            Ok(()) => {}
            Err(VerifyError::Inaccessible { source, .. })
                if rec.optional && source.kind() == io::ErrorKind::NotFound =>
            {
                log::debug!("verify: optional {} absent", rec.path.display());
                continue;
            }
            Err(e) => return Err(e),
        }
        verify_ancestors(&rec.path)?;
        #[cfg(windows)]
        {
            hold_deny_write(&rec.path)?;
            if rec.want_signature {
                win::verify_signature(&rec.path)?;
            }
        }
        #[cfg(not(windows))]
        let _ = rec.want_signature;
    }
    Ok(())
}

/// Check one protected file: regular, root-owned, nothing but the owner
/// may write. Symlinks are resolved first so the target is what gets
/// judged.
pub fn verify_file(path: &Path) -> Result<(), VerifyError> {
    let md = std::fs::metadata(path).map_err(|source| VerifyError::Inaccessible {
        path: path.to_path_buf(),
        source,
    })?;
    if !md.is_file() {
        return Err(VerifyError::NotRegular {
            path: path.to_path_buf(),
        });
    }
    check_ownership(path, &md)
}

/// Walk every ancestor of the resolved path up to the filesystem root.
/// Directories obey the same ownership policy as files; a mount point is
/// only crossed when the directory above it is not writable by non-root.
pub fn verify_ancestors(path: &Path) -> Result<(), VerifyError> {
    let resolved = std::fs::canonicalize(path).map_err(|source| VerifyError::Inaccessible {
        path: path.to_path_buf(),
        source,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        let mut child_dev: Option<u64> = None;
        let mut dir_opt = resolved.parent();
        while let Some(dir) = dir_opt {
            let md = std::fs::metadata(dir).map_err(|source| VerifyError::Inaccessible {
                path: dir.to_path_buf(),
                source,
            })?;
            let writable = !mode_is_safe(md.mode());
            if let Some(dev) = child_dev {
                if dev != md.dev() && writable {
                    // The subtree we came from is a separate filesystem
                    // and anyone may rename it away right here.
                    return Err(VerifyError::UntrustedMount {
                        path: dir.to_path_buf(),
                    });
                }
            }
            if writable {
                return Err(VerifyError::WritableMode {
                    path: dir.to_path_buf(),
                    mode: md.mode() & 0o7777,
                });
            }
            if !owner_is_system(md.uid(), md.gid()) {
                return Err(VerifyError::NotOwned {
                    path: dir.to_path_buf(),
                    uid: md.uid(),
                    gid: md.gid(),
                });
            }
            child_dev = Some(md.dev());
            dir_opt = dir.parent();
        }
    }
    #[cfg(windows)]
    {
        // Ancestor ACL walking is subsumed by signature checks plus the
        // deny-write holds; the directory chain has no root-trust analog.
        let _ = &resolved;
    }
    Ok(())
}

#[cfg(unix)]
fn check_ownership(path: &Path, md: &std::fs::Metadata) -> Result<(), VerifyError> {
    use std::os::unix::fs::MetadataExt;

    if !owner_is_system(md.uid(), md.gid()) {
        return Err(VerifyError::NotOwned {
            path: path.to_path_buf(),
            uid: md.uid(),
            gid: md.gid(),
        });
    }
    if !mode_is_safe(md.mode()) {
        return Err(VerifyError::WritableMode {
            path: path.to_path_buf(),
            mode: md.mode() & 0o7777,
        });
    }
    Ok(())
}

#[cfg(windows)]
fn check_ownership(_path: &Path, _md: &std::fs::Metadata) -> Result<(), VerifyError> {
    Ok(())
}

/// No write permission outside the owner.
pub fn mode_is_safe(mode: u32) -> bool {
    mode & 0o022 == 0
}

/// Owned by the superuser and the administrator group.
pub fn owner_is_system(uid: u32, gid: u32) -> bool {
    uid == 0 && gid == 0
}

#[cfg(windows)]
fn hold_deny_write(path: &Path) -> Result<(), VerifyError> {
    use std::fs::File;
    use std::os::windows::fs::OpenOptionsExt;
    use std::sync::Mutex;
    use windows_sys::Win32::Storage::FileSystem::FILE_SHARE_READ;

    // Keep every verified file open until process exit so nobody can swap
    // it after the check.
    static HELD: Mutex<Vec<File>> = Mutex::new(Vec::new());

    let file = std::fs::OpenOptions::new()
        .read(true)
        .share_mode(FILE_SHARE_READ)
        .open(path)
        .map_err(|source| VerifyError::Inaccessible {
            path: path.to_path_buf(),
            source,
        })?;
    HELD.lock().unwrap().push(file);
    Ok(())
}

#[cfg(windows)]
mod win {
    use super::VerifyError;
    use std::path::Path;

    /// WinVerifyTrust over the embedded Authenticode signature. The
    /// certificate-chain comparison against the driver's signer happens in
    /// the kernel on the stub-device open; here a broken or absent
    /// signature is already fatal.
    pub fn verify_signature(path: &Path) -> Result<(), VerifyError> {
        use std::os::windows::ffi::OsStrExt;
        use windows_sys::core::GUID;
        use windows_sys::Win32::Security::WinTrust::{
            WinVerifyTrust, WINTRUST_ACTION_GENERIC_VERIFY_V2, WINTRUST_DATA,
            WINTRUST_DATA_0, WINTRUST_FILE_INFO, WTD_CHOICE_FILE, WTD_REVOKE_NONE,
            WTD_STATEACTION_IGNORE, WTD_UI_NONE,
        };

        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let mut file_info = WINTRUST_FILE_INFO {
            cbStruct: std::mem::size_of::<WINTRUST_FILE_INFO>() as u32,
            pcwszFilePath: wide.as_ptr(),
            hFile: 0,
            pgKnownSubject: std::ptr::null_mut(),
        };
        let mut data = unsafe { std::mem::zeroed::<WINTRUST_DATA>() };
        data.cbStruct = std::mem::size_of::<WINTRUST_DATA>() as u32;
        data.dwUIChoice = WTD_UI_NONE;
        data.fdwRevocationChecks = WTD_REVOKE_NONE;
        data.dwUnionChoice = WTD_CHOICE_FILE;
        data.dwStateAction = WTD_STATEACTION_IGNORE;
        data.Anonymous = WINTRUST_DATA_0 {
            pFile: &mut file_info,
        };

        let mut action: GUID = WINTRUST_ACTION_GENERIC_VERIFY_V2;
        let status = unsafe { WinVerifyTrust(0, &mut action, &mut data as *mut _ as _) };
        if status != 0 {
            return Err(VerifyError::BadSignature {
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_modes() {
        assert!(mode_is_safe(0o100755));
        assert!(mode_is_safe(0o100644));
        assert!(mode_is_safe(0o040755));
        assert!(!mode_is_safe(0o100664));
        assert!(!mode_is_safe(0o100666));
        assert!(!mode_is_safe(0o040775));
    }

    #[test]
    fn system_ownership() {
        assert!(owner_is_system(0, 0));
        assert!(!owner_is_system(1000, 0));
        assert!(!owner_is_system(0, 1000));
    }

    #[cfg(unix)]
    #[test]
    fn missing_protected_file_is_inaccessible() {
        let err = verify_file(Path::new("/nonexistent/VBoxRT.so")).unwrap_err();
        match err {
            VerifyError::Inaccessible { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::NotFound)
            }
            other => panic!("unexpected: {other}"),
        }
    }
}
