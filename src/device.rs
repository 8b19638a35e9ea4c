// CLASSIFICATION: COMMUNITY
// Filename: device.rs v0.7
// Author: Lukas Bower
// Date Modified: 2026-07-09

//! Support-driver device opener.
//!
//! One open, one cookie handshake, and a fixed taxonomy of the ways both
//! can go wrong. Everything outside the taxonomy is reported with its raw
//! code rather than guessed at.

use thiserror::Error;

use crate::err::{rc, InitOp};
use crate::ffi::PreInitData;

/// Device node granting unrestricted driver access.
#[cfg(unix)]
pub const DEVICE_NODE: &str = "/dev/vboxdrv";
#[cfg(windows)]
pub const DEVICE_NODE: &str = r"\\.\VBoxDrv";

/// Stub device used by the second-respawn child to request driver-side
/// process hardening.
#[cfg(windows)]
pub const STUB_DEVICE_NODE: &str = r"\\.\VBoxDrvStub";

/// Stub-side interface version for the cookie handshake; major half must
/// match the driver.
pub const DRIVER_VERSION: u32 = 0x0029_0001;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("kernel driver not installed")]
    NotInstalled,
    #[error("kernel driver not accessible")]
    NotAccessible,
    #[error("kernel driver load error")]
    LoadError,
    #[error("kernel driver open error")]
    OpenError,
    #[error("kernel driver version mismatch (driver {driver:#x}, stub {stub:#x})")]
    VersionMismatch { driver: u32, stub: u32 },
    #[error("permission denied opening the kernel driver")]
    PermissionDenied,
    #[error("kernel memory allocation/mapping failed")]
    OutOfMemory,
    #[error("driver integrity check failed: {0}")]
    IntegrityViolation(&'static str),
    #[error("unexpected driver error (code {0})")]
    Other(i32),
}

impl DeviceError {
    /// Which fatal-error category the condition belongs to.
    pub fn init_op(&self) -> InitOp {
        match self {
            DeviceError::IntegrityViolation(_) => InitOp::Integrity,
            _ => InitOp::Driver,
        }
    }

    /// Stable status code for diagnostics.
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::NotInstalled => rc::DRIVER_NOT_INSTALLED,
            DeviceError::NotAccessible => rc::DRIVER_NOT_ACCESSIBLE,
            DeviceError::LoadError => rc::DRIVER_LOAD_ERROR,
            DeviceError::OpenError => rc::DRIVER_OPEN_ERROR,
            DeviceError::VersionMismatch { .. } => rc::DRIVER_VERSION_MISMATCH,
            DeviceError::PermissionDenied => rc::PERMISSION_DENIED,
            DeviceError::OutOfMemory => rc::OUT_OF_MEMORY,
            DeviceError::IntegrityViolation(_) => rc::INTEGRITY,
            DeviceError::Other(raw) => *raw,
        }
    }
}

/// Map an open(2) errno onto the taxonomy.
#[cfg(unix)]
pub fn classify_errno(errno: i32) -> DeviceError {
    match errno {
        libc::ENOENT | libc::ENXIO | libc::ENODEV => DeviceError::NotInstalled,
        libc::EACCES => DeviceError::NotAccessible,
        libc::EPERM => DeviceError::PermissionDenied,
        libc::ENOMEM => DeviceError::OutOfMemory,
        libc::EIO => DeviceError::LoadError,
        other => DeviceError::Other(other),
    }
}

#[cfg(unix)]
mod imp {
    use std::fs::OpenOptions;
    use std::os::fd::{AsRawFd, IntoRawFd};

    use super::*;
    use crate::ffi::PRE_INIT_MAGIC;

    /// Cookie handshake request/reply, driver wire format.
    #[repr(C)]
    struct CookieReq {
        magic: u32,
        min_version: u32,
        cookie: u32,
        session_cookie: u32,
        version: u32,
    }

    const COOKIE_MAGIC: u32 = 0x434f_4f4b;

    const fn iowr(ty: u8, nr: u8, size: usize) -> libc::c_ulong {
        // _IOWR(type, nr, size) per the asm-generic ioctl encoding.
        const IOC_READ: libc::c_ulong = 2;
        const IOC_WRITE: libc::c_ulong = 1;
        ((IOC_READ | IOC_WRITE) << 30)
            | ((size as libc::c_ulong) << 16)
            | ((ty as libc::c_ulong) << 8)
            | (nr as libc::c_ulong)
    }

    const IOCTL_COOKIE: libc::c_ulong = iowr(b'S', 1, std::mem::size_of::<CookieReq>());

    /// Open the device node, negotiate cookies, and build the pre-init
    /// blob. The returned blob owns the descriptor.
    pub fn open_device() -> Result<PreInitData, DeviceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(DEVICE_NODE)
            .map_err(|e| classify_errno(e.raw_os_error().unwrap_or(0)))?;

        let mut req = CookieReq {
            magic: COOKIE_MAGIC,
            min_version: DRIVER_VERSION,
            cookie: 0,
            session_cookie: 0,
            version: 0,
        };
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), IOCTL_COOKIE, &mut req) };
        if rc != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(match errno {
                libc::ENOTTY | libc::EINVAL => DeviceError::OpenError,
                other => classify_errno(other),
            });
        }
        if req.magic != COOKIE_MAGIC {
            return Err(DeviceError::IntegrityViolation("cookie reply magic"));
        }
        if req.version >> 16 != DRIVER_VERSION >> 16 {
            return Err(DeviceError::VersionMismatch {
                driver: req.version,
                stub: DRIVER_VERSION,
            });
        }

        log::debug!(
            "device: {} open, driver version {:#x}",
            DEVICE_NODE,
            req.version
        );
        Ok(PreInitData {
            magic: PRE_INIT_MAGIC,
            device: file.into_raw_fd() as isize,
            cookie: req.cookie,
            session_cookie: req.session_cookie,
            driver_version: req.version,
            end_magic: PRE_INIT_MAGIC,
        })
    }
}

#[cfg(unix)]
pub use imp::open_device;

/// Open the device and diagnose failures fatally, as the pipeline wants.
#[cfg(unix)]
pub fn open_device_or_fatal() -> PreInitData {
    match open_device() {
        Ok(blob) => blob,
        Err(e) => {
            crate::err::fatal_msg("open_device", e.init_op(), e.code(), format_args!("{e}"))
        }
    }
}

/// On Windows the device is opened during early process init; the respawn
/// controller owns that path.
#[cfg(windows)]
pub fn open_device_or_fatal() -> PreInitData {
    crate::respawn::take_early_device()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn errno_classification() {
        assert!(matches!(classify_errno(libc::ENOENT), DeviceError::NotInstalled));
        assert!(matches!(classify_errno(libc::ENODEV), DeviceError::NotInstalled));
        assert!(matches!(classify_errno(libc::EACCES), DeviceError::NotAccessible));
        assert!(matches!(
            classify_errno(libc::EPERM),
            DeviceError::PermissionDenied
        ));
        assert!(matches!(classify_errno(libc::ENOMEM), DeviceError::OutOfMemory));
        assert!(matches!(classify_errno(7777), DeviceError::Other(7777)));
    }

    #[test]
    fn integrity_conditions_use_integrity_tag() {
        assert_eq!(
            DeviceError::IntegrityViolation("evil handle").init_op(),
            InitOp::Integrity
        );
        assert_eq!(DeviceError::NotInstalled.init_op(), InitOp::Driver);
        assert_eq!(
            DeviceError::VersionMismatch { driver: 1, stub: 2 }.init_op(),
            InitOp::Driver
        );
    }

    #[test]
    fn stable_codes() {
        assert_eq!(DeviceError::NotInstalled.code(), rc::DRIVER_NOT_INSTALLED);
        assert_eq!(DeviceError::Other(-42).code(), -42);
    }
}
