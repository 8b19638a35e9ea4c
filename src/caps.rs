// CLASSIFICATION: COMMUNITY
// Filename: caps.rs v0.8
// Author: Lukas Bower
// Date Modified: 2026-07-25

//! Capability negotiation and the irreversible root drop (UNIX).
//!
//! Order matters throughout: the extra capabilities must be requested
//! while the effective UID is still 0, the drop itself must change real,
//! effective and saved IDs in one call, and the capability mask has to be
//! re-asserted afterwards because the kernel clears it on UID change.

use std::sync::atomic::{AtomicU64, Ordering};

use nix::unistd::{getegid, geteuid, getgid, getuid, Gid, Uid};

use crate::err::{self, rc, InitOp};
use crate::identity::{ProcessIdentity, IDENTITY};

pub const ENV_NET_RAW: &str = "HARD_CAP_NET_RAW";
pub const ENV_NET_BIND_SERVICE: &str = "HARD_CAP_NET_BIND_SERVICE";

#[cfg(target_os = "linux")]
const CAP_NET_BIND_SERVICE: u32 = 10;
#[cfg(target_os = "linux")]
const CAP_NET_RAW: u32 = 13;

/// Linux capability bits to carry across the drop. Zero everywhere else,
/// and zero for callers who are really root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapMask(pub u64);

// Kept for the fatal path, which must be able to re-run the drop without
// the pipeline context.
static GRABBED_MASK: AtomicU64 = AtomicU64::new(0);

/// Read the recognized environment variables into a capability mask.
/// Processes whose real UID is already 0 skip the capability dance.
pub fn grab_options() -> CapMask {
    if getuid().is_root() {
        return CapMask(0);
    }
    let mask = mask_from_env(
        std::env::var(ENV_NET_RAW).ok().as_deref(),
        std::env::var(ENV_NET_BIND_SERVICE).ok().as_deref(),
    );
    GRABBED_MASK.store(mask, Ordering::SeqCst);
    CapMask(mask)
}

/// Pure mapping from the two environment values to the mask: raw ICMP is
/// default-on, privileged bind is default-off.
#[cfg(target_os = "linux")]
pub(crate) fn mask_from_env(net_raw: Option<&str>, net_bind: Option<&str>) -> u64 {
    let mut mask = 0u64;
    if net_raw != Some("0") {
        mask |= 1 << CAP_NET_RAW;
    }
    if matches!(net_bind, Some(v) if v != "0") {
        mask |= 1 << CAP_NET_BIND_SERVICE;
    }
    mask
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn mask_from_env(_net_raw: Option<&str>, _net_bind: Option<&str>) -> u64 {
    0
}

/// Fatal unless the effective UID is the superuser. A set-uid stub that
/// runs without it comes from a butchered installation.
pub fn ensure_root(identity: &ProcessIdentity) {
    if !geteuid().is_root() {
        err::fatal_msg(
            "hardened_main",
            InitOp::RootCheck,
            rc::PERMISSION_DENIED,
            format_args!(
                "Effective UID is not root (euid={} egid={} uid={} gid={})",
                geteuid(),
                getegid(),
                identity.real_uid,
                identity.real_gid
            ),
        );
    }
}

/// Request the extra capabilities while we still hold root, and keep them
/// across the coming setuid.
pub fn grab_capabilities(mask: CapMask) {
    #[cfg(target_os = "linux")]
    {
        if mask.0 == 0 {
            return;
        }
        if capset(mask.0, mask.0).is_ok() {
            unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, 1, 0, 0, 0) };
        }
        unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 1, 0, 0, 0) };
    }
    #[cfg(not(target_os = "linux"))]
    let _ = mask;
}

/// Drop root for good: real, effective and saved IDs in one call, read
/// all of them back, and abort if any still smells of root. Idempotent:
/// a second call re-asserts the same final state.
pub fn drop_privileges(identity: &ProcessIdentity, mask: CapMask) {
    let uid = identity.real_uid;
    let gid = identity.real_gid;

    set_all_ids(uid, gid);

    let (ruid, euid, suid) = read_uids();
    let (rgid, egid, sgid) = read_gids();
    let uid_ok = ruid == uid && euid == uid && suid == uid;
    let gid_ok = rgid == gid && egid == gid && sgid == gid;
    let root_left = !uid.is_root()
        && (ruid.is_root()
            || euid.is_root()
            || suid.is_root()
            || rgid.as_raw() == 0
            || egid.as_raw() == 0
            || sgid.as_raw() == 0);
    if !uid_ok || !gid_ok || root_left {
        err::fatal(format_args!(
            "failed to drop root privileges! \
             (euid={euid} ruid={ruid} suid={suid} egid={egid} rgid={rgid} sgid={sgid}; \
             wanted uid={uid} and gid={gid})"
        ));
    }

    reassert_capabilities(mask);
}

/// Best-effort drop for the fatal path; does nothing before bootstrap.
pub fn drop_privileges_if_captured() {
    if let Some(identity) = IDENTITY.get() {
        drop_privileges(identity, CapMask(GRABBED_MASK.load(Ordering::SeqCst)));
    }
}

#[cfg(not(target_os = "macos"))]
fn set_all_ids(uid: Uid, gid: Gid) {
    if let Err(e) = nix::unistd::setresgid(gid, gid, gid) {
        err::fatal_msg(
            "drop_privileges",
            InitOp::RootCheck,
            rc::PERMISSION_DENIED,
            format_args!("setresgid({gid}) failed: {e}"),
        );
    }
    if let Err(e) = nix::unistd::setresuid(uid, uid, uid) {
        err::fatal_msg(
            "drop_privileges",
            InitOp::RootCheck,
            rc::PERMISSION_DENIED,
            format_args!("setresuid({uid}) failed: {e}"),
        );
    }
}

#[cfg(target_os = "macos")]
fn set_all_ids(uid: Uid, gid: Gid) {
    // setuid as the superuser changes all three variants on this platform;
    // there is no setres* family to be explicit with.
    unsafe {
        libc::setgid(gid.as_raw());
        libc::setuid(uid.as_raw());
    }
}

#[cfg(not(target_os = "macos"))]
fn read_uids() -> (Uid, Uid, Uid) {
    match nix::unistd::getresuid() {
        Ok(r) => (r.real, r.effective, r.saved),
        Err(_) => {
            let e = geteuid();
            let r = getuid();
            (r, e, r)
        }
    }
}

#[cfg(not(target_os = "macos"))]
fn read_gids() -> (Gid, Gid, Gid) {
    match nix::unistd::getresgid() {
        Ok(r) => (r.real, r.effective, r.saved),
        Err(_) => {
            let e = getegid();
            let r = getgid();
            (r, e, r)
        }
    }
}

#[cfg(target_os = "macos")]
fn read_uids() -> (Uid, Uid, Uid) {
    let e = geteuid();
    let r = getuid();
    (r, e, r)
}

#[cfg(target_os = "macos")]
fn read_gids() -> (Gid, Gid, Gid) {
    let e = getegid();
    let r = getgid();
    (r, e, r)
}

/// The UID change cleared the capability sets; put the mask back and lift
/// it into the ambient set so in-VM helpers inherit it.
fn reassert_capabilities(mask: CapMask) {
    #[cfg(target_os = "linux")]
    {
        if mask.0 == 0 {
            return;
        }
        if capset(mask.0, mask.0).is_err() {
            err::fatal_msg(
                "drop_privileges",
                InitOp::RootCheck,
                rc::PERMISSION_DENIED,
                format_args!("re-asserting capabilities {:#x} failed", mask.0),
            );
        }
        for bit in 0..64 {
            if mask.0 & (1 << bit) != 0 {
                let rc_ambient = unsafe {
                    libc::prctl(libc::PR_CAP_AMBIENT, libc::PR_CAP_AMBIENT_RAISE, bit, 0, 0)
                };
                if rc_ambient != 0 {
                    err::fatal_msg(
                        "drop_privileges",
                        InitOp::RootCheck,
                        rc::PERMISSION_DENIED,
                        format_args!("raising ambient capability {bit} failed"),
                    );
                }
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = mask;
}

/// Raw capset(2), version 3 layout: two data elements carrying the low
/// and high 32 capability bits. Only the inheritable-free subsets we use.
#[cfg(target_os = "linux")]
fn capset(effective: u64, permitted: u64) -> std::io::Result<()> {
    #[repr(C)]
    struct CapUserHeader {
        version: u32,
        pid: libc::c_int,
    }
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct CapUserData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }
    const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [
        CapUserData {
            effective: effective as u32,
            permitted: permitted as u32,
            inheritable: effective as u32,
        },
        CapUserData {
            effective: (effective >> 32) as u32,
            permitted: (permitted >> 32) as u32,
            inheritable: (effective >> 32) as u32,
        },
    ];
    let rc = unsafe { libc::syscall(libc::SYS_capset, &header, data.as_ptr()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[cfg(target_os = "linux")]
    #[test]
    fn default_mask_is_net_raw_only() {
        assert_eq!(mask_from_env(None, None), 1 << CAP_NET_RAW);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn net_raw_can_be_disabled() {
        assert_eq!(mask_from_env(Some("0"), None), 0);
        assert_ne!(mask_from_env(Some("1"), None), 0);
        assert_ne!(mask_from_env(Some(""), None), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn bind_service_is_opt_in() {
        assert_eq!(
            mask_from_env(None, Some("1")),
            (1 << CAP_NET_RAW) | (1 << CAP_NET_BIND_SERVICE)
        );
        assert_eq!(mask_from_env(None, Some("0")), 1 << CAP_NET_RAW);
        assert_eq!(
            mask_from_env(Some("0"), Some("yes")),
            1 << CAP_NET_BIND_SERVICE
        );
    }

    #[test]
    #[serial]
    fn grab_options_reads_environment() {
        std::env::set_var(ENV_NET_RAW, "0");
        std::env::set_var(ENV_NET_BIND_SERVICE, "0");
        let mask = grab_options();
        if !getuid().is_root() {
            assert_eq!(mask, CapMask(0));
        }
        std::env::remove_var(ENV_NET_RAW);
        std::env::remove_var(ENV_NET_BIND_SERVICE);
    }
}
