// CLASSIFICATION: COMMUNITY
// Filename: hardened_main.rs v1.0
// Author: Lukas Bower
// Date Modified: 2026-07-30

//! The launch pipeline.
//!
//! Linear by construction: bootstrap, verify, (respawn on the desktop
//! OS), open the driver, negotiate capabilities, drop root, load the
//! runtime, load the payload, hand over. Every stage either succeeds or
//! ends the process through the fatal reporter; nothing here recovers.

use std::ffi::OsString;

use crate::err;
use crate::flags::MainFlags;
use crate::hardlog;
use crate::identity::ProcessIdentity;
use crate::payload;
use crate::runtime;
use crate::state::{self, Marker};
use crate::suplog;
use crate::verify;

/// Run the hardened pipeline and the payload's `TrustedMain`; the return
/// value is the process exit status.
///
/// `args` is the raw argv including `argv[0]`. The startup-log option is
/// excised here, before anything else sees the vector.
pub fn hardened_main(prog_name: &str, flags: MainFlags, mut args: Vec<OsString>) -> i32 {
    // In the second-respawn child the early-init hook has already moved
    // the marker past this point; never move it back.
    if state::STATE.get() < Marker::HardenedMainCalled {
        state::advance(Marker::HardenedMainCalled);
    }
    err::set_prog_name(prog_name);
    hardlog::open_from_args(&mut args);
    suplog!("hardened_main: prog={prog_name} flags={:#x}", flags.bits());

    // Bootstrap. On Linux this must happen before the privilege drop can
    // make /proc/self/exe unreadable.
    let identity = ProcessIdentity::capture(prog_name, flags);
    verify::build_protected_set(identity);

    #[cfg(unix)]
    let cap_mask = crate::caps::grab_options();
    #[cfg(unix)]
    crate::caps::ensure_root(identity);

    // Desktop OS: the first respawn sheds compatibility shims before
    // anything sensitive happens in a process we do not yet trust.
    #[cfg(windows)]
    {
        use crate::respawn::{self, Generation};
        match respawn::generation(&args) {
            Generation::Initial if flags.opens_device() => {
                respawn::win_init(MainFlags::DONT_OPEN_DEVICE);
                let _ = verify::verify_all(true, prog_name, &identity.exe_path, flags);
                return respawn::respawn_first(identity, &args);
            }
            _ => respawn::win_init(flags),
        }
    }

    // Validate the installation.
    let _ = verify::verify_all(true, prog_name, &identity.exe_path, flags);

    // Open the support device, unless the caller runs driverless.
    let mut blob = crate::ffi::PreInitData::nil();
    if flags.opens_device() {
        #[cfg(windows)]
        {
            use crate::respawn::{self, Generation};
            if respawn::generation(&args) == Generation::Second {
                return respawn::respawn_second(identity, &args);
            }
            // Final process: early init already opened the device under
            // driver supervision.
            blob = respawn::take_early_device();
            respawn::resolve_verify_trust();
        }
        #[cfg(unix)]
        {
            blob = crate::device::open_device_or_fatal();
        }
    }

    // UNIX: raise what little we need, then drop root for good.
    #[cfg(unix)]
    {
        crate::caps::grab_capabilities(cap_mask);
        crate::caps::drop_privileges(identity, cap_mask);
    }

    suplog!("hardened_main: loading runtime");
    state::advance(Marker::InitRuntime);
    runtime::init_runtime(identity, blob);

    suplog!("hardened_main: resolving TrustedMain");
    state::advance(Marker::GetTrustedMain);
    let trusted_main = payload::get_trusted_main(identity);

    suplog!("hardened_main: calling TrustedMain");
    hardlog::flush();
    state::advance(Marker::CalledTrustedMain);
    payload::run_trusted_main(trusted_main, args)
}
