// CLASSIFICATION: COMMUNITY
// Filename: flags.rs v0.3
// Author: Lukas Bower
// Date Modified: 2026-05-11

//! Caller options for the hardened launch pipeline.

use bitflags::bitflags;

bitflags! {
    /// Flag word passed by the outer stub entry point.
    ///
    /// The zero value means: open the support device, payload lives in the
    /// application-binary directory, no `TrustedError` export.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MainFlags: u32 {
        /// Do not open the support device; the payload runs driverless.
        const DONT_OPEN_DEVICE = 1 << 0;
        /// The payload advertises a `TrustedError` export for fatal reporting.
        const HAS_TRUSTED_ERROR = 1 << 1;
        /// The program binary lives in the `testcase/` subdirectory.
        const LOC_TESTCASE = 1 << 2;
        /// macOS VM application bundle; the payload short-name is fixed.
        const DARWIN_VM_APP = 1 << 3;
    }
}

impl Default for MainFlags {
    fn default() -> Self {
        MainFlags::empty()
    }
}

/// Installation location of the program binary and its payload library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    AppBin,
    Testcase,
}

impl MainFlags {
    pub fn location(self) -> Location {
        if self.contains(MainFlags::LOC_TESTCASE) {
            Location::Testcase
        } else {
            Location::AppBin
        }
    }

    /// True unless the caller asked for a driverless run.
    pub fn opens_device(self) -> bool {
        !self.contains(MainFlags::DONT_OPEN_DEVICE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_opens_device_from_app_bin() {
        let f = MainFlags::default();
        assert!(f.opens_device());
        assert_eq!(f.location(), Location::AppBin);
    }

    #[test]
    fn testcase_location_flag() {
        let f = MainFlags::DONT_OPEN_DEVICE | MainFlags::LOC_TESTCASE;
        assert!(!f.opens_device());
        assert_eq!(f.location(), Location::Testcase);
    }
}
