// CLASSIFICATION: COMMUNITY
// Filename: state.rs v0.4
// Author: Lukas Bower
// Date Modified: 2026-06-02

//! Monotonic pipeline progress marker.
//!
//! The marker is the canonical ordering witness for the launch pipeline:
//! every advance happens before the operation that requires the new state
//! begins, and the fatal-error reporter branches on it to pick output
//! channels that are still safe at that point.

use std::sync::atomic::{AtomicU32, Ordering};

/// Pipeline progress ordinals. The Windows-only states sit between
/// `HardenedMainCalled` and `InitRuntime`; UNIX runs skip straight over
/// them, which keeps the comparison in the error reporter valid on both
/// platforms.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Marker {
    NotYetCalled = 0,
    HardenedMainCalled = 1,
    WinEarlyStubCalled = 2,
    WinEarlyStubPurified = 3,
    WinEarlyImportsResolved = 4,
    WinEarlyInitDone = 5,
    WinImportsResolved = 6,
    WinVerifyTrustReady = 7,
    InitRuntime = 8,
    GetTrustedMain = 9,
    CalledTrustedMain = 10,
}

impl Marker {
    fn from_u32(v: u32) -> Marker {
        match v {
            0 => Marker::NotYetCalled,
            1 => Marker::HardenedMainCalled,
            2 => Marker::WinEarlyStubCalled,
            3 => Marker::WinEarlyStubPurified,
            4 => Marker::WinEarlyImportsResolved,
            5 => Marker::WinEarlyInitDone,
            6 => Marker::WinImportsResolved,
            7 => Marker::WinVerifyTrustReady,
            8 => Marker::InitRuntime,
            9 => Marker::GetTrustedMain,
            _ => Marker::CalledTrustedMain,
        }
    }
}

/// A single marker slot. The process-wide instance is [`STATE`]; tests use
/// local cells so they cannot interfere with each other.
pub struct StateCell(AtomicU32);

impl StateCell {
    pub const fn new() -> StateCell {
        StateCell(AtomicU32::new(Marker::NotYetCalled as u32))
    }

    pub fn get(&self) -> Marker {
        Marker::from_u32(self.0.load(Ordering::SeqCst))
    }

    /// Move the marker forward. Returns the current value unchanged if the
    /// requested transition would not be strictly increasing.
    pub fn advance(&self, to: Marker) -> Result<(), Marker> {
        let mut cur = self.0.load(Ordering::SeqCst);
        loop {
            if to as u32 <= cur {
                return Err(Marker::from_u32(cur));
            }
            match self
                .0
                .compare_exchange(cur, to as u32, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(()),
                Err(seen) => cur = seen,
            }
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        StateCell::new()
    }
}

/// Process-wide pipeline state.
pub static STATE: StateCell = StateCell::new();

/// Advance the process-wide marker; a regression is a state-machine
/// violation and therefore fatal.
pub fn advance(to: Marker) {
    if let Err(cur) = STATE.advance(to) {
        crate::err::fatal(format_args!(
            "state marker regression: {:?} -> {:?}\n",
            cur, to
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_are_strictly_increasing() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), Marker::NotYetCalled);
        cell.advance(Marker::HardenedMainCalled).unwrap();
        cell.advance(Marker::InitRuntime).unwrap();
        cell.advance(Marker::GetTrustedMain).unwrap();
        assert_eq!(cell.get(), Marker::GetTrustedMain);
    }

    #[test]
    fn regression_is_rejected() {
        let cell = StateCell::new();
        cell.advance(Marker::InitRuntime).unwrap();
        let err = cell.advance(Marker::HardenedMainCalled).unwrap_err();
        assert_eq!(err, Marker::InitRuntime);
        // Same-state re-advance is also a violation.
        assert!(cell.advance(Marker::InitRuntime).is_err());
        assert_eq!(cell.get(), Marker::InitRuntime);
    }

    #[test]
    fn windows_states_order_below_runtime_init() {
        assert!(Marker::WinImportsResolved < Marker::InitRuntime);
        assert!(Marker::WinVerifyTrustReady < Marker::InitRuntime);
        assert!(Marker::WinEarlyInitDone < Marker::WinImportsResolved);
    }
}
