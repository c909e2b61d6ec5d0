//! Cells shared with the serial interface engine
//!
//! [`VCell`] is a volatile cell that conforms to the RAL register API, so
//! buffer descriptor fields can be accessed with the RAL macros.
//! [`Ownership`] is the tag that decides who may touch a descriptor.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

/// A volatile memory cell
///
/// Conforms to the RAL API: `read()` and `write()`.
#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T> VCell<T> {
    pub const fn new(val: T) -> Self {
        VCell(UnsafeCell::new(val))
    }
}

impl<T: Copy> VCell<T> {
    pub fn read(&self) -> T {
        // Safety: the pointer comes from the cell, so it's valid and aligned.
        unsafe { self.0.get().read_volatile() }
    }
    pub fn write(&self, val: T) {
        // Safety: see read().
        unsafe { self.0.get().write_volatile(val) }
    }
}

/// Who may access a buffer descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Owner {
    /// Firmware may fill and arm the descriptor.
    Firmware = 0,
    /// One firmware context is filling the descriptor.
    Claimed = 1,
    /// Armed. Only the serial interface engine may touch it.
    Hardware = 2,
}

impl Owner {
    const fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Owner::Firmware,
            1 => Owner::Claimed,
            _ => Owner::Hardware,
        }
    }
}

/// Atomic ownership tag for one buffer descriptor
///
/// Firmware claims the tag before touching the descriptor, and releases it
/// either to the hardware (arm) or back to firmware.
/// Every transition is a compare-and-swap, so two contexts can never both
/// believe they own the descriptor.
#[repr(transparent)]
pub struct Ownership(AtomicU8);

impl Ownership {
    pub const fn new() -> Self {
        Ownership(AtomicU8::new(Owner::Firmware as u8))
    }

    pub fn owner(&self) -> Owner {
        Owner::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Claim a firmware-owned descriptor for filling.
    ///
    /// Returns `false` if the descriptor is armed, or if another context
    /// claimed it first.
    pub fn claim(&self) -> bool {
        self.0
            .compare_exchange(
                Owner::Firmware as u8,
                Owner::Claimed as u8,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Hand a claimed descriptor to the hardware.
    ///
    /// All descriptor writes made while claimed are visible before the tag
    /// changes.
    pub fn arm(&self) {
        self.0.store(Owner::Hardware as u8, Ordering::Release);
    }

    /// Give up a claim, leaving the descriptor firmware owned.
    pub fn release(&self) {
        self.0.store(Owner::Firmware as u8, Ordering::Release);
    }

    /// Take an armed descriptor back from the hardware.
    ///
    /// Returns `false` if the descriptor wasn't armed, so a descriptor is
    /// taken back at most once per arm. Follow with [`release`](Self::release).
    pub fn claim_armed(&self) -> bool {
        self.0
            .compare_exchange(
                Owner::Hardware as u8,
                Owner::Claimed as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }
}
