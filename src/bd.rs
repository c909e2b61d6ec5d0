//! Buffer descriptors (BD)
//!
//! The module implements a RAL-compatible interface for working
//! with buffer descriptors. There's one descriptor per endpoint,
//! direction, and ping-pong bank.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::cell::{Ownership, VCell};

#[repr(C)]
pub struct Bd {
    pub STAT: VCell<u32>,
    pub CNT: VCell<u32>,
    pub owner: Ownership,
}

impl Bd {
    pub const fn new() -> Self {
        Bd {
            STAT: VCell::new(0),
            CNT: VCell::new(0),
            owner: Ownership::new(),
        }
    }
}

pub mod STAT {
    /// Respond to tokens with STALL.
    pub mod BSTALL {
        pub const offset: u32 = 2;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Check the data toggle of received packets.
    pub mod DTSEN {
        pub const offset: u32 = 3;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// DATA0 (0) or DATA1 (1).
    pub mod DTS {
        pub const offset: u32 = 6;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    /// Token PID of the completed transaction.
    pub mod PID {
        pub const offset: u32 = 8;
        pub const mask: u32 = 0xF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod RESULT {
        pub const offset: u32 = 12;
        pub const mask: u32 = 0b11 << offset;
        pub mod RW {
            pub const COMPLETE: u32 = 0;
            pub const ERROR: u32 = 1;
            pub const TOGGLE_MISMATCH: u32 = 2;
            pub const TERMINATED: u32 = 3;
        }
        pub mod R {}
        pub mod W {}
    }
    /// Bus error flags, see [`BusErrors`](super::BusErrors).
    pub mod ERR {
        pub const offset: u32 = 16;
        pub const mask: u32 = 0xFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod CNT {
    pub mod COUNT {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0x3FF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

bitflags::bitflags! {
    /// Bus error conditions reported by the serial interface engine
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BusErrors : u8 {
        const PID_CHECK = 1 << 0;
        const CRC5 = 1 << 1;
        const CRC16 = 1 << 2;
        /// Data field size wasn't a whole number of bytes.
        const DATA_FIELD = 1 << 3;
        const BUS_TIMEOUT = 1 << 4;
        const DMA = 1 << 5;
        const BUS_MATRIX = 1 << 6;
        const BIT_STUFF = 1 << 7;
    }
}
