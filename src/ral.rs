//! Register access helpers
//!
//! Buffer descriptors are memory shared with the serial interface engine,
//! not memory-mapped registers, but they're laid out the same way. Describing
//! them with RAL-style field modules lets us use the same `read_reg!`,
//! `write_reg!` and `modify_reg!` macros that a HAL would use for the
//! controller registers.

pub use ral_registers::{modify_reg, read_reg, write_reg};
