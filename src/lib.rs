//! A USB device transfer engine for buffer descriptor table controllers
//!
//! `bdt-usbd` drives USB full speed device controllers that move packets
//! through a buffer descriptor table (BDT): one descriptor per endpoint,
//! direction, and bank, handed back and forth between firmware and the
//! serial interface engine. The crate
//!
//! - manages buffer descriptor ownership, data toggles, and ping-pong banks,
//! - runs the endpoint 0 control transfer state machine, including deferred
//!   data and status stages,
//! - tracks the device state through enumeration,
//! - answers the standard requests, and
//! - dispatches events through a chain of handlers: the core, a class, then
//!   the application.
//!
//! It relies on [`usb-device`] for USB vocabulary types, like [`Request`]
//! and [`EndpointAddress`]. [`CustomHid`] is a ready made class layer for a
//! vendor defined HID interface.
//!
//! # Integration
//!
//! Register access stays with your HAL. Implement [`Controller`] for the
//! registers that the engine can't reach through the descriptor table, then
//! translate interrupt flags into [`Notification`]s for
//! [`UsbDevice::service`]. When the HAL sees a token, it reads the token's
//! descriptor status through [`Sie`] and reports a [`Token`].
//!
//! ```no_run
//! use bdt_usbd::{
//!     Config, Controller, DescriptorTable, Descriptors, EndpointOptions, Notification, UsbDevice,
//! };
//!
//! struct Registers;
//! impl Controller for Registers {
//!     fn set_endpoint_control(&mut self, ep: u8, options: EndpointOptions) { /* ... */ }
//!     fn set_address(&mut self, address: u8) { /* ... */ }
//!     fn resume_token_processing(&mut self) { /* ... */ }
//!     fn signal_resume(&mut self) { /* ... */ }
//! }
//!
//! static TABLE: DescriptorTable<8> = DescriptorTable::new();
//! static DEVICE: [u8; 18] = [18, 1, 0, 2, 0, 0, 0, 64, 0, 0, 0, 0, 0, 1, 0, 0, 0, 1];
//!
//! let mut device = UsbDevice::new(
//!     Registers,
//!     &TABLE,
//!     Config::new(),
//!     Descriptors::new(&DEVICE, &[], &[]),
//!     (),
//!     (),
//! );
//! device.service(Notification::Attach);
//! // From the USB interrupt...
//! device.service(Notification::Reset);
//! ```
//!
//! [`usb-device`]: https://crates.io/crates/usb-device
//! [`Request`]: usb_device::control::Request
//! [`EndpointAddress`]: usb_device::endpoint::EndpointAddress

#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
mod log;

mod bd;
mod buffer;
mod bus;
mod cell;
mod config;
mod control;
mod descriptors;
mod driver;
mod endpoint;
mod enumeration;
mod event;
mod ral;
mod setup;
mod sie;
mod stack;
mod standard;
mod state;

pub mod hid;

#[cfg(test)]
mod testing;

pub use bd::BusErrors;
pub use bus::BusAdapter;
pub use config::{Config, PingPong, Speed, DEFAULT_STATUS_STAGE_TIMEOUT, EP0_MAX_PACKET_SIZES};
pub use control::{
    DataPlan, DataStage, SendOptions, Stage, StatusPlan, StatusStage, CONTROL_BUFFER_SIZE,
};
pub use descriptors::{descriptor_type, Descriptors};
pub use driver::{Notification, UsbDevice};
pub use endpoint::{
    Bank, Completion, EndpointOptions, Endpoints, Handle, Outcome, Pid, Token, Toggle, Transfer,
    MAX_ENDPOINTS, MAX_PACKET_SIZE,
};
pub use enumeration::DeviceState;
pub use event::{Event, EventHandler, Layer};
pub use hid::{CustomHid, IdleChange};
pub use setup::{parse as parse_setup, SETUP_LEN};
pub use sie::{Armed, Sie};
pub use stack::{Stack, MAX_INTERFACES};
pub use state::{DescriptorTable, MAX_SLOTS};

/// Longest time, in microseconds, between two calls of
/// [`UsbDevice::service`] while the bus is active.
///
/// Tokens are reported one at a time, and the engine stops processing
/// tokens until the notification is serviced.
pub const MAX_POLL_INTERVAL_US: u32 = 1_800;

/// Controller registers outside of the descriptor table
///
/// Implement this on the type that owns your controller's registers. The
/// engine calls these methods from [`UsbDevice::service`],
/// [`UsbDevice::new`], and [`UsbDevice::remote_wakeup`].
pub trait Controller {
    /// Write an endpoint control register.
    fn set_endpoint_control(&mut self, ep: u8, options: EndpointOptions);
    /// Write the device address register. Called with 0 on bus reset.
    fn set_address(&mut self, address: u8);
    /// Clear the suspend-token-processing flag, so that the serial
    /// interface engine takes tokens again after a SETUP.
    fn resume_token_processing(&mut self);
    /// Drive resume signaling onto the bus, waking a suspended host.
    ///
    /// Called from [`UsbDevice::remote_wakeup`]. The implementation holds
    /// resume signaling for 1 to 15 ms, then releases it.
    fn signal_resume(&mut self);
}
