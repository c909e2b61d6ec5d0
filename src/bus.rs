//! Interrupt-safe device access
//!
//! Share a [`UsbDevice`] between an interrupt handler, which reports
//! notifications, and the rest of the firmware.

use core::cell::RefCell;
use cortex_m::interrupt::Mutex;

#[cfg(not(test))]
use cortex_m::interrupt::free;

use crate::{
    driver::{Notification, UsbDevice},
    event::EventHandler,
    Controller,
};

/// A [`UsbDevice`] behind a critical section
///
/// ```no_run
/// use bdt_usbd::{BusAdapter, Config, Controller, DescriptorTable, Descriptors, EndpointOptions, Notification, UsbDevice};
///
/// struct Registers;
/// impl Controller for Registers {
///     fn set_endpoint_control(&mut self, ep: u8, options: EndpointOptions) { /* ... */ }
///     fn set_address(&mut self, address: u8) { /* ... */ }
///     fn resume_token_processing(&mut self) { /* ... */ }
///     fn signal_resume(&mut self) { /* ... */ }
/// }
///
/// static TABLE: DescriptorTable<8> = DescriptorTable::new();
/// static DEVICE: [u8; 18] = [18, 1, 0, 2, 0, 0, 0, 64, 0, 0, 0, 0, 0, 1, 0, 0, 0, 1];
///
/// let device = UsbDevice::new(
///     Registers,
///     &TABLE,
///     Config::new(),
///     Descriptors::new(&DEVICE, &[], &[]),
///     (),
///     (),
/// );
/// let bus = BusAdapter::new(device);
///
/// // In the USB interrupt handler:
/// bus.service(Notification::BusActive);
///
/// // Anywhere else:
/// let configured = bus.with_device(|device| device.stack().configuration() != 0);
/// ```
pub struct BusAdapter<'a, P, C = (), A = ()> {
    device: Mutex<RefCell<UsbDevice<'a, P, C, A>>>,
}

impl<'a, P, C, A> BusAdapter<'a, P, C, A>
where
    P: Controller,
    C: EventHandler,
    A: EventHandler,
{
    pub fn new(device: UsbDevice<'a, P, C, A>) -> Self {
        BusAdapter {
            device: Mutex::new(RefCell::new(device)),
        }
    }

    /// Report a notification to the device, in a critical section.
    pub fn service(&self, notification: Notification) {
        self.with_device(|device| device.service(notification))
    }

    /// Interrupt-safe, mutable access to the device
    pub fn with_device<R>(&self, func: impl FnOnce(&mut UsbDevice<'a, P, C, A>) -> R) -> R {
        free(|cs| {
            let device = self.device.borrow(cs);
            let mut device = device.borrow_mut();
            func(&mut *device)
        })
    }
}

/// Host tests have no interrupts to mask.
#[cfg(test)]
fn free<F, R>(func: F) -> R
where
    F: FnOnce(&cortex_m::interrupt::CriticalSection) -> R,
{
    // Safety: tests run each device on one thread, without interrupts.
    func(unsafe { &cortex_m::interrupt::CriticalSection::new() })
}
