//! Serial interface engine access
//!
//! The hardware side of the descriptor table. A HAL whose controller can't
//! DMA straight into the table, or a test that plays the host, moves packet
//! bytes through [`Sie`] and then reports the transaction with
//! [`Notification::Token`](crate::Notification::Token).

use usb_device::endpoint::EndpointAddress;

use crate::{
    cell::Owner,
    endpoint::{Bank, Endpoints, Toggle},
    ral,
};

/// An armed descriptor, as the hardware sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Armed {
    /// Bytes to send, or the most bytes to receive.
    pub count: usize,
    pub toggle: Toggle,
    /// Received packets must carry `toggle`.
    pub toggle_sync: bool,
    /// Respond to the token with STALL.
    pub stall: bool,
}

/// The serial interface engine's view of the descriptor table
///
/// Acquire it from [`DescriptorTable::sie`](crate::DescriptorTable::sie).
/// Every method only touches descriptors that are armed.
#[derive(Clone, Copy)]
pub struct Sie<'a> {
    endpoints: Endpoints<'a>,
}

impl<'a> Sie<'a> {
    pub(crate) fn new(endpoints: Endpoints<'a>) -> Self {
        Sie { endpoints }
    }

    /// Number of banks in use for the endpoint direction, one or two.
    pub fn banks(&self, address: EndpointAddress) -> usize {
        self.endpoints
            .pair(address)
            .map_or(1, |pair| 1 + pair.double.load(core::sync::atomic::Ordering::Relaxed) as usize)
    }

    /// Returns `None` if the descriptor isn't armed.
    pub fn armed(&self, address: EndpointAddress, bank: Bank) -> Option<Armed> {
        let slot = self.endpoints.slot(address, bank)?;
        if slot.bd.owner.owner() != Owner::Hardware {
            return None;
        }
        let (stall, toggle_sync, toggle) =
            ral::read_reg!(crate::bd, &slot.bd, STAT, BSTALL, DTSEN, DTS);
        Some(Armed {
            count: ral::read_reg!(crate::bd, &slot.bd, CNT, COUNT) as usize,
            toggle: Toggle::from_bits(toggle),
            toggle_sync: toggle_sync != 0,
            stall: stall != 0,
        })
    }

    /// Copy the packet of an armed IN descriptor into `packet`
    ///
    /// Returns the packet length, or `None` if the descriptor isn't armed.
    pub fn transmit(&self, address: EndpointAddress, bank: Bank, packet: &mut [u8]) -> Option<usize> {
        let armed = self.armed(address, bank)?;
        let slot = self.endpoints.slot(address, bank)?;
        // Safety: armed, so firmware won't touch the buffer.
        Some(unsafe { slot.buffer.read(packet, armed.count) })
    }

    /// Copy a received packet into an armed OUT descriptor
    ///
    /// Bytes beyond the armed count are dropped. Returns the number of
    /// bytes stored, or `None` if the descriptor isn't armed.
    pub fn receive(&self, address: EndpointAddress, bank: Bank, packet: &[u8]) -> Option<usize> {
        let armed = self.armed(address, bank)?;
        let slot = self.endpoints.slot(address, bank)?;
        let packet = &packet[..packet.len().min(armed.count)];
        // Safety: see transmit().
        Some(unsafe { slot.buffer.write(packet) })
    }
}
