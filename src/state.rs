#![allow(clippy::declare_interior_mutable_const)] // Usage is legit in this module.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::{
    bd::Bd,
    buffer::PacketBuffer,
    endpoint::{Bank, Endpoints, Toggle, MAX_ENDPOINTS, MAX_PACKET_SIZE},
    sie::Sie,
};

/// A buffer descriptor and the packet memory it describes.
pub(crate) struct Slot {
    pub(crate) bd: Bd,
    pub(crate) buffer: PacketBuffer,
}

// Safety: the packet buffer is only accessed by whoever holds the
// descriptor's ownership tag, and the tag is atomic.
unsafe impl Sync for Slot {}

impl Slot {
    const fn new() -> Self {
        Slot {
            bd: Bd::new(),
            buffer: PacketBuffer::new(),
        }
    }
}

/// Bookkeeping for one endpoint direction.
pub(crate) struct Pair {
    pub(crate) enabled: AtomicBool,
    pub(crate) halted: AtomicBool,
    /// Two banks (ping-pong) or one.
    pub(crate) double: AtomicBool,
    pub(crate) next: AtomicU8,
    pub(crate) toggle: AtomicU8,
    pub(crate) max_packet: AtomicU8,
    /// Held while one context arms a descriptor of this direction.
    pub(crate) arming: AtomicBool,
    /// Counts restarts of the direction. An arm that sees it change was
    /// overtaken by an enable, disable, or halt clear.
    pub(crate) epoch: AtomicU8,
}

impl Pair {
    const fn new() -> Self {
        Pair {
            enabled: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            double: AtomicBool::new(false),
            next: AtomicU8::new(Bank::Even as u8),
            toggle: AtomicU8::new(Toggle::Data0 as u8),
            max_packet: AtomicU8::new(MAX_PACKET_SIZE as u8),
            arming: AtomicBool::new(false),
            epoch: AtomicU8::new(0),
        }
    }

    pub(crate) fn next(&self) -> Bank {
        Bank::from_bits(self.next.load(Ordering::Acquire))
    }

    pub(crate) fn set_next(&self, bank: Bank) {
        self.next.store(bank as u8, Ordering::Release);
    }

    /// Move the bank pointer past the bank that was just armed.
    pub(crate) fn advance(&self) {
        if self.double.load(Ordering::Relaxed) {
            self.set_next(self.next().other());
        }
    }

    pub(crate) fn toggle(&self) -> Toggle {
        Toggle::from_bits(self.toggle.load(Ordering::Acquire) as u32)
    }

    pub(crate) fn set_toggle(&self, toggle: Toggle) {
        self.toggle.store(toggle as u8, Ordering::Release);
    }

    pub(crate) fn max_packet(&self) -> usize {
        self.max_packet.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn epoch(&self) -> u8 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Start the bank pointer and toggle over.
    pub(crate) fn restart(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.set_next(Bank::Even);
        self.set_toggle(Toggle::Data0);
    }

    /// Start over, as if the direction was just enabled.
    pub(crate) fn reset(&self, enabled: bool, halted: bool) {
        self.restart();
        self.halted.store(halted, Ordering::Release);
        self.enabled.store(enabled, Ordering::Release);
    }
}

/// A list of descriptor slots
///
/// Four slots per endpoint: OUT even, OUT odd, IN even, IN odd.
#[repr(align(512))]
struct SlotList<const COUNT: usize>([Slot; COUNT]);

impl<const COUNT: usize> SlotList<COUNT> {
    const fn new() -> Self {
        const SLOT: Slot = Slot::new();
        Self([SLOT; COUNT])
    }
}

/// The maximum number of descriptor slots.
///
/// Sixteen endpoints, two directions, two banks.
pub const MAX_SLOTS: usize = MAX_ENDPOINTS * 4;

const PAIR_COUNT: usize = MAX_ENDPOINTS * 2;

/// Taken bit, kept in the dirty-control word.
const TABLE_TAKEN: u32 = 1 << 31;

/// The buffer descriptor table shared with the serial interface engine.
///
/// Each USB device needs a `DescriptorTable`. Allocate a `static` object
/// and supply it to [`UsbDevice::new`](crate::UsbDevice::new). A table can
/// only back one device; the device constructor panics if the table
/// is already in use.
///
/// ```
/// use bdt_usbd::DescriptorTable;
///
/// static TABLE: DescriptorTable = DescriptorTable::max_endpoints();
/// ```
///
/// If you know that you can use fewer endpoints, you can control the
/// memory utilization with the const generic `COUNT`. `COUNT` is four times
/// the number of endpoints, and must be at least four, for the control
/// endpoint.
///
/// ```
/// use bdt_usbd::DescriptorTable;
///
/// // Control endpoint, and endpoint 1.
/// static TABLE: DescriptorTable<8> = DescriptorTable::new();
/// ```
pub struct DescriptorTable<const COUNT: usize = MAX_SLOTS> {
    slots: SlotList<COUNT>,
    pairs: [Pair; PAIR_COUNT],
    controls: [AtomicU8; MAX_ENDPOINTS],
    /// Low 16 bits mark endpoint control values that the controller hasn't
    /// seen. Bit 31 is set when the table is taken by a device.
    dirty: AtomicU32,
    /// One bit per slot whose transfer was terminated and not yet reported.
    terminated: AtomicU64,
}

impl DescriptorTable<MAX_SLOTS> {
    /// Allocate descriptors for every supported endpoint.
    pub const fn max_endpoints() -> Self {
        Self::new()
    }
}

impl<const COUNT: usize> DescriptorTable<COUNT> {
    /// Allocate descriptors for `COUNT / 4` endpoints.
    ///
    /// Panics if `COUNT` isn't a non-zero multiple of four, or if it's
    /// larger than [`MAX_SLOTS`].
    pub const fn new() -> Self {
        assert!(COUNT >= 4 && COUNT % 4 == 0 && COUNT <= MAX_SLOTS);
        const PAIR: Pair = Pair::new();
        const CONTROL: AtomicU8 = AtomicU8::new(0);
        Self {
            slots: SlotList::new(),
            pairs: [PAIR; PAIR_COUNT],
            controls: [CONTROL; MAX_ENDPOINTS],
            dirty: AtomicU32::new(0),
            terminated: AtomicU64::new(0),
        }
    }

    /// A shared view of the descriptors.
    ///
    /// Class drivers and application code use this view to arm their own
    /// endpoints. Any number of views may exist.
    pub fn endpoints(&self) -> Endpoints<'_> {
        Endpoints {
            slots: &self.slots.0,
            pairs: &self.pairs[..COUNT / 2],
            controls: &self.controls[..COUNT / 4],
            dirty: &self.dirty,
            terminated: &self.terminated,
        }
    }

    /// The serial interface engine's side of the table.
    pub fn sie(&self) -> Sie<'_> {
        Sie::new(self.endpoints())
    }

    /// Claim the table for a device.
    ///
    /// Returns `None` if the table was already taken.
    pub(crate) fn take(&self) -> Option<Endpoints<'_>> {
        let dirty = self.dirty.fetch_or(TABLE_TAKEN, Ordering::SeqCst);
        (dirty & TABLE_TAKEN == 0).then(|| self.endpoints())
    }
}

#[cfg(test)]
mod test {
    use super::DescriptorTable;

    #[test]
    fn take_table() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        assert!(table.take().is_some());
        assert!(table.take().is_none());
        assert_eq!(table.endpoints().endpoint_count(), 2);
    }

    #[test]
    fn max_endpoints() {
        static TABLE: DescriptorTable = DescriptorTable::max_endpoints();
        assert_eq!(TABLE.endpoints().endpoint_count(), 16);
    }
}
