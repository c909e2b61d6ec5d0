//! Buffer descriptor manager
//!
//! Tracks, for every endpoint, direction and bank, who owns the buffer
//! descriptor, which data toggle goes out next, and how many bytes moved.
//! All operations take `&self` and only use atomics, so the service
//! routine and application code may use the same [`Endpoints`] view from
//! different execution contexts.

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use usb_device::{endpoint::EndpointAddress, UsbDirection, UsbError};

use crate::{
    bd::{BusErrors, STAT::RESULT::RW as result},
    cell::Owner,
    ral,
    state::{Pair, Slot},
};

/// The largest packet that a descriptor can describe.
pub const MAX_PACKET_SIZE: usize = 64;

/// The maximum supported number of endpoints, including the control
/// endpoint.
pub const MAX_ENDPOINTS: usize = 16;

/// One of the two ping-pong buffers of an endpoint direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Bank {
    Even = 0,
    Odd = 1,
}

impl Bank {
    pub(crate) const fn from_bits(bits: u8) -> Self {
        if bits & 1 == 0 {
            Bank::Even
        } else {
            Bank::Odd
        }
    }

    pub(crate) const fn other(self) -> Self {
        match self {
            Bank::Even => Bank::Odd,
            Bank::Odd => Bank::Even,
        }
    }
}

/// Data toggle, DATA0 or DATA1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Toggle {
    Data0 = 0,
    Data1 = 1,
}

impl Toggle {
    pub const fn flip(self) -> Self {
        match self {
            Toggle::Data0 => Toggle::Data1,
            Toggle::Data1 => Toggle::Data0,
        }
    }

    pub(crate) const fn from_bits(bits: u32) -> Self {
        if bits & 1 == 0 {
            Toggle::Data0
        } else {
            Toggle::Data1
        }
    }
}

/// Token packet identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Pid {
    Out = 0x1,
    In = 0x9,
    Setup = 0xD,
}

impl Pid {
    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0x1 => Some(Pid::Out),
            0x9 => Some(Pid::In),
            0xD => Some(Pid::Setup),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Endpoint configuration
    ///
    /// The bits match the controller's endpoint control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EndpointOptions : u8 {
        const STALL = 0x01;
        const IN = 0x02;
        const OUT = 0x04;
        /// Refuse SETUP tokens. Use for every endpoint but endpoint 0.
        const DISALLOW_SETUP = 0x08;
        const HANDSHAKE = 0x10;
    }
}

/// What to arm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer<'d> {
    /// Send these bytes.
    In(&'d [u8]),
    /// Receive up to this many bytes.
    Out(usize),
}

/// How a transfer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    /// The serial interface engine flagged bus errors.
    Error(BusErrors),
    /// An OUT packet arrived with the wrong data toggle.
    ToggleMismatch,
    /// Reclaimed by firmware before the host moved any data; bus reset,
    /// endpoint disable, or halt clear.
    Terminated,
}

/// Result of a finished transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Bytes moved. For IN transfers, the armed length.
    pub len: usize,
    /// Token that completed the transfer. `None` if the transfer never
    /// saw a token.
    pub pid: Option<Pid>,
    pub outcome: Outcome,
}

/// Reference to an armed descriptor
///
/// A handle stays meaningful until its endpoint, direction, and bank are
/// armed again. Querying an older handle reports the newer transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    index: u8,
}

impl Handle {
    pub(crate) const fn new(index: usize) -> Self {
        Handle { index: index as u8 }
    }

    pub(crate) const fn index(&self) -> usize {
        self.index as usize
    }

    /// The endpoint address of the transfer.
    pub fn address(&self) -> EndpointAddress {
        let direction = if self.index & 0b10 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        };
        EndpointAddress::from_parts(self.index() / 4, direction)
    }

    /// The bank that holds the transfer.
    pub fn bank(&self) -> Bank {
        Bank::from_bits(self.index)
    }
}

/// A transaction that the serial interface engine finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub address: EndpointAddress,
    pub bank: Bank,
    pub pid: Pid,
    /// Toggle of the data packet on the wire.
    pub toggle: Toggle,
    /// Bytes received, for OUT and SETUP tokens.
    pub count: usize,
    pub errors: BusErrors,
}

/// Produces an index into the slots collection.
pub(crate) fn slot_index(address: EndpointAddress, bank: Bank) -> usize {
    address.index() * 4 + (UsbDirection::In == address.direction()) as usize * 2 + bank as usize
}

/// Produces an index into the pairs collection.
fn pair_index(address: EndpointAddress) -> usize {
    address.index() * 2 + (UsbDirection::In == address.direction()) as usize
}

pub(crate) fn control_out() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::Out)
}

pub(crate) fn control_in() -> EndpointAddress {
    EndpointAddress::from_parts(0, UsbDirection::In)
}

/// Toggle selection when arming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ToggleMode {
    /// Next toggle in sequence.
    Auto,
    /// This toggle; the sequence continues after it.
    Force(Toggle),
    /// Ready for a SETUP. DATA0, no toggle check, sequence untouched.
    Setup,
}

/// Buffer descriptor operations
///
/// Acquire a view from [`DescriptorTable::endpoints`](crate::DescriptorTable::endpoints).
/// Endpoint 0 belongs to the control transfer state machine; the public
/// operations reject it.
#[derive(Clone, Copy)]
pub struct Endpoints<'a> {
    pub(crate) slots: &'a [Slot],
    pub(crate) pairs: &'a [Pair],
    pub(crate) controls: &'a [AtomicU8],
    pub(crate) dirty: &'a AtomicU32,
    pub(crate) terminated: &'a AtomicU64,
}

impl<'a> Endpoints<'a> {
    /// Number of endpoints backed by the table, including endpoint 0.
    pub fn endpoint_count(&self) -> usize {
        self.slots.len() / 4
    }

    pub(crate) fn pair(&self, address: EndpointAddress) -> Result<&'a Pair, UsbError> {
        self.pairs
            .get(pair_index(address))
            .ok_or(UsbError::InvalidEndpoint)
    }

    pub(crate) fn slot(&self, address: EndpointAddress, bank: Bank) -> Option<&'a Slot> {
        self.slots.get(slot_index(address, bank))
    }

    /// Both banks of an endpoint direction.
    fn banks(&self, address: EndpointAddress) -> core::slice::Iter<'a, Slot> {
        let first = slot_index(address, Bank::Even);
        let slots: &'a [Slot] = self.slots;
        slots.get(first..first + 2).unwrap_or(&[]).iter()
    }

    /// Enable (or reconfigure) an endpoint
    ///
    /// Directions absent from `options` are disabled. Either way, any
    /// transfer in flight on the endpoint is terminated, and toggles
    /// start over at DATA0.
    pub fn enable_endpoint(&self, ep: u8, options: EndpointOptions) -> Result<(), UsbError> {
        if ep as usize >= self.endpoint_count() {
            return Err(UsbError::InvalidEndpoint);
        }
        for (direction, flag) in [
            (UsbDirection::Out, EndpointOptions::OUT),
            (UsbDirection::In, EndpointOptions::IN),
        ] {
            let address = EndpointAddress::from_parts(ep as usize, direction);
            self.reclaim(address);
            let enabled = options.contains(flag);
            let pair = self.pair(address)?;
            if ep != 0 {
                pair.max_packet.store(MAX_PACKET_SIZE as u8, Ordering::Relaxed);
            }
            pair.reset(enabled, enabled && options.contains(EndpointOptions::STALL));
        }
        self.set_control(ep, options);
        debug!("ENABLE EP{} {:#x}", ep, options.bits());
        Ok(())
    }

    /// Disable both directions of an endpoint, terminating transfers.
    pub(crate) fn disable_endpoint(&self, ep: u8) {
        if self.enable_endpoint(ep, EndpointOptions::empty()).is_err() {
            warn!("DISABLE EP{} OUT OF RANGE", ep);
        }
    }

    /// Configure the control endpoint and bank usage.
    pub(crate) fn configure(&self, ping_pong: crate::PingPong, ep0_max_packet: u8) {
        for (index, pair) in self.pairs.iter().enumerate() {
            let ep = index / 2;
            let out = index % 2 == 0;
            pair.double
                .store(ping_pong.is_double(ep, out), Ordering::Relaxed);
        }
        for address in [control_out(), control_in()] {
            if let Ok(pair) = self.pair(address) {
                pair.max_packet.store(ep0_max_packet, Ordering::Relaxed);
            }
        }
        self.reset();
    }

    /// Return to the state after a bus reset
    ///
    /// Every endpoint except endpoint 0 is disabled. All transfers are
    /// terminated.
    pub(crate) fn reset(&self) {
        for ep in 1..self.endpoint_count() {
            self.disable_endpoint(ep as u8);
        }
        let options = EndpointOptions::HANDSHAKE | EndpointOptions::IN | EndpointOptions::OUT;
        if self.enable_endpoint(0, options).is_err() {
            warn!("NO CONTROL ENDPOINT");
        }
    }

    fn set_control(&self, ep: u8, options: EndpointOptions) {
        if let Some(control) = self.controls.get(ep as usize) {
            control.store(options.bits(), Ordering::Release);
            self.dirty.fetch_or(1 << ep, Ordering::AcqRel);
        }
    }

    fn update_control(&self, ep: u8, stall: bool) {
        if let Some(control) = self.controls.get(ep as usize) {
            let mut options = EndpointOptions::from_bits_truncate(control.load(Ordering::Acquire));
            options.set(EndpointOptions::STALL, stall);
            self.set_control(ep, options);
        }
    }

    /// The endpoint control value last configured for `ep`.
    pub fn options(&self, ep: u8) -> EndpointOptions {
        self.controls
            .get(ep as usize)
            .map(|control| EndpointOptions::from_bits_truncate(control.load(Ordering::Acquire)))
            .unwrap_or_default()
    }

    /// Endpoints whose control value changed since the last call.
    pub(crate) fn take_dirty(&self) -> u16 {
        self.dirty.fetch_and(!0xFFFF, Ordering::AcqRel) as u16
    }

    /// Slots whose transfers were terminated since the last call.
    pub(crate) fn take_terminated(&self) -> u64 {
        self.terminated.swap(0, Ordering::AcqRel)
    }

    /// Arm a transfer on a non-control endpoint
    ///
    /// The next bank of the endpoint direction must be firmware owned;
    /// there is no queuing. Returns `WouldBlock` if the bank is busy,
    /// `BufferOverflow` if IN data exceeds the max packet size, and
    /// `InvalidState` if the direction isn't enabled. `toggle` overrides the
    /// automatic toggle sequence.
    pub fn arm(&self, ep: u8, transfer: Transfer<'_>, toggle: Option<Toggle>) -> Result<Handle, UsbError> {
        if ep == 0 {
            return Err(UsbError::InvalidEndpoint);
        }
        let direction = match transfer {
            Transfer::In(_) => UsbDirection::In,
            Transfer::Out(_) => UsbDirection::Out,
        };
        let address = EndpointAddress::from_parts(ep as usize, direction);
        let mode = toggle.map_or(ToggleMode::Auto, ToggleMode::Force);
        self.prime(address, transfer, mode, false)
    }

    /// Arm a descriptor, any endpoint.
    pub(crate) fn prime(
        &self,
        address: EndpointAddress,
        transfer: Transfer<'_>,
        mode: ToggleMode,
        stall: bool,
    ) -> Result<Handle, UsbError> {
        let pair = self.pair(address)?;
        let epoch = pair.epoch();
        if !pair.is_enabled() {
            return Err(UsbError::InvalidState);
        }
        let count = match transfer {
            Transfer::In(data) if data.len() > pair.max_packet() => {
                return Err(UsbError::BufferOverflow)
            }
            Transfer::In(data) => data.len(),
            Transfer::Out(len) => len.min(pair.max_packet()),
        };
        if pair.arming.swap(true, Ordering::Acquire) {
            return Err(UsbError::WouldBlock);
        }
        let primed = self.prime_locked(pair, epoch, address, transfer, count, mode, stall);
        pair.arming.store(false, Ordering::Release);
        primed
    }

    #[allow(clippy::too_many_arguments)]
    fn prime_locked(
        &self,
        pair: &Pair,
        epoch: u8,
        address: EndpointAddress,
        transfer: Transfer<'_>,
        count: usize,
        mode: ToggleMode,
        stall: bool,
    ) -> Result<Handle, UsbError> {
        let bank = pair.next();
        let index = slot_index(address, bank);
        let slot = self.slots.get(index).ok_or(UsbError::InvalidEndpoint)?;
        if !slot.bd.owner.claim() {
            return Err(UsbError::WouldBlock);
        }

        if let Transfer::In(data) = transfer {
            // Safety: claimed above, so we have exclusive access.
            unsafe { slot.buffer.write(data) };
        }
        let (toggle, check) = match mode {
            ToggleMode::Auto => (pair.toggle(), true),
            ToggleMode::Force(toggle) => (toggle, true),
            ToggleMode::Setup => (Toggle::Data0, false),
        };
        if mode != ToggleMode::Setup {
            pair.set_toggle(toggle.flip());
        }

        ral::write_reg!(crate::bd, &slot.bd, CNT, COUNT: count as u32);
        ral::write_reg!(
            crate::bd,
            &slot.bd,
            STAT,
            BSTALL: stall as u32,
            DTSEN: check as u32,
            DTS: toggle as u32
        );
        pair.advance();
        slot.bd.owner.arm();
        self.settle(pair, epoch, index);

        trace!(
            "ARM EP{} {:?} {:?} {:?} LEN={}",
            address.index(),
            address.direction(),
            bank,
            toggle,
            count
        );
        Ok(Handle::new(index))
    }

    /// Check an arm that just finished
    ///
    /// If the direction restarted since `epoch`, an interrupt reset it
    /// while the descriptor was being filled. The reset couldn't reclaim a
    /// claimed descriptor, so it's terminated here, and the direction
    /// starts over again. A descriptor the reset did reclaim stays
    /// terminated once.
    fn settle(&self, pair: &Pair, epoch: u8, index: usize) {
        if pair.epoch() != epoch {
            warn!("ARM OVERTAKEN BY RESTART, SLOT {}", index);
            self.terminate(index);
            pair.set_next(Bank::Even);
            pair.set_toggle(Toggle::Data0);
        }
    }

    /// Indicates if the transfer is still owned by the hardware, or is
    /// being armed.
    pub fn is_busy(&self, handle: Handle) -> bool {
        self.slots
            .get(handle.index())
            .map_or(false, |slot| slot.bd.owner.owner() != Owner::Firmware)
    }

    /// Describe a finished transfer
    ///
    /// Returns `None` while the transfer is busy.
    pub fn completion(&self, handle: Handle) -> Option<Completion> {
        let slot = self.slots.get(handle.index())?;
        (slot.bd.owner.owner() == Owner::Firmware).then(|| completion_of(slot))
    }

    /// Read the data of a finished OUT transfer into `buffer`
    ///
    /// Returns the number of bytes read, constrained by the received length
    /// and the size of `buffer`.
    pub fn read(&self, handle: Handle, buffer: &mut [u8]) -> Result<usize, UsbError> {
        let slot = self
            .slots
            .get(handle.index())
            .ok_or(UsbError::InvalidEndpoint)?;
        if !slot.bd.owner.claim() {
            return Err(UsbError::WouldBlock);
        }
        let len = ral::read_reg!(crate::bd, &slot.bd, CNT, COUNT) as usize;
        // Safety: claimed above.
        let read = unsafe { slot.buffer.read(buffer, len) };
        slot.bd.owner.release();
        Ok(read)
    }

    /// The handle of the bank that the endpoint direction arms next
    ///
    /// Use this to check if the bank is busy before arming. Returns `None`
    /// if the direction isn't enabled.
    pub fn next_handle(&self, address: EndpointAddress) -> Option<Handle> {
        let pair = self.pair(address).ok()?;
        pair.is_enabled()
            .then(|| Handle::new(slot_index(address, pair.next())))
    }

    /// Halt a non-control endpoint direction.
    pub fn stall(&self, address: EndpointAddress) -> Result<(), UsbError> {
        if address.index() == 0 {
            return Err(UsbError::InvalidEndpoint);
        }
        let pair = self.pair(address)?;
        pair.halted.store(true, Ordering::Release);
        self.update_control(address.index() as u8, true);
        debug!("STALL EP{} {:?}", address.index(), address.direction());
        Ok(())
    }

    /// Clear a halt
    ///
    /// Toggles start over at DATA0. Transfers that were armed on the
    /// endpoint direction are terminated.
    pub fn clear_stall(&self, address: EndpointAddress) -> Result<(), UsbError> {
        if address.index() == 0 {
            return Err(UsbError::InvalidEndpoint);
        }
        let pair = self.pair(address)?;
        self.reclaim(address);
        pair.restart();
        pair.halted.store(false, Ordering::Release);

        let other = EndpointAddress::from_parts(
            address.index(),
            match address.direction() {
                UsbDirection::In => UsbDirection::Out,
                UsbDirection::Out => UsbDirection::In,
            },
        );
        let other_halted = self
            .pair(other)
            .map_or(false, |pair| pair.halted.load(Ordering::Acquire));
        self.update_control(address.index() as u8, other_halted);
        debug!("CLEAR STALL EP{} {:?}", address.index(), address.direction());
        Ok(())
    }

    /// Indicates if the endpoint direction responds with STALL.
    pub fn is_stalled(&self, address: EndpointAddress) -> bool {
        let Ok(pair) = self.pair(address) else {
            return false;
        };
        pair.halted.load(Ordering::Acquire)
            || self.banks(address).any(|slot| {
                slot.bd.owner.owner() == Owner::Hardware
                    && ral::read_reg!(crate::bd, &slot.bd, STAT, BSTALL == 1)
            })
    }

    /// Indicates if any bank of the endpoint direction is armed.
    pub(crate) fn is_armed(&self, address: EndpointAddress) -> bool {
        self.banks(address)
            .any(|slot| slot.bd.owner.owner() == Owner::Hardware)
    }

    /// Take back every armed bank of an endpoint direction
    ///
    /// Reclaimed transfers complete as [`Outcome::Terminated`]. The bank
    /// pointer moves back to the oldest reclaimed bank, since the hardware
    /// never consumed it.
    pub(crate) fn reclaim(&self, address: EndpointAddress) {
        let Ok(pair) = self.pair(address) else {
            return;
        };
        let next = pair.next();
        let mut rewind = None;
        for bank in [next, next.other()] {
            let index = slot_index(address, bank);
            if self.terminate(index) && rewind.is_none() {
                rewind = Some(bank);
            }
        }
        if let Some(bank) = rewind {
            pair.set_next(bank);
        }
    }

    fn terminate(&self, index: usize) -> bool {
        let Some(slot) = self.slots.get(index) else {
            return false;
        };
        if !slot.bd.owner.claim_armed() {
            return false;
        }
        ral::write_reg!(crate::bd, &slot.bd, CNT, COUNT: 0);
        ral::modify_reg!(crate::bd, &slot.bd, STAT, PID: 0, ERR: 0, RESULT: TERMINATED, BSTALL: 0);
        slot.bd.owner.release();
        if index >= 4 {
            self.terminated.fetch_or(1 << index, Ordering::AcqRel);
        }
        trace!("TERMINATE SLOT {}", index);
        true
    }

    /// Record a transaction reported by the serial interface engine
    ///
    /// Returns the handle of the armed descriptor, now owned by firmware,
    /// and its completion. Returns `InvalidState` if the descriptor wasn't
    /// armed.
    pub(crate) fn complete(&self, token: &Token) -> Result<(Handle, Completion), UsbError> {
        let pair = self.pair(token.address)?;
        let index = slot_index(token.address, token.bank);
        let slot = self.slots.get(index).ok_or(UsbError::InvalidEndpoint)?;
        if !slot.bd.owner.claim_armed() {
            return Err(UsbError::InvalidState);
        }

        let armed = Toggle::from_bits(ral::read_reg!(crate::bd, &slot.bd, STAT, DTS));
        let check = ral::read_reg!(crate::bd, &slot.bd, STAT, DTSEN == 1);
        let outcome = if !token.errors.is_empty() {
            result::ERROR
        } else if token.pid == Pid::Out && check && token.toggle != armed {
            result::TOGGLE_MISMATCH
        } else {
            result::COMPLETE
        };

        if token.pid != Pid::In {
            let received = token
                .count
                .min(ral::read_reg!(crate::bd, &slot.bd, CNT, COUNT) as usize)
                .min(MAX_PACKET_SIZE);
            ral::write_reg!(crate::bd, &slot.bd, CNT, COUNT: received as u32);
        }
        ral::modify_reg!(
            crate::bd,
            &slot.bd,
            STAT,
            PID: token.pid as u32,
            ERR: token.errors.bits() as u32,
            RESULT: outcome
        );

        if outcome != result::COMPLETE {
            // Retry with the toggle that failed.
            pair.set_toggle(armed);
        }
        if token.pid == Pid::Setup {
            // First data stage packet after SETUP is DATA1, both directions.
            for direction in [UsbDirection::Out, UsbDirection::In] {
                let address = EndpointAddress::from_parts(token.address.index(), direction);
                if let Ok(pair) = self.pair(address) {
                    pair.set_toggle(Toggle::Data1);
                }
            }
        }

        let completion = completion_of(slot);
        slot.bd.owner.release();
        Ok((Handle::new(index), completion))
    }
}

fn completion_of(slot: &Slot) -> Completion {
    let len = ral::read_reg!(crate::bd, &slot.bd, CNT, COUNT) as usize;
    let (pid, outcome, errors) = ral::read_reg!(crate::bd, &slot.bd, STAT, PID, RESULT, ERR);
    let outcome = match outcome {
        result::COMPLETE => Outcome::Complete,
        result::ERROR => Outcome::Error(BusErrors::from_bits_truncate(errors as u8)),
        result::TOGGLE_MISMATCH => Outcome::ToggleMismatch,
        _ => Outcome::Terminated,
    };
    Completion {
        len,
        pid: Pid::from_bits(pid),
        outcome,
    }
}

#[cfg(test)]
mod test {
    use super::{
        control_in, control_out, Bank, Completion, EndpointOptions, Handle, Outcome, Pid, Toggle,
        ToggleMode, Token, Transfer,
    };
    use crate::{bd::BusErrors, state::DescriptorTable, PingPong};
    use usb_device::{endpoint::EndpointAddress, UsbDirection, UsbError};

    const EP1_IN: u8 = 0x81;
    const EP1_OUT: u8 = 0x01;

    fn token(address: u8, bank: Bank, pid: Pid, toggle: Toggle, count: usize) -> Token {
        Token {
            address: EndpointAddress::from(address),
            bank,
            pid,
            toggle,
            count,
            errors: BusErrors::empty(),
        }
    }

    fn interrupt() -> EndpointOptions {
        EndpointOptions::IN
            | EndpointOptions::OUT
            | EndpointOptions::HANDSHAKE
            | EndpointOptions::DISALLOW_SETUP
    }

    #[test]
    fn handle_address() {
        let handle = Handle::new(7);
        assert_eq!(handle.address(), EndpointAddress::from(EP1_IN));
        assert_eq!(handle.bank(), Bank::Odd);
    }

    #[test]
    fn enable_endpoint_range() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Disabled, 64);
        assert_eq!(eps.enable_endpoint(2, interrupt()), Err(UsbError::InvalidEndpoint));
        assert_eq!(eps.enable_endpoint(1, interrupt()), Ok(()));
        assert_eq!(eps.options(1), interrupt());
        assert_eq!(eps.take_dirty(), 0b11);
        assert_eq!(eps.take_dirty(), 0);
    }

    #[test]
    fn arm_rejects_control_endpoint() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Disabled, 64);
        assert_eq!(
            eps.arm(0, Transfer::In(&[1]), None),
            Err(UsbError::InvalidEndpoint)
        );
    }

    #[test]
    fn arm_requires_enabled_direction() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Disabled, 64);
        assert_eq!(
            eps.arm(1, Transfer::In(&[1]), None),
            Err(UsbError::InvalidState)
        );
        eps.enable_endpoint(1, EndpointOptions::OUT).unwrap();
        assert_eq!(
            eps.arm(1, Transfer::In(&[1]), None),
            Err(UsbError::InvalidState)
        );
        assert!(eps.arm(1, Transfer::Out(8), None).is_ok());
    }

    #[test]
    fn arm_rejects_oversized_packets() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Disabled, 64);
        eps.enable_endpoint(1, interrupt()).unwrap();
        assert_eq!(
            eps.arm(1, Transfer::In(&[0; 65]), None),
            Err(UsbError::BufferOverflow)
        );
    }

    #[test]
    fn busy_until_that_bank_completes() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Disabled, 64);
        eps.enable_endpoint(1, interrupt()).unwrap();

        let handle = eps.arm(1, Transfer::In(&[1, 2, 3]), None).unwrap();
        assert!(eps.is_busy(handle));
        assert_eq!(eps.completion(handle), None);
        assert_eq!(
            eps.arm(1, Transfer::In(&[4]), None),
            Err(UsbError::WouldBlock)
        );

        // Tokens for other endpoints, directions, or banks don't retire it.
        assert!(eps
            .complete(&token(EP1_OUT, Bank::Even, Pid::Out, Toggle::Data0, 0))
            .is_err());
        assert!(eps
            .complete(&token(EP1_IN, Bank::Odd, Pid::In, Toggle::Data0, 0))
            .is_err());
        assert!(eps.is_busy(handle));

        let (retired, completion) = eps
            .complete(&token(EP1_IN, Bank::Even, Pid::In, Toggle::Data0, 3))
            .unwrap();
        assert_eq!(retired, handle);
        assert!(!eps.is_busy(handle));
        assert_eq!(
            completion,
            Completion {
                len: 3,
                pid: Some(Pid::In),
                outcome: Outcome::Complete
            }
        );
        assert_eq!(eps.completion(handle), Some(completion));
    }

    #[test]
    fn ping_pong_arms_both_banks() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Full, 64);
        eps.enable_endpoint(1, interrupt()).unwrap();

        let address = EndpointAddress::from(EP1_OUT);
        let next = eps.next_handle(address).unwrap();
        let even = eps.arm(1, Transfer::Out(64), None).unwrap();
        assert_eq!(even, next);
        assert_eq!(even.bank(), Bank::Even);
        let odd = eps.arm(1, Transfer::Out(64), None).unwrap();
        assert_eq!(odd.bank(), Bank::Odd);
        assert_eq!(eps.next_handle(address), Some(even));
        assert_eq!(eps.arm(1, Transfer::Out(64), None), Err(UsbError::WouldBlock));
    }

    #[test]
    fn toggles_alternate() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Disabled, 64);
        eps.enable_endpoint(1, interrupt()).unwrap();
        let sie = table.sie();
        let address = EndpointAddress::from(EP1_IN);

        for n in 0..6 {
            eps.arm(1, Transfer::In(&[n]), None).unwrap();
            let armed = sie.armed(address, Bank::Even).unwrap();
            let expected = if n % 2 == 0 { Toggle::Data0 } else { Toggle::Data1 };
            assert_eq!(armed.toggle, expected);
            eps.complete(&token(EP1_IN, Bank::Even, Pid::In, armed.toggle, 1))
                .unwrap();
        }
    }

    #[test]
    fn toggle_override() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Disabled, 64);
        eps.enable_endpoint(1, interrupt()).unwrap();
        let sie = table.sie();
        let address = EndpointAddress::from(EP1_IN);

        eps.arm(1, Transfer::In(&[]), Some(Toggle::Data1)).unwrap();
        assert_eq!(sie.armed(address, Bank::Even).unwrap().toggle, Toggle::Data1);
        eps.complete(&token(EP1_IN, Bank::Even, Pid::In, Toggle::Data1, 0))
            .unwrap();
        eps.arm(1, Transfer::In(&[]), None).unwrap();
        assert_eq!(sie.armed(address, Bank::Even).unwrap().toggle, Toggle::Data0);
    }

    #[test]
    fn toggle_mismatch_is_an_error() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Disabled, 64);
        eps.enable_endpoint(1, interrupt()).unwrap();
        let sie = table.sie();
        let address = EndpointAddress::from(EP1_OUT);

        let handle = eps.arm(1, Transfer::Out(64), None).unwrap();
        sie.receive(address, Bank::Even, &[7, 7]).unwrap();
        let (_, completion) = eps
            .complete(&token(EP1_OUT, Bank::Even, Pid::Out, Toggle::Data1, 2))
            .unwrap();
        assert_eq!(completion.outcome, Outcome::ToggleMismatch);
        assert_eq!(eps.completion(handle).unwrap().outcome, Outcome::ToggleMismatch);

        // The retry expects the same toggle.
        eps.arm(1, Transfer::Out(64), None).unwrap();
        assert_eq!(sie.armed(address, Bank::Even).unwrap().toggle, Toggle::Data0);
    }

    #[test]
    fn bus_errors_complete_the_transfer() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Disabled, 64);
        eps.enable_endpoint(1, interrupt()).unwrap();

        let handle = eps.arm(1, Transfer::Out(64), None).unwrap();
        let mut bad = token(EP1_OUT, Bank::Even, Pid::Out, Toggle::Data0, 0);
        bad.errors = BusErrors::CRC16;
        eps.complete(&bad).unwrap();
        assert!(!eps.is_busy(handle));
        assert_eq!(
            eps.completion(handle).unwrap().outcome,
            Outcome::Error(BusErrors::CRC16)
        );
    }

    #[test]
    fn read_received_data() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Disabled, 64);
        eps.enable_endpoint(1, interrupt()).unwrap();
        let sie = table.sie();

        let handle = eps.arm(1, Transfer::Out(4), None).unwrap();
        let mut buffer = [0; 8];
        assert_eq!(eps.read(handle, &mut buffer), Err(UsbError::WouldBlock));

        // Constrained by the armed length.
        sie.receive(EndpointAddress::from(EP1_OUT), Bank::Even, &[1, 2, 3, 4, 5])
            .unwrap();
        eps.complete(&token(EP1_OUT, Bank::Even, Pid::Out, Toggle::Data0, 5))
            .unwrap();
        assert_eq!(eps.read(handle, &mut buffer), Ok(4));
        assert_eq!(buffer, [1, 2, 3, 4, 0, 0, 0, 0]);
    }

    #[test]
    fn stall_and_clear() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Disabled, 64);
        eps.enable_endpoint(1, interrupt()).unwrap();
        eps.take_dirty();
        let address = EndpointAddress::from(EP1_IN);

        assert_eq!(eps.stall(control_in()), Err(UsbError::InvalidEndpoint));
        eps.stall(address).unwrap();
        assert!(eps.is_stalled(address));
        assert!(eps.options(1).contains(EndpointOptions::STALL));
        assert_eq!(eps.take_dirty(), 0b10);

        let handle = eps.arm(1, Transfer::In(&[1]), None).unwrap();
        eps.clear_stall(address).unwrap();
        assert!(!eps.is_stalled(address));
        assert!(!eps.options(1).contains(EndpointOptions::STALL));
        assert_eq!(eps.completion(handle).unwrap().outcome, Outcome::Terminated);
        assert_eq!(eps.take_terminated(), 1 << handle.index());

        eps.arm(1, Transfer::In(&[1]), None).unwrap();
        let armed = table.sie().armed(address, Bank::Even).unwrap();
        assert_eq!(armed.toggle, Toggle::Data0);
    }

    #[test]
    fn reset_terminates_everything() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Full, 64);
        eps.enable_endpoint(1, interrupt()).unwrap();
        let a = eps.arm(1, Transfer::In(&[1]), None).unwrap();
        let b = eps.arm(1, Transfer::In(&[2]), None).unwrap();
        let c = eps.arm(1, Transfer::Out(64), None).unwrap();
        eps.prime(control_out(), Transfer::Out(8), ToggleMode::Setup, false)
            .unwrap();
        eps.take_terminated();

        eps.reset();
        for handle in [a, b, c] {
            assert!(!eps.is_busy(handle));
            assert_eq!(eps.completion(handle).unwrap().outcome, Outcome::Terminated);
        }
        // Control endpoint slots are never reported.
        assert_eq!(
            eps.take_terminated(),
            (1 << a.index()) | (1 << b.index()) | (1 << c.index())
        );
        assert_eq!(eps.take_terminated(), 0);
        assert_eq!(eps.arm(1, Transfer::In(&[1]), None), Err(UsbError::InvalidState));
        assert!(!eps.is_armed(control_out()));
    }

    #[test]
    fn reset_while_arming() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Full, 64);
        eps.enable_endpoint(1, interrupt()).unwrap();
        eps.take_terminated();

        let address = EndpointAddress::from(EP1_IN);
        let pair = eps.pair(address).unwrap();
        let epoch = pair.epoch();
        let index = super::slot_index(address, pair.next());
        let slot = eps.slot(address, Bank::Even).unwrap();
        assert!(slot.bd.owner.claim());

        // An interrupt resets the bus while the slot is filled.
        eps.reset();
        assert_eq!(eps.take_terminated(), 0);

        slot.bd.owner.arm();
        eps.settle(pair, epoch, index);
        let handle = Handle::new(index);
        assert!(!eps.is_busy(handle));
        assert_eq!(eps.completion(handle).unwrap().outcome, Outcome::Terminated);
        assert_eq!(eps.take_terminated(), 1 << index);
        assert_eq!(pair.next(), Bank::Even);
        assert_eq!(pair.toggle(), Toggle::Data0);
    }

    #[test]
    fn restart_after_arming_reports_once() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Full, 64);
        eps.enable_endpoint(1, interrupt()).unwrap();
        eps.take_terminated();

        let address = EndpointAddress::from(EP1_OUT);
        let pair = eps.pair(address).unwrap();
        let epoch = pair.epoch();
        let index = super::slot_index(address, pair.next());
        let slot = eps.slot(address, Bank::Even).unwrap();
        assert!(slot.bd.owner.claim());
        slot.bd.owner.arm();

        // The halt clear reclaims the armed slot before the arm finishes.
        eps.clear_stall(address).unwrap();
        assert_eq!(eps.take_terminated(), 1 << index);
        eps.settle(pair, epoch, index);
        assert_eq!(eps.take_terminated(), 0);
        assert!(!eps.is_busy(Handle::new(index)));
        assert_eq!(
            eps.completion(Handle::new(index)).unwrap().outcome,
            Outcome::Terminated
        );
    }

    #[test]
    fn undisturbed_arm_stays_armed() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Full, 64);
        eps.enable_endpoint(1, interrupt()).unwrap();
        let epoch = eps.pair(EndpointAddress::from(EP1_IN)).unwrap().epoch();
        let handle = eps.arm(1, Transfer::In(&[1]), None).unwrap();
        assert!(eps.is_busy(handle));
        assert_eq!(eps.pair(EndpointAddress::from(EP1_IN)).unwrap().epoch(), epoch);
    }

    #[test]
    fn reclaim_rewinds_bank() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Full, 64);
        let first = eps
            .prime(control_in(), Transfer::In(&[1]), ToggleMode::Auto, false)
            .unwrap();
        assert_eq!(first.bank(), Bank::Even);
        eps.reclaim(control_in());
        let again = eps
            .prime(control_in(), Transfer::In(&[1]), ToggleMode::Auto, false)
            .unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn setup_forces_data1() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Disabled, 8);
        let sie = table.sie();

        eps.prime(control_out(), Transfer::Out(8), ToggleMode::Setup, false)
            .unwrap();
        let armed = sie.armed(control_out(), Bank::Even).unwrap();
        assert!(!armed.toggle_sync);
        sie.receive(control_out(), Bank::Even, &[0; 8]).unwrap();
        let (_, completion) = eps
            .complete(&token(0x00, Bank::Even, Pid::Setup, Toggle::Data0, 8))
            .unwrap();
        assert_eq!(completion.pid, Some(Pid::Setup));
        assert_eq!(completion.len, 8);

        eps.prime(control_in(), Transfer::In(&[1]), ToggleMode::Auto, false)
            .unwrap();
        assert_eq!(sie.armed(control_in(), Bank::Even).unwrap().toggle, Toggle::Data1);
        eps.prime(control_out(), Transfer::Out(8), ToggleMode::Auto, false)
            .unwrap();
        assert_eq!(sie.armed(control_out(), Bank::Even).unwrap().toggle, Toggle::Data1);
    }

    #[test]
    fn directions_share_no_state() {
        let table: DescriptorTable<8> = DescriptorTable::new();
        let eps = table.endpoints();
        eps.configure(PingPong::Disabled, 64);
        eps.enable_endpoint(1, interrupt()).unwrap();
        let tx = eps.arm(1, Transfer::In(&[1]), None).unwrap();
        let rx = eps.arm(1, Transfer::Out(1), None).unwrap();
        assert_ne!(tx, rx);
        assert_eq!(tx.address().direction(), UsbDirection::In);
        assert_eq!(rx.address().direction(), UsbDirection::Out);
    }
}
