//! A simulated host and controller
//!
//! The host plays the serial interface engine: it moves packet bytes
//! through [`Sie`], then reports each transaction to the device.

use std::vec::Vec;

use usb_device::{
    control::{Request, RequestType},
    endpoint::EndpointAddress,
    UsbDirection,
};

use crate::{
    bd::BusErrors,
    control::SendOptions,
    descriptors::Descriptors,
    endpoint::{Bank, EndpointOptions, Handle, Pid, Token, Toggle, MAX_ENDPOINTS, MAX_PACKET_SIZE},
    event::{Event, EventHandler},
    sie::{Armed, Sie},
    stack::Stack,
    Controller, Notification, UsbDevice,
};

pub static DEVICE: [u8; 18] = [
    18, 1, 0x00, 0x02, 0, 0, 0, 64, 0xD8, 0x04, 0x5F, 0x00, 0x01, 0x00, 1, 2, 0, 1,
];

pub static HID: [u8; 9] = [9, 0x21, 0x11, 0x01, 0, 1, 0x22, 29, 0];

/// One vendor defined HID interface, with an interrupt endpoint pair.
pub static CONFIGURATION: [u8; 41] = [
    9, 2, 41, 0, 1, 1, 0, 0x80, 50, //
    9, 4, 0, 0, 2, 0x03, 0, 0, 0, //
    9, 0x21, 0x11, 0x01, 0, 1, 0x22, 29, 0, //
    7, 5, 0x81, 3, 64, 0, 1, //
    7, 5, 0x01, 3, 64, 0, 1,
];

pub static REPORT: [u8; 29] = [
    0x06, 0x00, 0xFF, 0x09, 0x01, 0xA1, 0x01, 0x19, 0x01, 0x29, 0x40, 0x15, 0x00, 0x26, 0xFF,
    0x00, 0x75, 0x08, 0x95, 0x40, 0x81, 0x00, 0x19, 0x01, 0x29, 0x40, 0x91, 0x00, 0xC0,
];

static LANGUAGES: [u8; 4] = [4, 3, 0x09, 0x04];
static MANUFACTURER: [u8; 6] = [6, 3, b'b', 0, b'd', 0];

static CONFIGURATIONS: [&[u8]; 1] = [&CONFIGURATION];
static STRINGS: [&[u8]; 2] = [&LANGUAGES, &MANUFACTURER];

pub static DESCRIPTORS: Descriptors = Descriptors::new(&DEVICE, &CONFIGURATIONS, &STRINGS);

/// Options of an interrupt endpoint pair.
pub fn interrupt() -> EndpointOptions {
    EndpointOptions::IN | EndpointOptions::OUT | EndpointOptions::HANDSHAKE | EndpointOptions::DISALLOW_SETUP
}

/// A SETUP packet.
pub fn request(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    let [v0, v1] = value.to_le_bytes();
    let [i0, i1] = index.to_le_bytes();
    let [l0, l1] = length.to_le_bytes();
    [request_type, request, v0, v1, i0, i1, l0, l1]
}

/// Remembers what the device asked of the controller.
#[derive(Debug, Default)]
pub struct Recorder {
    pub controls: [EndpointOptions; MAX_ENDPOINTS],
    pub addresses: Vec<u8>,
    pub resumed: usize,
    pub wakeups: usize,
}

impl Controller for Recorder {
    fn set_endpoint_control(&mut self, ep: u8, options: EndpointOptions) {
        self.controls[ep as usize] = options;
    }
    fn set_address(&mut self, address: u8) {
        self.addresses.push(address);
    }
    fn resume_token_processing(&mut self) {
        self.resumed += 1;
    }
    fn signal_resume(&mut self) {
        self.wakeups += 1;
    }
}

/// What the host saw in response to a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Data(Toggle, Vec<u8>),
    Ack,
    Nak,
    Stall,
}

/// Anything that takes notifications.
pub trait Service {
    fn service(&mut self, notification: Notification);
}

impl<P: Controller, C: EventHandler, A: EventHandler> Service for UsbDevice<'_, P, C, A> {
    fn service(&mut self, notification: Notification) {
        UsbDevice::service(self, notification)
    }
}

fn pair_index(address: EndpointAddress) -> usize {
    address.index() * 2 + (address.direction() == UsbDirection::In) as usize
}

pub struct Host<'t> {
    sie: Sie<'t>,
    max_packet: usize,
    /// The bank the engine uses next, per endpoint direction.
    next: [Bank; MAX_ENDPOINTS * 2],
}

impl<'t> Host<'t> {
    pub fn new(sie: Sie<'t>, max_packet: usize) -> Self {
        Host {
            sie,
            max_packet,
            next: [Bank::Even; MAX_ENDPOINTS * 2],
        }
    }

    pub fn attach(&mut self, device: &mut impl Service) {
        device.service(Notification::Attach);
        device.service(Notification::BusActive);
        self.reset(device);
    }

    pub fn reset(&mut self, device: &mut impl Service) {
        self.next = [Bank::Even; MAX_ENDPOINTS * 2];
        device.service(Notification::Reset);
    }

    /// The armed bank that takes the next token, if any.
    fn armed(&self, address: EndpointAddress) -> Option<(Bank, Armed)> {
        let next = self.next[pair_index(address)];
        [next, next.other()]
            .into_iter()
            .find_map(|bank| self.sie.armed(address, bank).map(|armed| (bank, armed)))
    }

    fn transact(&mut self, device: &mut impl Service, token: Token) {
        if self.sie.banks(token.address) == 2 {
            self.next[pair_index(token.address)] = token.bank.other();
        }
        device.service(Notification::Token(token));
    }

    /// SETUP is taken even if the descriptor is stalled.
    pub fn setup(&mut self, device: &mut impl Service, packet: [u8; 8]) -> Reply {
        let address = EndpointAddress::from_parts(0, UsbDirection::Out);
        let Some((bank, _)) = self.armed(address) else {
            return Reply::Nak;
        };
        self.sie.receive(address, bank, &packet);
        let token = Token {
            address,
            bank,
            pid: Pid::Setup,
            toggle: Toggle::Data0,
            count: packet.len(),
            errors: BusErrors::empty(),
        };
        self.transact(device, token);
        Reply::Ack
    }

    pub fn out(&mut self, device: &mut impl Service, ep: u8, data: &[u8], toggle: Toggle) -> Reply {
        self.out_with(device, ep, data, toggle, BusErrors::empty())
    }

    /// An OUT transaction that the engine flagged with `errors`.
    pub fn out_with(
        &mut self,
        device: &mut impl Service,
        ep: u8,
        data: &[u8],
        toggle: Toggle,
        errors: BusErrors,
    ) -> Reply {
        let address = EndpointAddress::from_parts(ep as usize, UsbDirection::Out);
        let Some((bank, armed)) = self.armed(address) else {
            return Reply::Nak;
        };
        if armed.stall {
            return Reply::Stall;
        }
        self.sie.receive(address, bank, data);
        let token = Token {
            address,
            bank,
            pid: Pid::Out,
            toggle,
            count: data.len(),
            errors,
        };
        self.transact(device, token);
        Reply::Ack
    }

    pub fn in_(&mut self, device: &mut impl Service, ep: u8) -> Reply {
        let address = EndpointAddress::from_parts(ep as usize, UsbDirection::In);
        let Some((bank, armed)) = self.armed(address) else {
            return Reply::Nak;
        };
        if armed.stall {
            return Reply::Stall;
        }
        let mut packet = [0; MAX_PACKET_SIZE];
        let len = self.sie.transmit(address, bank, &mut packet).unwrap_or(0);
        let token = Token {
            address,
            bank,
            pid: Pid::In,
            toggle: armed.toggle,
            count: len,
            errors: BusErrors::empty(),
        };
        self.transact(device, token);
        Reply::Data(armed.toggle, packet[..len].to_vec())
    }

    /// The IN status stage of a control write.
    pub fn status_in(&mut self, device: &mut impl Service) -> Reply {
        match self.in_(device, 0) {
            Reply::Data(Toggle::Data1, data) if data.is_empty() => Reply::Ack,
            reply => reply,
        }
    }

    /// A complete control read
    ///
    /// Returns the data, or the reply that ended the transfer.
    pub fn control_read(&mut self, device: &mut impl Service, setup: [u8; 8]) -> Result<Vec<u8>, Reply> {
        match self.setup(device, setup) {
            Reply::Ack => {}
            reply => return Err(reply),
        }
        let length = u16::from_le_bytes([setup[6], setup[7]]) as usize;
        let mut data = Vec::new();
        loop {
            match self.in_(device, 0) {
                Reply::Data(_, packet) => {
                    let short = packet.len() < self.max_packet;
                    data.extend(packet);
                    if short || data.len() >= length {
                        break;
                    }
                }
                reply => return Err(reply),
            }
        }
        match self.out(device, 0, &[], Toggle::Data1) {
            Reply::Ack => Ok(data),
            reply => Err(reply),
        }
    }

    /// A complete control write, or a request without data
    ///
    /// Returns the reply to the status stage, or the reply that ended the
    /// transfer.
    pub fn control_write(&mut self, device: &mut impl Service, setup: [u8; 8], data: &[u8]) -> Reply {
        match self.setup(device, setup) {
            Reply::Ack => {}
            reply => return reply,
        }
        let mut toggle = Toggle::Data1;
        for chunk in data.chunks(self.max_packet) {
            match self.out(device, 0, chunk, toggle) {
                Reply::Ack => toggle = toggle.flip(),
                reply => return reply,
            }
        }
        self.status_in(device)
    }
}

/// What [`App`] saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Attach,
    Detach,
    Reset,
    Suspend,
    Resume,
    Configured(u8),
    Hold(u8),
    Alternate(u8, u8),
    SetDescriptor,
    OutData(Vec<u8>),
    Complete(Handle),
    Terminated(Handle),
    Tick,
}

/// An application layer that answers vendor requests, and records events
#[derive(Debug, Default)]
pub struct App {
    pub seen: Vec<Seen>,
    /// Answer to vendor and class IN requests.
    pub reply: Option<Vec<u8>>,
    pub options: SendOptions,
    pub defer_in: bool,
    pub defer_out: bool,
    pub defer_status: bool,
    /// Cancel every request after claiming it.
    pub cancel: bool,
    /// Claim `HoldBeforeConfiguration`.
    pub hold: bool,
}

impl App {
    fn request(&mut self, request: &Request, usb: &mut Stack<'_>) -> bool {
        if !matches!(request.request_type, RequestType::Vendor | RequestType::Class) {
            return false;
        }
        let claimed = match request.direction {
            UsbDirection::In if self.defer_in => usb.defer_in_data_stage().is_ok(),
            UsbDirection::In => match &self.reply {
                Some(reply) => usb.send(reply, self.options).is_ok(),
                None => false,
            },
            UsbDirection::Out => {
                if self.defer_status {
                    usb.defer_status_stage().unwrap();
                }
                if self.defer_out {
                    usb.defer_out_data_stage().is_ok()
                } else if request.length > 0 {
                    usb.receive(request.length as usize).is_ok()
                } else {
                    true
                }
            }
        };
        if claimed && self.cancel {
            usb.cancel_control().unwrap();
        }
        claimed
    }
}

impl EventHandler for App {
    fn handle(&mut self, event: &Event<'_>, usb: &mut Stack<'_>) -> bool {
        let seen = match *event {
            Event::ControlRequest(request) => return self.request(request, usb),
            Event::Attach => Seen::Attach,
            Event::Detach => Seen::Detach,
            Event::Reset => Seen::Reset,
            Event::Suspend => Seen::Suspend,
            Event::Resume => Seen::Resume,
            Event::Configured(configuration) => Seen::Configured(configuration),
            Event::HoldBeforeConfiguration(configuration) => {
                self.seen.push(Seen::Hold(configuration));
                return self.hold;
            }
            Event::AlternateInterface { interface, alternate } => Seen::Alternate(interface, alternate),
            Event::SetDescriptor(_) => Seen::SetDescriptor,
            Event::ControlOutComplete { data, .. } => {
                self.seen.push(Seen::OutData(data.to_vec()));
                return true;
            }
            Event::TransferComplete(handle) => Seen::Complete(handle),
            Event::TransferTerminated(handle) => Seen::Terminated(handle),
            Event::Tick => Seen::Tick,
            Event::TransferError { .. } | Event::Stall | Event::BusError(_) => return false,
        };
        self.seen.push(seen);
        false
    }
}
