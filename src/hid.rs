//! Vendor defined HID class
//!
//! [`CustomHid`] is a class layer for the handler chain. It answers the
//! HID requests addressed to its interface, and moves reports one packet
//! at a time on its interrupt endpoint. GET_REPORT and SET_REPORT are left
//! to the application layer, which may defer them.

use usb_device::{
    control::{Recipient, Request, RequestType},
    endpoint::EndpointAddress,
    UsbDirection, UsbError,
};

use crate::{
    control::SendOptions,
    descriptors::descriptor_type,
    endpoint::{Completion, EndpointOptions, Endpoints, Handle, Transfer},
    enumeration::DeviceState,
    event::{Event, EventHandler},
    stack::Stack,
};

/// HID class requests
pub mod request {
    pub const GET_REPORT: u8 = 0x01;
    pub const GET_IDLE: u8 = 0x02;
    pub const GET_PROTOCOL: u8 = 0x03;
    pub const SET_REPORT: u8 = 0x09;
    pub const SET_IDLE: u8 = 0x0A;
    pub const SET_PROTOCOL: u8 = 0x0B;
}

pub const BOOT_PROTOCOL: u8 = 0;
pub const REPORT_PROTOCOL: u8 = 1;

/// An idle rate that the host set with SET_IDLE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleChange {
    /// Zero applies to all reports.
    pub report_id: u8,
    /// In units of 4ms. Zero means indefinite.
    pub rate: u8,
}

/// A vendor defined HID interface with one interrupt endpoint pair
///
/// ```no_run
/// use bdt_usbd::{CustomHid, DescriptorTable};
///
/// static TABLE: DescriptorTable<8> = DescriptorTable::new();
/// static HID: [u8; 9] = [9, 0x21, 0x11, 0x01, 0, 1, 0x22, 2, 0];
/// static REPORT: [u8; 2] = [0xC0, 0xC0];
///
/// let hid = CustomHid::new(TABLE.endpoints(), 0, 1, &HID, &REPORT);
/// ```
pub struct CustomHid<'a> {
    endpoints: Endpoints<'a>,
    interface: u8,
    endpoint: u8,
    hid_descriptor: &'static [u8],
    report_descriptor: &'static [u8],
    idle_rate: u8,
    idle_change: Option<IdleChange>,
    protocol: u8,
}

impl<'a> CustomHid<'a> {
    /// `endpoint` carries reports in both directions.
    pub fn new(
        endpoints: Endpoints<'a>,
        interface: u8,
        endpoint: u8,
        hid_descriptor: &'static [u8],
        report_descriptor: &'static [u8],
    ) -> Self {
        CustomHid {
            endpoints,
            interface,
            endpoint,
            hid_descriptor,
            report_descriptor,
            idle_rate: 0,
            idle_change: None,
            protocol: REPORT_PROTOCOL,
        }
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Idle rate set by the host, in units of 4ms. Zero means indefinite.
    pub fn idle_rate(&self) -> u8 {
        self.idle_rate
    }

    /// The latest SET_IDLE since the last call, if any
    ///
    /// Poll this after [`UsbDevice::service`](crate::UsbDevice::service)
    /// to adjust the report schedule.
    pub fn take_idle_change(&mut self) -> Option<IdleChange> {
        self.idle_change.take()
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// Send one report packet to the host.
    pub fn tx_packet(&self, report: &[u8]) -> Result<Handle, UsbError> {
        self.endpoints.arm(self.endpoint, Transfer::In(report), None)
    }

    /// Accept one report packet, up to `len` bytes, from the host.
    pub fn rx_packet(&self, len: usize) -> Result<Handle, UsbError> {
        self.endpoints.arm(self.endpoint, Transfer::Out(len), None)
    }

    pub fn is_busy(&self, handle: Handle) -> bool {
        self.endpoints.is_busy(handle)
    }

    pub fn completion(&self, handle: Handle) -> Option<Completion> {
        self.endpoints.completion(handle)
    }

    /// Copy a received report into `buffer`.
    pub fn read(&self, handle: Handle, buffer: &mut [u8]) -> Result<usize, UsbError> {
        self.endpoints.read(handle, buffer)
    }

    /// The handle that the next `tx_packet` produces, if the endpoint is
    /// enabled.
    pub fn next_tx(&self) -> Option<Handle> {
        let address = EndpointAddress::from_parts(self.endpoint as usize, UsbDirection::In);
        self.endpoints.next_handle(address)
    }

    fn is_mine(&self, request: &Request) -> bool {
        request.recipient == Recipient::Interface && request.index as u8 == self.interface
    }

    fn request(&mut self, request: &Request, usb: &mut Stack<'_>) -> bool {
        match (request.request_type, request.direction, request.request) {
            (RequestType::Standard, UsbDirection::In, Request::GET_DESCRIPTOR) => {
                // Hosts may fetch the report descriptor before configuring.
                let descriptor = match request.descriptor_type_index().0 {
                    descriptor_type::HID if usb.state() == DeviceState::Configured => {
                        self.hid_descriptor
                    }
                    descriptor_type::REPORT => self.report_descriptor,
                    _ => return false,
                };
                usb.send_static(descriptor, SendOptions::INCLUDE_ZERO).is_ok()
            }
            (RequestType::Class, UsbDirection::In, request::GET_IDLE) => {
                usb.send(&[self.idle_rate], SendOptions::empty()).is_ok()
            }
            (RequestType::Class, UsbDirection::Out, request::SET_IDLE) => {
                self.idle_rate = (request.value >> 8) as u8;
                self.idle_change = Some(IdleChange {
                    report_id: request.value as u8,
                    rate: self.idle_rate,
                });
                debug!("HID IDLE {}", self.idle_rate);
                true
            }
            (RequestType::Class, UsbDirection::In, request::GET_PROTOCOL) => {
                usb.send(&[self.protocol], SendOptions::empty()).is_ok()
            }
            (RequestType::Class, UsbDirection::Out, request::SET_PROTOCOL) => {
                self.protocol = request.value as u8;
                true
            }
            _ => false,
        }
    }
}

impl EventHandler for CustomHid<'_> {
    fn handle(&mut self, event: &Event<'_>, usb: &mut Stack<'_>) -> bool {
        match event {
            Event::Reset => {
                self.idle_rate = 0;
                self.idle_change = None;
                self.protocol = REPORT_PROTOCOL;
                false
            }
            Event::Configured(_) => {
                let options = EndpointOptions::IN
                    | EndpointOptions::OUT
                    | EndpointOptions::HANDSHAKE
                    | EndpointOptions::DISALLOW_SETUP;
                if let Err(error) = self.endpoints.enable_endpoint(self.endpoint, options) {
                    warn!("HID EP{} NOT ENABLED {:?}", self.endpoint, error);
                }
                false
            }
            Event::ControlRequest(request) if self.is_mine(request) => self.request(request, usb),
            _ => false,
        }
    }
}
