//! Standard requests
//!
//! The core layer of the handler chain. It answers the chapter 9 requests
//! that every device supports, and leaves everything else to the class and
//! application layers.

use usb_device::{
    control::{Recipient, Request, RequestType},
    endpoint::EndpointAddress,
    UsbDirection,
};

use crate::{
    control::SendOptions,
    descriptors::descriptor_type,
    enumeration::DeviceState,
    event::{Event, EventHandler},
    stack::{Stack, MAX_INTERFACES},
};

pub(crate) struct StandardRequests;

impl EventHandler for StandardRequests {
    fn handle(&mut self, event: &Event<'_>, usb: &mut Stack<'_>) -> bool {
        match event {
            Event::ControlRequest(request) if request.request_type == RequestType::Standard => {
                standard(request, usb)
            }
            _ => false,
        }
    }
}

/// The only `wLength` a request may carry, if it's fixed.
fn fixed_length(request: &Request) -> Option<u16> {
    match (request.direction, request.request) {
        (UsbDirection::Out, Request::SET_ADDRESS)
        | (UsbDirection::Out, Request::SET_CONFIGURATION)
        | (UsbDirection::Out, Request::SET_INTERFACE)
        | (UsbDirection::Out, Request::CLEAR_FEATURE)
        | (UsbDirection::Out, Request::SET_FEATURE) => Some(0),
        (UsbDirection::In, Request::GET_CONFIGURATION)
        | (UsbDirection::In, Request::GET_INTERFACE) => Some(1),
        (UsbDirection::In, Request::GET_STATUS) => Some(2),
        _ => None,
    }
}

fn standard(request: &Request, usb: &mut Stack<'_>) -> bool {
    use UsbDirection::{In, Out};
    if fixed_length(request).map_or(false, |length| length != request.length) {
        warn!("MALFORMED REQUEST {:?}", request);
        return false;
    }
    match (request.direction, request.recipient, request.request) {
        (In, Recipient::Device, Request::GET_DESCRIPTOR) => get_descriptor(request, usb),
        (In, _, Request::GET_STATUS) => get_status(request, usb),
        (In, Recipient::Device, Request::GET_CONFIGURATION) => {
            let configuration = usb.configuration();
            usb.send(&[configuration], SendOptions::empty()).is_ok()
        }
        (In, Recipient::Interface, Request::GET_INTERFACE) => get_interface(request, usb),
        (Out, Recipient::Device, Request::SET_ADDRESS) => {
            let accepted = u8::try_from(request.value)
                .map_or(false, |address| usb.device.request_address(address));
            if accepted {
                debug!("SET_ADDRESS {}", request.value);
            }
            accepted
        }
        (Out, Recipient::Device, Request::SET_CONFIGURATION) => set_configuration(request, usb),
        (Out, Recipient::Interface, Request::SET_INTERFACE) => set_interface(request, usb),
        (Out, _, Request::CLEAR_FEATURE) => feature(request, usb, false),
        (Out, _, Request::SET_FEATURE) => feature(request, usb, true),
        _ => false,
    }
}

fn get_descriptor(request: &Request, usb: &mut Stack<'_>) -> bool {
    let (kind, index) = request.descriptor_type_index();
    let descriptor = match kind {
        descriptor_type::DEVICE => Some(usb.descriptors.device),
        descriptor_type::CONFIGURATION => usb.descriptors.configuration(index),
        descriptor_type::STRING => usb.descriptors.string(index),
        // Full speed only; DEVICE_QUALIFIER is stalled.
        _ => None,
    };
    descriptor.map_or(false, |descriptor| {
        usb.send_static(descriptor, SendOptions::INCLUDE_ZERO).is_ok()
    })
}

fn get_status(request: &Request, usb: &mut Stack<'_>) -> bool {
    let status: u16 = match request.recipient {
        Recipient::Device => {
            usb.config.self_powered as u16 | (usb.remote_wakeup as u16) << 1
        }
        Recipient::Interface if has_interface(request, usb) => 0,
        Recipient::Endpoint => {
            let address = EndpointAddress::from(request.index as u8);
            if address.index() != 0 && usb.state() != DeviceState::Configured {
                return false;
            }
            match usb.endpoints.next_handle(address) {
                Some(_) => usb.is_halted(address) as u16,
                None => return false,
            }
        }
        _ => return false,
    };
    usb.send(&status.to_le_bytes(), SendOptions::empty()).is_ok()
}

/// Indicates if the request addresses an interface of the active
/// configuration.
fn has_interface(request: &Request, usb: &Stack<'_>) -> bool {
    usb.state() == DeviceState::Configured
        && request.index < usb.descriptors.interface_count(usb.configuration()) as u16
        && (request.index as usize) < MAX_INTERFACES
}

fn get_interface(request: &Request, usb: &mut Stack<'_>) -> bool {
    if !has_interface(request, usb) {
        return false;
    }
    let alternate = usb.alternates[request.index as usize];
    usb.send(&[alternate], SendOptions::empty()).is_ok()
}

fn set_interface(request: &Request, usb: &mut Stack<'_>) -> bool {
    if !has_interface(request, usb) {
        return false;
    }
    let interface = request.index as u8;
    let alternate = request.value as u8;
    usb.alternates[interface as usize] = alternate;
    usb.pending.alternate = Some((interface, alternate));
    true
}

fn set_configuration(request: &Request, usb: &mut Stack<'_>) -> bool {
    let value = request.value as u8;
    if !usb.device.can_configure() || (value != 0 && !usb.descriptors.has_configuration(value)) {
        return false;
    }
    debug!("SET_CONFIGURATION {}", value);
    usb.pending.configuration = Some(value);
    true
}

fn feature(request: &Request, usb: &mut Stack<'_>, set: bool) -> bool {
    match request.recipient {
        Recipient::Device if request.value == Request::FEATURE_DEVICE_REMOTE_WAKEUP => {
            usb.remote_wakeup = set;
            true
        }
        Recipient::Endpoint if request.value == Request::FEATURE_ENDPOINT_HALT => {
            let address = EndpointAddress::from(request.index as u8);
            if address.index() == 0 {
                // The control endpoint never stays halted.
                return true;
            }
            if usb.state() != DeviceState::Configured || usb.endpoints.next_handle(address).is_none() {
                return false;
            }
            let eps = usb.endpoints;
            if set {
                eps.stall(address).is_ok()
            } else {
                eps.clear_stall(address).is_ok()
            }
        }
        _ => false,
    }
}
