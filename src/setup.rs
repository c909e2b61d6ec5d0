//! SETUP packet decoding

use usb_device::{
    control::{Recipient, Request, RequestType},
    UsbDirection, UsbError,
};

/// Size of a SETUP packet.
pub const SETUP_LEN: usize = 8;

/// Decode a SETUP packet
///
/// Returns `ParseError` if the packet isn't exactly eight bytes.
pub fn parse(packet: &[u8]) -> Result<Request, UsbError> {
    let packet: &[u8; SETUP_LEN] = packet.try_into().map_err(|_| UsbError::ParseError)?;
    let bm_request_type = packet[0];

    let direction = if bm_request_type & 0x80 != 0 {
        UsbDirection::In
    } else {
        UsbDirection::Out
    };
    let request_type = match (bm_request_type >> 5) & 0b11 {
        0 => RequestType::Standard,
        1 => RequestType::Class,
        2 => RequestType::Vendor,
        _ => RequestType::Reserved,
    };
    let recipient = match bm_request_type & 0b1_1111 {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        3 => Recipient::Other,
        _ => Recipient::Reserved,
    };

    Ok(Request {
        direction,
        request_type,
        recipient,
        request: packet[1],
        value: u16::from_le_bytes([packet[2], packet[3]]),
        index: u16::from_le_bytes([packet[4], packet[5]]),
        length: u16::from_le_bytes([packet[6], packet[7]]),
    })
}
