//! Static descriptor tables

/// Descriptor type codes, the high byte of a GET_DESCRIPTOR `wValue`.
pub mod descriptor_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
    pub const DEVICE_QUALIFIER: u8 = 6;
    pub const HID: u8 = 0x21;
    pub const REPORT: u8 = 0x22;
}

/// Descriptors served by the core layer
///
/// Every descriptor is raw bytes, laid out as the host expects them.
/// Configuration descriptors carry their interface, endpoint, and class
/// descriptors; `wTotalLength` decides how much is sent.
#[derive(Debug, Clone, Copy)]
pub struct Descriptors {
    pub device: &'static [u8],
    /// Indexed by GET_DESCRIPTOR(CONFIGURATION) index.
    pub configurations: &'static [&'static [u8]],
    /// String descriptor zero is the language ID table.
    pub strings: &'static [&'static [u8]],
}

impl Descriptors {
    pub const fn new(
        device: &'static [u8],
        configurations: &'static [&'static [u8]],
        strings: &'static [&'static [u8]],
    ) -> Self {
        Descriptors {
            device,
            configurations,
            strings,
        }
    }

    /// The configuration descriptor set at `index`, trimmed to its total
    /// length.
    pub fn configuration(&self, index: u8) -> Option<&'static [u8]> {
        let descriptor = *self.configurations.get(index as usize)?;
        let total = match descriptor {
            [_, _, lo, hi, ..] => u16::from_le_bytes([*lo, *hi]) as usize,
            _ => descriptor.len(),
        };
        Some(&descriptor[..total.min(descriptor.len())])
    }

    pub fn string(&self, index: u8) -> Option<&'static [u8]> {
        self.strings.get(index as usize).copied()
    }

    /// The configuration descriptor whose `bConfigurationValue` is `value`.
    fn by_value(&self, value: u8) -> Option<&'static [u8]> {
        self.configurations
            .iter()
            .copied()
            .find(|descriptor| descriptor.get(5) == Some(&value))
    }

    pub fn has_configuration(&self, value: u8) -> bool {
        self.by_value(value).is_some()
    }

    /// `bNumInterfaces` of the configuration with value `value`.
    pub fn interface_count(&self, value: u8) -> u8 {
        self.by_value(value)
            .and_then(|descriptor| descriptor.get(4).copied())
            .unwrap_or(0)
    }
}
