//! The device, as event handlers see it

use usb_device::{control::Request, endpoint::EndpointAddress, UsbError};

use crate::{
    config::Config,
    control::{Control, SendOptions, Stage},
    descriptors::Descriptors,
    endpoint::Endpoints,
    enumeration::{DeviceState, Tracker},
};

/// Most interfaces that SET_INTERFACE can address.
pub const MAX_INTERFACES: usize = 16;

/// Standard request side effects, applied once the request's dispatch
/// finishes.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    pub(crate) configuration: Option<u8>,
    pub(crate) alternate: Option<(u8, u8)>,
    /// Configuration held by the application.
    pub(crate) held: Option<u8>,
}

/// Device services for event handlers
///
/// Handlers receive a `Stack` with every event. Use it to answer control
/// requests, steer the control transfer stages, and reach the endpoints.
///
/// The control transfer methods are only valid in certain stages. They
/// return `InvalidState` otherwise.
pub struct Stack<'a> {
    pub(crate) endpoints: Endpoints<'a>,
    pub(crate) control: Control,
    pub(crate) device: Tracker,
    pub(crate) config: Config,
    pub(crate) descriptors: Descriptors,
    pub(crate) alternates: [u8; MAX_INTERFACES],
    pub(crate) remote_wakeup: bool,
    pub(crate) pending: Pending,
    ticks: u32,
}

impl<'a> Stack<'a> {
    pub(crate) fn new(endpoints: Endpoints<'a>, config: Config, descriptors: Descriptors) -> Self {
        Stack {
            endpoints,
            control: Control::new(config.ep0_max_packet_size, config.status_stage_timeout),
            device: Tracker::new(),
            config,
            descriptors,
            alternates: [0; MAX_INTERFACES],
            remote_wakeup: false,
            pending: Pending::default(),
            ticks: 0,
        }
    }

    /// Forget everything configured by the host.
    pub(crate) fn reset(&mut self) {
        self.control.reset();
        self.alternates = [0; MAX_INTERFACES];
        self.remote_wakeup = false;
        self.pending = Pending::default();
    }

    pub(crate) fn tick(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);
    }

    pub fn endpoints(&self) -> Endpoints<'a> {
        self.endpoints
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn descriptors(&self) -> &Descriptors {
        &self.descriptors
    }

    pub fn state(&self) -> DeviceState {
        self.device.state()
    }

    pub fn is_suspended(&self) -> bool {
        self.device.is_suspended()
    }

    /// The address the device responds to.
    pub fn address(&self) -> u8 {
        self.device.address()
    }

    /// The active configuration value, or zero.
    pub fn configuration(&self) -> u8 {
        self.device.configuration()
    }

    /// The alternate setting selected for an interface.
    pub fn alternate_setting(&self, interface: u8) -> Option<u8> {
        self.alternates.get(interface as usize).copied()
    }

    pub fn remote_wakeup_enabled(&self) -> bool {
        self.remote_wakeup
    }

    /// Ticks seen since the device was created. Wraps.
    pub fn tick_count(&self) -> u32 {
        self.ticks
    }

    /// The SETUP packet of the current control transfer.
    pub fn setup(&self) -> Option<Request> {
        self.control.setup()
    }

    pub fn control_stage(&self) -> Stage {
        self.control.stage()
    }

    /// Indicates if an endpoint direction is halted.
    pub fn is_halted(&self, address: EndpointAddress) -> bool {
        address.index() != 0 && self.endpoints.is_stalled(address)
    }

    /// Answer a control IN request with a copy of `data`
    ///
    /// Data beyond the request's `wLength` is dropped. Returns
    /// `BufferOverflow` if `data` exceeds
    /// [`CONTROL_BUFFER_SIZE`](crate::CONTROL_BUFFER_SIZE).
    pub fn send(&mut self, data: &[u8], options: SendOptions) -> Result<(), UsbError> {
        self.control.send(data, options)
    }

    /// Answer a control IN request with static data, of any length.
    pub fn send_static(&mut self, data: &'static [u8], options: SendOptions) -> Result<(), UsbError> {
        self.control.send_static(data, options)
    }

    /// Accept the data stage of a control OUT request
    ///
    /// The data arrives with [`Event::ControlOutComplete`](crate::Event::ControlOutComplete).
    pub fn receive(&mut self, len: usize) -> Result<(), UsbError> {
        self.control.receive(len)
    }

    /// NAK the IN data stage until [`allow_data_stage`](Self::allow_data_stage).
    pub fn defer_in_data_stage(&mut self) -> Result<(), UsbError> {
        self.control.defer_in_data_stage()
    }

    /// NAK the OUT data stage until [`allow_data_stage`](Self::allow_data_stage).
    pub fn defer_out_data_stage(&mut self) -> Result<(), UsbError> {
        self.control.defer_out_data_stage()
    }

    /// NAK the status stage until [`allow_status_stage`](Self::allow_status_stage).
    pub fn defer_status_stage(&mut self) -> Result<(), UsbError> {
        self.control.defer_status_stage()
    }

    /// Start a deferred data stage
    ///
    /// For IN, load the data with [`send`](Self::send) first. For OUT,
    /// [`receive`](Self::receive) is optional; the request's `wLength`
    /// is used otherwise.
    pub fn allow_data_stage(&mut self) -> Result<(), UsbError> {
        self.control.allow_data_stage(self.endpoints)
    }

    /// Start a deferred status stage.
    pub fn allow_status_stage(&mut self) -> Result<(), UsbError> {
        self.control.allow_status_stage(self.endpoints)
    }

    /// Drop the request being dispatched, even if another handler claimed
    /// it. The request is stalled.
    pub fn cancel_control(&mut self) -> Result<(), UsbError> {
        self.control.cancel()
    }

    #[cfg(test)]
    pub(crate) fn for_test(endpoints: Endpoints<'a>) -> Self {
        Stack::new(endpoints, Config::new(), Descriptors::new(&[], &[], &[]))
    }
}
