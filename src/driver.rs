//! USB device driver
//!
//! [`UsbDevice`] is the one context that owns the control transfer, the
//! device state, and the handler chain. Every hardware notification enters
//! through [`UsbDevice::service`].

use usb_device::{
    control::{Recipient, Request, RequestType},
    UsbDirection, UsbError,
};

use crate::{
    bd::BusErrors,
    config::{Config, Speed},
    control::{Progress, CONTROL_BUFFER_SIZE},
    descriptors::Descriptors,
    endpoint::{Completion, Handle, Outcome, Pid, Token, MAX_ENDPOINTS},
    enumeration::DeviceState,
    event::{self, Event, EventHandler, Layer},
    stack::{Stack, MAX_INTERFACES},
    standard::StandardRequests,
    state::DescriptorTable,
    Controller,
};

/// Something the hardware reported
///
/// The HAL translates its interrupt flags into notifications, and hands
/// them to [`UsbDevice::service`] in the order they happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// VBUS appeared.
    Attach,
    /// Bus activity while attached.
    BusActive,
    Detach,
    /// The host signaled a bus reset.
    Reset,
    /// The bus went idle; suspend.
    Idle,
    Resume,
    StartOfFrame,
    /// An application tick, counted when [`Speed::Low`] is configured.
    Tick,
    /// The controller sent a STALL handshake.
    Stall,
    Error(BusErrors),
    /// The serial interface engine finished a transaction.
    Token(Token),
}

/// A USB device
///
/// `C` is the class layer, and `A` is the application layer, of the
/// handler chain. Either may be `()`.
pub struct UsbDevice<'a, P, C = (), A = ()> {
    controller: P,
    stack: Stack<'a>,
    core: StandardRequests,
    class: C,
    application: A,
}

impl<'a, P: Controller, C: EventHandler, A: EventHandler> UsbDevice<'a, P, C, A> {
    /// Create a device that uses `table`
    ///
    /// The device starts detached, and waits for [`Notification::Attach`].
    ///
    /// # Panics
    ///
    /// Panics if `table` already backs another device, or if `config`
    /// isn't supported.
    pub fn new<const COUNT: usize>(
        controller: P,
        table: &'a DescriptorTable<COUNT>,
        config: Config,
        descriptors: Descriptors,
        class: C,
        application: A,
    ) -> Self {
        assert!(config.is_valid(), "Unsupported device configuration");
        let Some(endpoints) = table.take() else {
            panic!("Descriptor table already assigned to a device");
        };
        endpoints.configure(config.ping_pong, config.ep0_max_packet_size);
        endpoints.take_terminated();

        let mut device = UsbDevice {
            controller,
            stack: Stack::new(endpoints, config, descriptors),
            core: StandardRequests,
            class,
            application,
        };
        device.flush();
        device
    }

    /// Handle a notification
    ///
    /// Call this from the USB interrupt, or poll it at least every
    /// [`MAX_POLL_INTERVAL_US`](crate::MAX_POLL_INTERVAL_US).
    pub fn service(&mut self, notification: Notification) {
        match notification {
            Notification::Attach => {
                self.stack.device.attach();
                self.dispatch(&Event::Attach);
            }
            Notification::BusActive => self.stack.device.powered(),
            Notification::Detach => self.detach(),
            Notification::Reset => self.bus_reset(),
            Notification::Idle => {
                if self.stack.state() >= DeviceState::Default && !self.stack.is_suspended() {
                    debug!("SUSPEND");
                    self.stack.device.suspend();
                    self.dispatch(&Event::Suspend);
                }
            }
            Notification::Resume => {
                if self.stack.is_suspended() {
                    debug!("RESUME");
                    self.stack.device.resume();
                    self.dispatch(&Event::Resume);
                }
            }
            Notification::StartOfFrame if self.stack.config.speed == Speed::Full => self.tick(),
            Notification::Tick if self.stack.config.speed == Speed::Low => self.tick(),
            Notification::StartOfFrame | Notification::Tick => {}
            Notification::Stall => {
                self.dispatch(&Event::Stall);
            }
            Notification::Error(errors) => {
                warn!("BUS ERROR {:#x}", errors.bits());
                self.dispatch(&Event::BusError(errors));
            }
            Notification::Token(token) => self.token(&token),
        }
        self.drain_terminated();
        self.flush();
    }

    /// Apply the configuration held by a
    /// [`HoldBeforeConfiguration`](Event::HoldBeforeConfiguration) claim,
    /// then finish the SET_CONFIGURATION status stage
    ///
    /// Returns `InvalidState` if nothing is held.
    pub fn release_configuration(&mut self) -> Result<(), UsbError> {
        let configuration = self.stack.pending.held.take().ok_or(UsbError::InvalidState)?;
        self.configure(configuration);
        let allowed = self.stack.control.allow_status_stage(self.stack.endpoints);
        self.drain_terminated();
        self.flush();
        allowed
    }

    /// Wake the host from suspend
    ///
    /// Allowed only while the bus is suspended, and only after the host
    /// enabled remote wakeup. Otherwise returns `InvalidState`. The device
    /// stays suspended until the controller reports
    /// [`Resume`](Notification::Resume).
    pub fn remote_wakeup(&mut self) -> Result<(), UsbError> {
        if !self.stack.is_suspended() || !self.stack.remote_wakeup_enabled() {
            return Err(UsbError::InvalidState);
        }
        debug!("REMOTE WAKEUP");
        self.controller.signal_resume();
        Ok(())
    }

    pub fn stack(&self) -> &Stack<'a> {
        &self.stack
    }

    /// Use this to allow deferred stages from outside of an event.
    pub fn stack_mut(&mut self) -> &mut Stack<'a> {
        &mut self.stack
    }

    pub fn class(&self) -> &C {
        &self.class
    }

    pub fn class_mut(&mut self) -> &mut C {
        &mut self.class
    }

    pub fn application(&self) -> &A {
        &self.application
    }

    pub fn application_mut(&mut self) -> &mut A {
        &mut self.application
    }

    pub fn controller(&self) -> &P {
        &self.controller
    }

    fn dispatch(&mut self, event: &Event<'_>) -> Option<Layer> {
        let Self {
            stack,
            core,
            class,
            application,
            ..
        } = self;
        let layers: [&mut dyn EventHandler; 3] = [core, class, application];
        event::dispatch(layers, event, stack)
    }

    fn token(&mut self, token: &Token) {
        if self.stack.state() < DeviceState::Default {
            warn!("TOKEN BEFORE RESET {:?}", token);
            return;
        }
        let (handle, completion) = match self.stack.endpoints.complete(token) {
            Ok(done) => done,
            Err(error) => {
                warn!("UNEXPECTED TOKEN {:?} {:?}", token, error);
                return;
            }
        };
        trace!("TOKEN {:?} {:?}", token, completion);

        if token.address.index() == 0 {
            self.control(token, handle, completion);
            return;
        }
        match completion.outcome {
            Outcome::Complete => self.dispatch(&Event::TransferComplete(handle)),
            outcome => self.dispatch(&Event::TransferError { handle, outcome }),
        };
    }

    fn control(&mut self, token: &Token, handle: Handle, completion: Completion) {
        let eps = self.stack.endpoints;
        let progress = match (token.address.direction(), token.pid) {
            (UsbDirection::Out, Pid::Setup) => {
                self.setup(handle, completion);
                return;
            }
            (UsbDirection::Out, _) => self.stack.control.on_out_complete(eps, handle, completion),
            (UsbDirection::In, _) => self.stack.control.on_in_complete(eps, completion),
        };
        match progress {
            Progress::DataReceived => self.data_received(),
            Progress::StatusComplete => {
                if let Some(address) = self.stack.device.commit_address() {
                    debug!("ADDRESS {}", address);
                    self.controller.set_address(address);
                }
            }
            Progress::Abandoned | Progress::None => {}
        }
    }

    fn setup(&mut self, handle: Handle, completion: Completion) {
        let eps = self.stack.endpoints;
        // A SETUP here means the host gave up on whatever came before.
        self.stack.device.revert_address();
        if let Some(configuration) = self.stack.pending.held.take() {
            warn!("HELD CONFIGURATION {} DROPPED", configuration);
        }

        if let Some(request) = self.stack.control.on_setup(eps, handle, completion) {
            trace!("SETUP {:?}", request);
            let set_descriptor = request.request_type == RequestType::Standard
                && request.recipient == Recipient::Device
                && request.direction == UsbDirection::Out
                && request.request == Request::SET_DESCRIPTOR;
            let event = if set_descriptor {
                Event::SetDescriptor(&request)
            } else {
                Event::ControlRequest(&request)
            };
            let claimed = self.dispatch(&event).is_some();
            self.apply_standard();
            self.stack.control.finish_setup(eps, claimed);
        }
        self.controller.resume_token_processing();
    }

    /// Carry out what the core layer accepted.
    fn apply_standard(&mut self) {
        if let Some((interface, alternate)) = self.stack.pending.alternate.take() {
            self.dispatch(&Event::AlternateInterface { interface, alternate });
        }
        if let Some(configuration) = self.stack.pending.configuration.take() {
            if self
                .dispatch(&Event::HoldBeforeConfiguration(configuration))
                .is_some()
            {
                debug!("HOLD CONFIGURATION {}", configuration);
                self.stack.pending.held = Some(configuration);
                if let Err(error) = self.stack.control.defer_status_stage() {
                    warn!("CONFIGURATION STATUS NOT DEFERRED {:?}", error);
                }
            } else {
                self.configure(configuration);
            }
        }
    }

    fn configure(&mut self, configuration: u8) {
        let eps = self.stack.endpoints;
        for ep in 1..eps.endpoint_count() {
            eps.disable_endpoint(ep as u8);
        }
        self.stack.alternates = [0; MAX_INTERFACES];
        self.stack.device.configure(configuration);
        self.drain_terminated();
        if configuration != 0 {
            self.dispatch(&Event::Configured(configuration));
        }
    }

    fn data_received(&mut self) {
        let Some(request) = self.stack.control.setup() else {
            return;
        };
        let mut data = [0; CONTROL_BUFFER_SIZE];
        let received = self.stack.control.received();
        let len = received.len();
        data[..len].copy_from_slice(received);
        self.dispatch(&Event::ControlOutComplete {
            request: &request,
            data: &data[..len],
        });
        self.stack.control.finish_data_out(self.stack.endpoints);
    }

    fn tick(&mut self) {
        self.stack.tick();
        if self.stack.control.tick(self.stack.endpoints) {
            if let Some(configuration) = self.stack.pending.held.take() {
                self.configure(configuration);
            }
        }
        self.dispatch(&Event::Tick);
    }

    fn bus_reset(&mut self) {
        if !self.stack.device.reset() {
            warn!("RESET WHILE DETACHED");
            return;
        }
        debug!("BUS RESET");
        let eps = self.stack.endpoints;
        eps.reset();
        self.stack.reset();
        self.controller.set_address(0);
        self.stack.control.arm_for_setup(eps);
        self.dispatch(&Event::Reset);
        self.drain_terminated();
    }

    fn detach(&mut self) {
        debug!("DETACH");
        self.stack.endpoints.reset();
        self.stack.reset();
        self.stack.device.detach();
        self.dispatch(&Event::Detach);
        self.drain_terminated();
    }

    /// Report every terminated transfer, once.
    fn drain_terminated(&mut self) {
        loop {
            let mut terminated = self.stack.endpoints.take_terminated();
            if terminated == 0 {
                break;
            }
            while terminated != 0 {
                let index = terminated.trailing_zeros() as usize;
                terminated &= terminated - 1;
                self.dispatch(&Event::TransferTerminated(Handle::new(index)));
            }
        }
    }

    /// Hand changed endpoint control values to the controller.
    fn flush(&mut self) {
        let dirty = self.stack.endpoints.take_dirty();
        for ep in 0..MAX_ENDPOINTS as u8 {
            if dirty & (1 << ep) != 0 {
                let options = self.stack.endpoints.options(ep);
                self.controller.set_endpoint_control(ep, options);
            }
        }
    }
}
