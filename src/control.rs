//! Control transfer state machine
//!
//! Drives endpoint 0 through the SETUP, DATA, and STATUS stages. The
//! [`UsbDevice`](crate::UsbDevice) feeds it endpoint 0 completions and
//! dispatches the events it asks for; handlers steer it through
//! [`Stack`](crate::Stack) while a request is being dispatched.

use usb_device::{control::Request, UsbDirection, UsbError};

use crate::{
    endpoint::{control_in, control_out, Completion, Endpoints, Handle, Outcome, Toggle, ToggleMode, Transfer},
    setup::{self, SETUP_LEN},
};

/// Size of the buffers that stage control data.
///
/// This bounds the data that [`Stack::send`](crate::Stack::send) can copy,
/// and the data stage length of control OUT requests.
/// [`Stack::send_static`](crate::Stack::send_static) has no limit.
pub const CONTROL_BUFFER_SIZE: usize = 128;

bitflags::bitflags! {
    /// Options for control IN data
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SendOptions : u8 {
        /// End the data stage with a zero length packet if the data is
        /// shorter than requested, and a multiple of the max packet size.
        const INCLUDE_ZERO = 0x40;
    }
}

/// What the data stage does once dispatch returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPlan {
    Auto,
    DeferIn,
    DeferOut,
}

/// What the status stage does once the data stage ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPlan {
    Auto,
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStage {
    /// Data moves as the host asks for it.
    Active,
    /// The host is NAKed until a handler allows the data stage.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusStage {
    Armed,
    /// The host is NAKed until a handler allows the status stage.
    Deferred,
}

/// Control transfer stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    /// A SETUP packet is being dispatched.
    SetupReceived { data: DataPlan, status: StatusPlan },
    DataIn { data: DataStage, status: StatusPlan },
    DataOut { data: DataStage, status: StatusPlan },
    /// `direction` is the direction of the status packet.
    Status { direction: UsbDirection, status: StatusStage },
}

/// What happened on endpoint 0, for the device to act on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    None,
    /// The OUT data stage finished. The device dispatches the data, then
    /// calls [`Control::finish_data_out`].
    DataReceived,
    /// The status stage finished; the transfer is over.
    StatusComplete,
    /// The transfer ended early because of a bad transaction.
    Abandoned,
}

#[derive(Clone, Copy)]
enum Source {
    Static(&'static [u8]),
    Immediate,
}

struct InPipe {
    source: Source,
    immediate: [u8; CONTROL_BUFFER_SIZE],
    len: usize,
    offset: usize,
    zero_length: bool,
    busy: bool,
}

impl InPipe {
    const fn new() -> Self {
        InPipe {
            source: Source::Immediate,
            immediate: [0; CONTROL_BUFFER_SIZE],
            len: 0,
            offset: 0,
            zero_length: false,
            busy: false,
        }
    }

    fn bytes(&self) -> &[u8] {
        match self.source {
            Source::Static(data) => &data[..self.len],
            Source::Immediate => &self.immediate[..self.len],
        }
    }
}

struct OutPipe {
    data: [u8; CONTROL_BUFFER_SIZE],
    expected: usize,
    received: usize,
    busy: bool,
}

impl OutPipe {
    const fn new() -> Self {
        OutPipe {
            data: [0; CONTROL_BUFFER_SIZE],
            expected: 0,
            received: 0,
            busy: false,
        }
    }
}

pub(crate) struct Control {
    stage: Stage,
    setup: Option<Request>,
    in_pipe: InPipe,
    out_pipe: OutPipe,
    cancelled: bool,
    max_packet: usize,
    timeout: Option<u8>,
    countdown: u8,
}

impl Control {
    pub(crate) const fn new(max_packet: u8, timeout: Option<u8>) -> Self {
        Control {
            stage: Stage::Idle,
            setup: None,
            in_pipe: InPipe::new(),
            out_pipe: OutPipe::new(),
            cancelled: false,
            max_packet: max_packet as usize,
            timeout,
            countdown: 0,
        }
    }

    pub(crate) fn stage(&self) -> Stage {
        self.stage
    }

    /// The SETUP packet of the current (or last) transfer.
    pub(crate) fn setup(&self) -> Option<Request> {
        self.setup
    }

    /// Data received in the OUT data stage.
    pub(crate) fn received(&self) -> &[u8] {
        &self.out_pipe.data[..self.out_pipe.received]
    }

    fn reset_pipes(&mut self) {
        self.in_pipe.busy = false;
        self.in_pipe.len = 0;
        self.in_pipe.offset = 0;
        self.in_pipe.zero_length = false;
        self.out_pipe.busy = false;
        self.out_pipe.expected = 0;
        self.out_pipe.received = 0;
        self.cancelled = false;
    }

    /// Forget the transfer in progress. Endpoint 0 descriptors are left to
    /// the caller.
    pub(crate) fn reset(&mut self) {
        self.reset_pipes();
        self.stage = Stage::Idle;
        self.setup = None;
        self.countdown = 0;
    }

    /// Restart the status stage countdown.
    fn progress(&mut self) {
        self.countdown = self.timeout.unwrap_or(0);
    }

    /// Make sure endpoint 0 OUT can take the next SETUP.
    pub(crate) fn arm_for_setup(&self, eps: Endpoints<'_>) {
        if !eps.is_armed(control_out()) {
            if let Err(error) = eps.prime(
                control_out(),
                Transfer::Out(self.max_packet),
                ToggleMode::Setup,
                false,
            ) {
                warn!("EP0 OUT NOT ARMED {:?}", error);
            }
        }
    }

    /// Stall both directions, ending the transfer
    ///
    /// The next SETUP clears the stall.
    pub(crate) fn stall(&mut self, eps: Endpoints<'_>) {
        debug!("EP0 STALL");
        eps.reclaim(control_in());
        if let Err(error) = eps.prime(control_in(), Transfer::In(&[]), ToggleMode::Setup, true) {
            warn!("EP0 IN STALL {:?}", error);
        }
        if !eps.is_armed(control_out()) {
            if let Err(error) = eps.prime(
                control_out(),
                Transfer::Out(self.max_packet),
                ToggleMode::Setup,
                true,
            ) {
                warn!("EP0 OUT STALL {:?}", error);
            }
        }
        self.reset_pipes();
        self.stage = Stage::Idle;
    }

    /// End the transfer without a stall, and wait for the next SETUP.
    fn abandon(&mut self, eps: Endpoints<'_>) -> Progress {
        warn!("EP0 TRANSFER ABANDONED IN {:?}", self.stage);
        eps.reclaim(control_in());
        self.reset_pipes();
        self.stage = Stage::Idle;
        self.arm_for_setup(eps);
        Progress::Abandoned
    }

    /// A SETUP packet landed in endpoint 0 OUT
    ///
    /// Returns the decoded request, ready for dispatch. Returns `None` if
    /// the packet was bad; the transfer is then stalled or abandoned.
    pub(crate) fn on_setup(
        &mut self,
        eps: Endpoints<'_>,
        handle: Handle,
        completion: Completion,
    ) -> Option<Request> {
        // Anything still queued for the host belongs to an older transfer.
        // This also clears an endpoint 0 stall.
        eps.reclaim(control_in());

        if completion.outcome != Outcome::Complete {
            self.abandon(eps);
            return None;
        }

        let mut packet = [0; SETUP_LEN + 1];
        let request = eps
            .read(handle, &mut packet)
            .and_then(|len| setup::parse(&packet[..len]));
        let request = match request {
            Ok(request) => request,
            Err(error) => {
                warn!("BAD SETUP {:?}", error);
                self.stall(eps);
                return None;
            }
        };

        if self.stage != Stage::Idle {
            debug!("SETUP INTERRUPTS {:?}", self.stage);
        }
        self.reset_pipes();
        self.setup = Some(request);
        self.stage = Stage::SetupReceived {
            data: DataPlan::Auto,
            status: StatusPlan::Auto,
        };
        self.progress();
        Some(request)
    }

    /// Dispatch of the SETUP packet finished; start the next stage.
    ///
    /// `claimed` decides requests without a data stage. Requests with a
    /// data stage need a loaded (or deferred) pipe.
    pub(crate) fn finish_setup(&mut self, eps: Endpoints<'_>, claimed: bool) {
        let Stage::SetupReceived { data, status } = self.stage else {
            return;
        };
        let Some(request) = self.setup else {
            return;
        };
        if self.cancelled {
            debug!("EP0 REQUEST CANCELLED");
            self.stall(eps);
            return;
        }

        let length = request.length as usize;
        match request.direction {
            UsbDirection::In if length > 0 => {
                if data == DataPlan::DeferIn {
                    self.stage = Stage::DataIn {
                        data: DataStage::Deferred,
                        status,
                    };
                } else if self.in_pipe.busy {
                    self.stage = Stage::DataIn {
                        data: DataStage::Active,
                        status,
                    };
                    self.start_in(eps, status);
                } else {
                    self.stall(eps);
                }
            }
            UsbDirection::Out if data == DataPlan::DeferOut => {
                self.stage = Stage::DataOut {
                    data: DataStage::Deferred,
                    status,
                };
            }
            UsbDirection::Out if length > 0 => {
                if self.out_pipe.busy {
                    self.stage = Stage::DataOut {
                        data: DataStage::Active,
                        status,
                    };
                    self.arm_out_data(eps);
                } else {
                    self.stall(eps);
                }
            }
            _ if claimed => {
                self.arm_for_setup(eps);
                self.enter_status(eps, UsbDirection::In, status);
            }
            _ => self.stall(eps),
        }
    }

    fn start_in(&mut self, eps: Endpoints<'_>, status: StatusPlan) {
        self.arm_next_in(eps);
        if status == StatusPlan::Auto {
            // Lets the host end the data stage early.
            self.arm_status(eps, UsbDirection::Out);
        }
    }

    /// Arm the next IN data packet. Returns `false` when there's nothing
    /// left to send.
    fn arm_next_in(&mut self, eps: Endpoints<'_>) -> bool {
        let pipe = &self.in_pipe;
        let remaining = pipe.len - pipe.offset;
        if remaining == 0 && !pipe.zero_length {
            return false;
        }
        let chunk = remaining.min(self.max_packet);
        let packet = &pipe.bytes()[pipe.offset..pipe.offset + chunk];
        if let Err(error) = eps.prime(control_in(), Transfer::In(packet), ToggleMode::Auto, false) {
            warn!("EP0 IN NOT ARMED {:?}", error);
            return false;
        }
        self.in_pipe.offset += chunk;
        if chunk < self.max_packet {
            // A short packet ends the data stage.
            self.in_pipe.zero_length = false;
        }
        true
    }

    fn arm_out_data(&mut self, eps: Endpoints<'_>) {
        if let Err(error) = eps.prime(
            control_out(),
            Transfer::Out(self.max_packet),
            ToggleMode::Auto,
            false,
        ) {
            warn!("EP0 OUT NOT ARMED {:?}", error);
        }
    }

    /// Arm the zero length status packet, always DATA1.
    fn arm_status(&mut self, eps: Endpoints<'_>, direction: UsbDirection) {
        let armed = match direction {
            UsbDirection::In => {
                eps.reclaim(control_in());
                eps.prime(
                    control_in(),
                    Transfer::In(&[]),
                    ToggleMode::Force(Toggle::Data1),
                    false,
                )
            }
            UsbDirection::Out if eps.is_armed(control_out()) => return,
            UsbDirection::Out => eps.prime(
                control_out(),
                Transfer::Out(self.max_packet),
                ToggleMode::Force(Toggle::Data1),
                false,
            ),
        };
        if let Err(error) = armed {
            warn!("EP0 STATUS NOT ARMED {:?}", error);
        }
    }

    fn enter_status(&mut self, eps: Endpoints<'_>, direction: UsbDirection, status: StatusPlan) {
        let status = match status {
            StatusPlan::Auto => {
                self.arm_status(eps, direction);
                StatusStage::Armed
            }
            StatusPlan::Deferred => StatusStage::Deferred,
        };
        self.stage = Stage::Status { direction, status };
    }

    /// An endpoint 0 IN transaction finished.
    pub(crate) fn on_in_complete(&mut self, eps: Endpoints<'_>, completion: Completion) -> Progress {
        if completion.outcome != Outcome::Complete {
            return self.abandon(eps);
        }
        match self.stage {
            Stage::DataIn {
                data: DataStage::Active,
                status,
            } => {
                self.progress();
                if !self.arm_next_in(eps) {
                    self.in_pipe.busy = false;
                    self.stage = Stage::Status {
                        direction: UsbDirection::Out,
                        status: match status {
                            StatusPlan::Auto => StatusStage::Armed,
                            StatusPlan::Deferred => StatusStage::Deferred,
                        },
                    };
                }
                Progress::None
            }
            Stage::Status {
                direction: UsbDirection::In,
                status: StatusStage::Armed,
            } => {
                self.stage = Stage::Idle;
                Progress::StatusComplete
            }
            _ => {
                trace!("EP0 IN IGNORED IN {:?}", self.stage);
                Progress::None
            }
        }
    }

    /// An endpoint 0 OUT data transaction finished.
    pub(crate) fn on_out_complete(
        &mut self,
        eps: Endpoints<'_>,
        handle: Handle,
        completion: Completion,
    ) -> Progress {
        if completion.outcome != Outcome::Complete {
            return self.abandon(eps);
        }
        match self.stage {
            Stage::DataOut {
                data: DataStage::Active,
                ..
            } => {
                self.progress();
                let pipe = &mut self.out_pipe;
                let room = &mut pipe.data[pipe.received..pipe.expected];
                pipe.received += eps.read(handle, room).unwrap_or(0);
                if completion.len < self.max_packet || pipe.received >= pipe.expected {
                    Progress::DataReceived
                } else {
                    self.arm_out_data(eps);
                    Progress::None
                }
            }
            Stage::DataIn { .. }
            | Stage::Status {
                direction: UsbDirection::Out,
                status: StatusStage::Armed,
            } => {
                // Status stage, possibly ending the data stage early.
                eps.reclaim(control_in());
                self.in_pipe.busy = false;
                self.stage = Stage::Idle;
                self.arm_for_setup(eps);
                Progress::StatusComplete
            }
            _ => {
                warn!("EP0 OUT IGNORED IN {:?}", self.stage);
                self.arm_for_setup(eps);
                Progress::None
            }
        }
    }

    /// The received OUT data was dispatched; move on to the status stage.
    pub(crate) fn finish_data_out(&mut self, eps: Endpoints<'_>) {
        if let Stage::DataOut { status, .. } = self.stage {
            self.out_pipe.busy = false;
            self.arm_for_setup(eps);
            self.enter_status(eps, UsbDirection::In, status);
        }
    }

    /// Count one tick
    ///
    /// Returns `true` if the status stage was forced.
    pub(crate) fn tick(&mut self, eps: Endpoints<'_>) -> bool {
        if self.timeout.is_none()
            || matches!(
                self.stage,
                Stage::Idle
                    | Stage::Status {
                        status: StatusStage::Armed,
                        ..
                    }
            )
        {
            return false;
        }
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown == 0 {
            self.force_status(eps);
            true
        } else {
            false
        }
    }

    /// Skip whatever is left of the transfer, and arm the status stage.
    fn force_status(&mut self, eps: Endpoints<'_>) {
        warn!("EP0 STATUS FORCED IN {:?}", self.stage);
        match self.stage {
            Stage::DataIn { .. }
            | Stage::Status {
                direction: UsbDirection::Out,
                ..
            } => {
                eps.reclaim(control_in());
                self.in_pipe.busy = false;
                self.arm_status(eps, UsbDirection::Out);
                self.stage = Stage::Status {
                    direction: UsbDirection::Out,
                    status: StatusStage::Armed,
                };
            }
            Stage::SetupReceived { .. }
            | Stage::DataOut { .. }
            | Stage::Status {
                direction: UsbDirection::In,
                ..
            } => {
                self.out_pipe.busy = false;
                self.arm_for_setup(eps);
                self.enter_status(eps, UsbDirection::In, StatusPlan::Auto);
            }
            Stage::Idle => {}
        }
    }

    fn in_request(&self) -> Result<Request, UsbError> {
        let in_stage = matches!(
            self.stage,
            Stage::SetupReceived { .. }
                | Stage::DataIn {
                    data: DataStage::Deferred,
                    ..
                }
        );
        match self.setup {
            Some(request)
                if in_stage && request.direction == UsbDirection::In && request.length > 0 =>
            {
                Ok(request)
            }
            _ => Err(UsbError::InvalidState),
        }
    }

    fn out_request(&self) -> Result<Request, UsbError> {
        let out_stage = matches!(
            self.stage,
            Stage::SetupReceived { .. }
                | Stage::DataOut {
                    data: DataStage::Deferred,
                    ..
                }
        );
        match self.setup {
            Some(request) if out_stage && request.direction == UsbDirection::Out => Ok(request),
            _ => Err(UsbError::InvalidState),
        }
    }

    fn load(&mut self, source: Source, len: usize, options: SendOptions, requested: usize) {
        let len = len.min(requested);
        let pipe = &mut self.in_pipe;
        pipe.source = source;
        pipe.len = len;
        pipe.offset = 0;
        // An empty answer is still one packet.
        pipe.zero_length = len == 0
            || (options.contains(SendOptions::INCLUDE_ZERO)
                && len < requested
                && len % self.max_packet == 0);
        pipe.busy = true;
    }

    pub(crate) fn send(&mut self, data: &[u8], options: SendOptions) -> Result<(), UsbError> {
        let request = self.in_request()?;
        let immediate = self
            .in_pipe
            .immediate
            .get_mut(..data.len())
            .ok_or(UsbError::BufferOverflow)?;
        immediate.copy_from_slice(data);
        self.load(Source::Immediate, data.len(), options, request.length as usize);
        Ok(())
    }

    pub(crate) fn send_static(&mut self, data: &'static [u8], options: SendOptions) -> Result<(), UsbError> {
        let request = self.in_request()?;
        self.load(Source::Static(data), data.len(), options, request.length as usize);
        Ok(())
    }

    pub(crate) fn receive(&mut self, len: usize) -> Result<(), UsbError> {
        let request = self.out_request()?;
        if len > CONTROL_BUFFER_SIZE {
            return Err(UsbError::BufferOverflow);
        }
        self.out_pipe.expected = len.min(request.length as usize);
        self.out_pipe.received = 0;
        self.out_pipe.busy = true;
        Ok(())
    }

    pub(crate) fn defer_in_data_stage(&mut self) -> Result<(), UsbError> {
        let request = self.in_request()?;
        match self.stage {
            Stage::SetupReceived {
                data: DataPlan::Auto | DataPlan::DeferIn,
                status,
            } if request.length > 0 => {
                self.stage = Stage::SetupReceived {
                    data: DataPlan::DeferIn,
                    status,
                };
                Ok(())
            }
            _ => Err(UsbError::InvalidState),
        }
    }

    pub(crate) fn defer_out_data_stage(&mut self) -> Result<(), UsbError> {
        self.out_request()?;
        match self.stage {
            Stage::SetupReceived {
                data: DataPlan::Auto | DataPlan::DeferOut,
                status,
            } => {
                self.stage = Stage::SetupReceived {
                    data: DataPlan::DeferOut,
                    status,
                };
                Ok(())
            }
            _ => Err(UsbError::InvalidState),
        }
    }

    pub(crate) fn defer_status_stage(&mut self) -> Result<(), UsbError> {
        let deferred = StatusPlan::Deferred;
        self.stage = match self.stage {
            Stage::SetupReceived { data, .. } => Stage::SetupReceived {
                data,
                status: deferred,
            },
            Stage::DataIn {
                data: DataStage::Deferred,
                ..
            } => Stage::DataIn {
                data: DataStage::Deferred,
                status: deferred,
            },
            // An active IN data stage already armed its status packet.
            Stage::DataIn {
                data: DataStage::Active,
                status: StatusPlan::Deferred,
            } => self.stage,
            Stage::DataOut { data, .. } => Stage::DataOut {
                data,
                status: deferred,
            },
            Stage::Status {
                status: StatusStage::Deferred,
                ..
            } => self.stage,
            _ => return Err(UsbError::InvalidState),
        };
        Ok(())
    }

    pub(crate) fn allow_data_stage(&mut self, eps: Endpoints<'_>) -> Result<(), UsbError> {
        match self.stage {
            Stage::DataIn {
                data: DataStage::Deferred,
                status,
            } => {
                if !self.in_pipe.busy {
                    return Err(UsbError::InvalidState);
                }
                self.stage = Stage::DataIn {
                    data: DataStage::Active,
                    status,
                };
                self.progress();
                self.start_in(eps, status);
                Ok(())
            }
            Stage::DataOut {
                data: DataStage::Deferred,
                status,
            } => {
                if !self.out_pipe.busy {
                    let length = self.setup.map_or(0, |request| request.length as usize);
                    self.receive(length)?;
                }
                self.stage = Stage::DataOut {
                    data: DataStage::Active,
                    status,
                };
                self.progress();
                if self.out_pipe.expected == 0 {
                    self.finish_data_out(eps);
                } else {
                    self.arm_out_data(eps);
                }
                Ok(())
            }
            _ => Err(UsbError::InvalidState),
        }
    }

    pub(crate) fn allow_status_stage(&mut self, eps: Endpoints<'_>) -> Result<(), UsbError> {
        let auto = StatusPlan::Auto;
        match self.stage {
            Stage::Status {
                direction,
                status: StatusStage::Deferred,
            } => {
                self.arm_status(eps, direction);
                self.stage = Stage::Status {
                    direction,
                    status: StatusStage::Armed,
                };
            }
            Stage::SetupReceived {
                data,
                status: StatusPlan::Deferred,
            } => self.stage = Stage::SetupReceived { data, status: auto },
            Stage::DataIn {
                data,
                status: StatusPlan::Deferred,
            } => {
                self.stage = Stage::DataIn { data, status: auto };
                if data == DataStage::Active {
                    self.arm_status(eps, UsbDirection::Out);
                }
            }
            Stage::DataOut {
                data,
                status: StatusPlan::Deferred,
            } => self.stage = Stage::DataOut { data, status: auto },
            _ => return Err(UsbError::InvalidState),
        }
        self.progress();
        Ok(())
    }

    /// Drop every claim on the request being dispatched, so that it's
    /// stalled.
    pub(crate) fn cancel(&mut self) -> Result<(), UsbError> {
        match self.stage {
            Stage::SetupReceived { .. } => {
                self.reset_pipes();
                self.cancelled = true;
                self.stage = Stage::SetupReceived {
                    data: DataPlan::Auto,
                    status: StatusPlan::Auto,
                };
                Ok(())
            }
            _ => Err(UsbError::InvalidState),
        }
    }
}
