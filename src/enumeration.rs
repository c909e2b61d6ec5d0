//! Device state tracking
//!
//! The coarse enumeration state, driven only by bus events and by the
//! standard requests that the core layer services. Applications read it
//! through [`Stack`](crate::Stack); nothing outside the crate sets it.

/// Enumeration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceState {
    Detached,
    Attached,
    Powered,
    /// Reset, listening on address 0.
    Default,
    /// SET_ADDRESS accepted, waiting for its status stage.
    AddressPending,
    Address,
    Configured,
}

pub(crate) struct Tracker {
    state: DeviceState,
    suspended: bool,
    address: u8,
    pending: u8,
    configuration: u8,
}

impl Tracker {
    pub(crate) const fn new() -> Self {
        Tracker {
            state: DeviceState::Detached,
            suspended: false,
            address: 0,
            pending: 0,
            configuration: 0,
        }
    }

    pub(crate) fn state(&self) -> DeviceState {
        self.state
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub(crate) fn address(&self) -> u8 {
        self.address
    }

    pub(crate) fn configuration(&self) -> u8 {
        self.configuration
    }

    fn transition(&mut self, state: DeviceState) {
        if self.state != state {
            debug!("STATE {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    pub(crate) fn attach(&mut self) {
        if self.state == DeviceState::Detached {
            self.transition(DeviceState::Attached);
        }
    }

    /// Bus activity seen while attached.
    pub(crate) fn powered(&mut self) {
        if self.state == DeviceState::Attached {
            self.transition(DeviceState::Powered);
        }
    }

    pub(crate) fn detach(&mut self) {
        *self = Tracker::new();
    }

    /// Returns `false` if the device is detached, and the reset is ignored.
    pub(crate) fn reset(&mut self) -> bool {
        if self.state == DeviceState::Detached {
            return false;
        }
        self.suspended = false;
        self.address = 0;
        self.pending = 0;
        self.configuration = 0;
        self.transition(DeviceState::Default);
        true
    }

    pub(crate) fn suspend(&mut self) {
        self.suspended = true;
    }

    pub(crate) fn resume(&mut self) {
        self.suspended = false;
    }

    /// Accept a SET_ADDRESS request.
    ///
    /// Returns `false` if the request isn't valid in this state.
    pub(crate) fn request_address(&mut self, address: u8) -> bool {
        if address > 127 || !matches!(self.state, DeviceState::Default | DeviceState::Address) {
            return false;
        }
        self.pending = address;
        self.transition(DeviceState::AddressPending);
        true
    }

    /// The status stage of SET_ADDRESS completed.
    ///
    /// Returns the address to program, if one is pending.
    pub(crate) fn commit_address(&mut self) -> Option<u8> {
        if self.state != DeviceState::AddressPending {
            return None;
        }
        self.address = self.pending;
        self.transition(if self.address == 0 {
            DeviceState::Default
        } else {
            DeviceState::Address
        });
        Some(self.address)
    }

    /// Drop a SET_ADDRESS whose status stage never completed.
    pub(crate) fn revert_address(&mut self) {
        if self.state == DeviceState::AddressPending {
            self.transition(if self.address == 0 {
                DeviceState::Default
            } else {
                DeviceState::Address
            });
        }
    }

    /// Indicates if SET_CONFIGURATION is valid in this state.
    pub(crate) fn can_configure(&self) -> bool {
        matches!(self.state, DeviceState::Address | DeviceState::Configured)
    }

    pub(crate) fn configure(&mut self, configuration: u8) {
        if !self.can_configure() {
            return;
        }
        self.configuration = configuration;
        self.transition(if configuration == 0 {
            DeviceState::Address
        } else {
            DeviceState::Configured
        });
    }
}
