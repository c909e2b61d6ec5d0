//! Events and the handler chain
//!
//! The device hands every event to three layers, in order: the core
//! layer, which answers standard requests; the class layer; and the
//! application. The first layer that claims an event ends the dispatch,
//! except for structural events, which every layer sees.

use usb_device::control::Request;

use crate::{
    bd::BusErrors,
    endpoint::{Handle, Outcome},
    stack::Stack,
};

/// Something that happened on the bus, or a request that needs an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'e> {
    Attach,
    /// Structural.
    Detach,
    /// Structural. Every transfer was terminated; endpoint 0 is listening
    /// on address 0.
    Reset,
    Suspend,
    Resume,
    /// Structural. The host selected a configuration.
    ///
    /// Class drivers enable their endpoints here.
    Configured(u8),
    /// SET_CONFIGURATION was accepted. Claim the event to hold the status
    /// stage, and the configuration, until
    /// [`UsbDevice::release_configuration`](crate::UsbDevice::release_configuration).
    HoldBeforeConfiguration(u8),
    /// A SETUP packet arrived.
    ///
    /// Claim it by loading data with [`Stack::send`] or [`Stack::receive`],
    /// by deferring a stage, or, for requests without data, by returning
    /// `true`. Unclaimed requests are stalled.
    ControlRequest(&'e Request),
    /// A standard SET_DESCRIPTOR request arrived. Claim it as a
    /// [`ControlRequest`](Event::ControlRequest).
    SetDescriptor(&'e Request),
    /// The data stage of a control OUT request finished.
    ControlOutComplete { request: &'e Request, data: &'e [u8] },
    /// SET_INTERFACE selected an alternate setting.
    AlternateInterface { interface: u8, alternate: u8 },
    TransferComplete(Handle),
    /// The transfer finished with an error. The data toggle rolled back;
    /// arm again to retry.
    TransferError { handle: Handle, outcome: Outcome },
    /// The transfer was terminated by a reset, a reconfiguration, or a
    /// halt clear, before it completed.
    TransferTerminated(Handle),
    /// One tick: a start-of-frame at full speed, or an application tick
    /// at low speed.
    Tick,
    /// The controller sent a STALL handshake.
    Stall,
    BusError(BusErrors),
}

impl Event<'_> {
    /// Structural events reach every layer, even once claimed.
    pub fn is_structural(&self) -> bool {
        matches!(self, Event::Reset | Event::Configured(_) | Event::Detach)
    }
}

/// Handler chain position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Core,
    Class,
    Application,
}

/// Receives device events
pub trait EventHandler {
    /// Handle an event. Return `true` to claim it.
    ///
    /// `usb` steers the control transfer and the device state.
    fn handle(&mut self, event: &Event<'_>, usb: &mut Stack<'_>) -> bool;
}

/// Claims nothing.
impl EventHandler for () {
    fn handle(&mut self, _: &Event<'_>, _: &mut Stack<'_>) -> bool {
        false
    }
}

/// Run an event through the chain, in order
///
/// Returns the first layer that claimed the event.
pub(crate) fn dispatch(
    layers: [&mut dyn EventHandler; 3],
    event: &Event<'_>,
    usb: &mut Stack<'_>,
) -> Option<Layer> {
    let structural = event.is_structural();
    let mut claimed = None;
    for (layer, handler) in [Layer::Core, Layer::Class, Layer::Application]
        .into_iter()
        .zip(layers)
    {
        if handler.handle(event, usb) {
            claimed.get_or_insert(layer);
            if !structural {
                break;
            }
        }
    }
    if let Some(layer) = claimed {
        trace!("{:?} CLAIMED BY {:?}", event, layer);
    }
    claimed
}
