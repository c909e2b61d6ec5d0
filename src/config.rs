//! Device configuration

/// Ping-pong buffering
///
/// Selects which endpoint directions get two buffer descriptors (banks).
/// With two banks, firmware can arm the next packet while the hardware
/// still owns the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingPong {
    /// One bank everywhere.
    Disabled,
    /// Two banks for endpoint 0 OUT only.
    Ep0OutOnly,
    /// Two banks everywhere.
    Full,
    /// Two banks everywhere, except endpoint 0.
    AllButEp0,
}

impl PingPong {
    pub(crate) const fn is_double(self, ep: usize, out: bool) -> bool {
        match self {
            PingPong::Disabled => false,
            PingPong::Ep0OutOnly => ep == 0 && out,
            PingPong::Full => true,
            PingPong::AllButEp0 => ep != 0,
        }
    }
}

/// Bus speed, which also selects the tick source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    /// Low speed has no start-of-frame packets. The application feeds
    /// ticks with [`Notification::Tick`](crate::Notification::Tick).
    Low,
    /// Every start-of-frame packet is a tick.
    Full,
}

/// Status stage timeout, in ticks, used by [`Config::new`].
///
/// At one tick per millisecond this leaves margin before the host's 50ms
/// status stage limit.
pub const DEFAULT_STATUS_STAGE_TIMEOUT: u8 = 45;

/// Allowed control endpoint max packet sizes.
pub const EP0_MAX_PACKET_SIZES: [u8; 4] = [8, 16, 32, 64];

/// Device configuration
///
/// ```
/// use bdt_usbd::{Config, PingPong};
///
/// const CONFIG: Config = Config::new()
///     .with_ep0_max_packet_size(8)
///     .with_ping_pong(PingPong::Ep0OutOnly);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Control endpoint max packet size. One of [`EP0_MAX_PACKET_SIZES`].
    pub ep0_max_packet_size: u8,
    pub ping_pong: PingPong,
    pub speed: Speed,
    /// Force the status stage of a stalled control transfer after this
    /// many ticks without progress. `None` disables the timeout.
    pub status_stage_timeout: Option<u8>,
    /// Reported by GET_STATUS(device).
    pub self_powered: bool,
}

impl Config {
    pub const fn new() -> Self {
        Config {
            ep0_max_packet_size: 64,
            ping_pong: PingPong::Full,
            speed: Speed::Full,
            status_stage_timeout: Some(DEFAULT_STATUS_STAGE_TIMEOUT),
            self_powered: false,
        }
    }

    pub const fn with_ep0_max_packet_size(mut self, size: u8) -> Self {
        self.ep0_max_packet_size = size;
        self
    }

    pub const fn with_ping_pong(mut self, ping_pong: PingPong) -> Self {
        self.ping_pong = ping_pong;
        self
    }

    pub const fn with_speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }

    pub const fn with_status_stage_timeout(mut self, ticks: Option<u8>) -> Self {
        self.status_stage_timeout = ticks;
        self
    }

    pub const fn with_self_powered(mut self, self_powered: bool) -> Self {
        self.self_powered = self_powered;
        self
    }

    pub(crate) fn is_valid(&self) -> bool {
        EP0_MAX_PACKET_SIZES.contains(&self.ep0_max_packet_size)
            && self.status_stage_timeout != Some(0)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
