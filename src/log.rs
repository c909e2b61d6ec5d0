//! Logging interface, contingent on the hidden `__log` feature
//!
//! Only enable `__log` when debugging, and when you're certain that your
//! logger isn't using USB! Most of these messages are emitted from the
//! service routine, which may run in an interrupt.
//!
//! Without `__log`, the arguments are still type checked, so values bound
//! only for a message don't trip `unused_variables`.

macro_rules! trace {
    ($($args:tt)*) => {{
        #[cfg(feature = "__log")]
        ::__log::trace!($($args)*);
        #[cfg(not(feature = "__log"))]
        let _ = ::core::format_args!($($args)*);
    }};
}

macro_rules! debug {
    ($($args:tt)*) => {{
        #[cfg(feature = "__log")]
        ::__log::debug!($($args)*);
        #[cfg(not(feature = "__log"))]
        let _ = ::core::format_args!($($args)*);
    }};
}

macro_rules! warn {
    ($($args:tt)*) => {{
        #[cfg(feature = "__log")]
        ::__log::warn!($($args)*);
        #[cfg(not(feature = "__log"))]
        let _ = ::core::format_args!($($args)*);
    }};
}
