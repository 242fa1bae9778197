// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! # Systrap Logging Utilities
//!
//! A small logging facade shared by the systrap crates. It adds one thing on top of the
//! underlying backend: a process-wide minimum [`Level`] that is configured once at start-up
//! ([`init`] / [`init_from_env`]) and can be queried cheaply with [`is_logging`]. Callers that
//! would otherwise pay for expensive formatting (e.g., rendering a whole shared message) check the
//! gate first and bail out early.
//!
//! ## Features
//!
//! - `backend_log` (default): events are forwarded to the [`log`](https://docs.rs/log) crate.
//!   Spans are emulated by logging events at span entry and exit.
//! - `backend_tracing`: events and spans are forwarded to the
//!   [`tracing`](https://docs.rs/tracing) crate.
//!
//! When both features are enabled, `backend_tracing` takes precedence.
//!
//! ## Example
//!
//! ```ignore
//! use systrap_util_log::{Level, debug, info, is_logging};
//!
//! systrap_util_log::init(Level::Debug);
//! info!("stub thread {} ready", tid);
//! if is_logging(Level::Debug) {
//!     debug!("message: {}", expensive_render());
//! }
//! ```

#[cfg(not(any(feature = "backend_log", feature = "backend_tracing")))]
compile_error!("Either `backend_log` or `backend_tracing` feature must be enabled.");

#[macro_use]
mod macros;

#[cfg(all(feature = "backend_log", not(feature = "backend_tracing")))]
#[macro_use]
mod backend_log;

#[cfg(feature = "backend_tracing")]
#[macro_use]
mod backend_tracing;

use core::sync::atomic::{AtomicU8, Ordering};

/// Log level that abstracts over backend-specific level types.
///
/// Levels are ordered from most severe to least severe: `Error` > `Warn` > `Info` > `Debug` >
/// `Trace`. In terms of [`Ord`], a more severe level compares *smaller*, matching the `log` crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Level {
    /// Serious problems that need immediate attention.
    Error = 1,
    /// Potential issues or unexpected situations.
    Warn = 2,
    /// General informational messages.
    Info = 3,
    /// Debugging information useful during development.
    Debug = 4,
    /// Very verbose debugging, typically disabled in production.
    Trace = 5,
}

impl Level {
    const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Level::Error),
            2 => Some(Level::Warn),
            3 => Some(Level::Info),
            4 => Some(Level::Debug),
            5 => Some(Level::Trace),
            _ => None,
        }
    }

    /// Lower-case name of the level, as accepted by [`str::parse`].
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        }
    }
}

impl core::fmt::Display for Level {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a [`Level`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLevelError;

impl core::fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("expected one of: error, warn, info, debug, trace")
    }
}

impl core::error::Error for ParseLevelError {}

impl core::str::FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Level::Error,
            Level::Warn,
            Level::Info,
            Level::Debug,
            Level::Trace,
        ]
        .into_iter()
        .find(|l| s.trim().eq_ignore_ascii_case(l.as_str()))
        .ok_or(ParseLevelError)
    }
}

/// Level used until [`init`] is called.
pub const DEFAULT_LEVEL: Level = Level::Info;

static MAX_LEVEL: AtomicU8 = AtomicU8::new(DEFAULT_LEVEL as u8);

/// Set the process-wide minimum severity. Messages less severe than `level` are dropped before
/// they are formatted.
///
/// Also raises the backend's own filter (for `log`) so that the backend never drops something the
/// gate lets through.
pub fn init(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
    #[cfg(all(feature = "backend_log", not(feature = "backend_tracing")))]
    backend_log::raise_backend_filter(level);
}

/// Initialize the gate from the environment variable `var` (e.g., `SYSTRAP_LOG=debug`).
///
/// Falls back to `default` if the variable is unset or does not name a level. Returns the level
/// that was installed.
pub fn init_from_env(var: &str, default: Level) -> Level {
    let level = std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default);
    init(level);
    level
}

/// The currently configured minimum severity.
pub fn max_level() -> Level {
    Level::from_u8(MAX_LEVEL.load(Ordering::Relaxed)).unwrap_or(DEFAULT_LEVEL)
}

/// Whether messages at `level` are currently emitted.
#[inline]
pub fn is_logging(level: Level) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

#[cfg(all(feature = "backend_log", not(feature = "backend_tracing")))]
pub use backend_log::SpanGuard;

#[cfg(feature = "backend_tracing")]
pub use backend_tracing::SpanGuard;

/// Internal module exposing backend types for use by exported macros.
///
/// This module is public only because macros need access to backend types at the
/// call site. It is not part of the public API and should not be used directly.
#[doc(hidden)]
pub mod __private {
    #[cfg(all(feature = "backend_log", not(feature = "backend_tracing")))]
    pub use log;

    #[cfg(feature = "backend_tracing")]
    pub use tracing;
}
