// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Log backend implementation.
//!
//! Since `log` does not have native span support, spans are emulated by:
//! - Logging a `[SPAN ENTER]` message when the span is created
//! - Logging a `[SPAN EXIT]` message when the span guard is dropped

impl crate::Level {
    /// Converts this level to the corresponding `log::Level`.
    #[doc(hidden)]
    pub const fn to_log_level(self) -> log::Level {
        match self {
            crate::Level::Error => log::Level::Error,
            crate::Level::Warn => log::Level::Warn,
            crate::Level::Info => log::Level::Info,
            crate::Level::Debug => log::Level::Debug,
            crate::Level::Trace => log::Level::Trace,
        }
    }
}

/// Make sure `log`'s static filter is at least as permissive as the gate.
pub(crate) fn raise_backend_filter(level: crate::Level) {
    let wanted = level.to_log_level().to_level_filter();
    if log::max_level() < wanted {
        log::set_max_level(wanted);
    }
}

/// RAII guard that logs span exit when dropped.
///
/// `entered` records whether the entry was emitted, so that a span opened while its level was
/// gated off stays silent on exit too.
pub struct SpanGuard {
    #[doc(hidden)]
    pub name: &'static str,
    #[doc(hidden)]
    pub level: crate::Level,
    #[doc(hidden)]
    pub module_path: &'static str,
    #[doc(hidden)]
    pub entered: bool,
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if self.entered {
            log::log!(target: self.module_path, self.level.to_log_level(), "[SPAN EXIT] {}", self.name);
        }
    }
}

/// Internal macro for log backend implementation.
///
/// Not intended for direct use; called by the public logging macros.
#[doc(hidden)]
#[macro_export]
macro_rules! __log_impl {
    ($level:expr, $($arg:tt)+) => {
        $crate::__private::log::log!($crate::Level::to_log_level($level), $($arg)+)
    };
}

/// Internal macro for span implementation with log backend.
///
/// Not intended for direct use; called by the public span macros.
#[doc(hidden)]
#[macro_export]
macro_rules! __span_impl {
    ($level:expr, $name:expr) => {{
        let __level: $crate::Level = $level;
        let __entered = $crate::is_logging(__level);
        if __entered {
            $crate::__private::log::log!($crate::Level::to_log_level(__level), "[SPAN ENTER] {}", $name);
        }
        $crate::SpanGuard {
            name: $name,
            level: __level,
            module_path: module_path!(),
            entered: __entered,
        }
    }};
}
