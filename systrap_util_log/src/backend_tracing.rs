// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Tracing backend implementation.
//!
//! Unlike the log backend, this provides native span support with hierarchical context
//! propagation. The process-wide gate still applies on top of any subscriber filter.

impl crate::Level {
    /// Converts this level to the corresponding `tracing::Level`.
    #[doc(hidden)]
    pub const fn to_tracing_level(self) -> tracing::Level {
        match self {
            crate::Level::Error => tracing::Level::ERROR,
            crate::Level::Warn => tracing::Level::WARN,
            crate::Level::Info => tracing::Level::INFO,
            crate::Level::Debug => tracing::Level::DEBUG,
            crate::Level::Trace => tracing::Level::TRACE,
        }
    }
}

/// RAII guard that wraps a tracing span's entered guard.
///
/// The span remains entered as long as this guard exists.
pub struct SpanGuard {
    #[doc(hidden)]
    #[allow(dead_code)]
    pub inner: tracing::span::EnteredSpan,
}

/// Internal macro for tracing backend implementation.
///
/// `tracing::event!` requires a constant level, hence the explicit dispatch.
#[doc(hidden)]
#[macro_export]
macro_rules! __log_impl {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            $crate::Level::Error => $crate::__private::tracing::event!($crate::__private::tracing::Level::ERROR, $($arg)+),
            $crate::Level::Warn => $crate::__private::tracing::event!($crate::__private::tracing::Level::WARN, $($arg)+),
            $crate::Level::Info => $crate::__private::tracing::event!($crate::__private::tracing::Level::INFO, $($arg)+),
            $crate::Level::Debug => $crate::__private::tracing::event!($crate::__private::tracing::Level::DEBUG, $($arg)+),
            $crate::Level::Trace => $crate::__private::tracing::event!($crate::__private::tracing::Level::TRACE, $($arg)+),
        }
    };
}

/// Internal macro for span implementation with tracing backend.
#[doc(hidden)]
#[macro_export]
macro_rules! __span_impl {
    ($level:expr, $name:expr) => {{
        let __span = if $crate::is_logging($level) {
            match $level {
                $crate::Level::Error => $crate::__private::tracing::error_span!($name),
                $crate::Level::Warn => $crate::__private::tracing::warn_span!($name),
                $crate::Level::Info => $crate::__private::tracing::info_span!($name),
                $crate::Level::Debug => $crate::__private::tracing::debug_span!($name),
                $crate::Level::Trace => $crate::__private::tracing::trace_span!($name),
            }
        } else {
            $crate::__private::tracing::Span::none()
        };
        $crate::SpanGuard { inner: __span.entered() }
    }};
}
