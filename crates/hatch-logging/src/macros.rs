//! ---
//! hatch_section: "03-logging"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Structured logging adapters and sinks."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
//! Context-enriched wrappers around `tracing::event!`.

#[doc(hidden)]
#[macro_export]
macro_rules! __hatch_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            channel = ctx.channel.unwrap_or(""),
            version = ctx.version.unwrap_or(""),
            phase = ctx.phase.unwrap_or(""),
            attempt = ctx.attempt.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with updater context.
#[macro_export]
macro_rules! hatch_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__hatch_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__hatch_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with updater context.
#[macro_export]
macro_rules! hatch_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__hatch_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__hatch_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with updater context.
#[macro_export]
macro_rules! hatch_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__hatch_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__hatch_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with updater context.
#[macro_export]
macro_rules! hatch_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__hatch_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__hatch_event!(tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
