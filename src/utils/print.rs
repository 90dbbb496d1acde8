//! Node-prefixed logging macros and error-returning helpers.

use std::sync::OnceLock;

use env_logger::Env;

/// Identity of this node, printed in front of every log line. Set once at
/// `Initialize`; lines logged before that carry `-`.
pub static ME: OnceLock<String> = OnceLock::new();

#[doc(hidden)]
pub use log as __log;

/// Logs at the given `log::Level` with the node prefix. The level-specific
/// macros below are what the rest of the crate calls.
#[macro_export]
#[doc(hidden)]
macro_rules! pf_log {
    ($lvl:expr, $($fmt_args:tt)*) => {
        $crate::__log::log!(
            $lvl,
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Per-event dispatch noise.
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!($crate::__log::Level::Trace, $($fmt_args)*)
    };
}

/// Protocol progress, e.g. `pf_debug!("prepared seq {}", seq_no)`.
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!($crate::__log::Level::Debug, $($fmt_args)*)
    };
}

#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!($crate::__log::Level::Info, $($fmt_args)*)
    };
}

#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!($crate::__log::Level::Warn, $($fmt_args)*)
    };
}

#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => {
        $crate::pf_log!($crate::__log::Level::Error, $($fmt_args)*)
    };
}

/// Installs `env_logger` (level from `RUST_LOG`, `info` otherwise). Safe to
/// call more than once.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Logs at error level and evaluates to `Err(MirError::Msg(..))`.
///
/// ```no_compile
/// return logged_err!("invalid config.batch_size '{}'", size);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($($fmt_args:tt)*) => {{
        let text = format!($($fmt_args)*);
        $crate::pf_error!("{}", text);
        Err($crate::MirError::Msg(text))
    }};
}

/// Logs a broken invariant and evaluates to `Err(MirError::Fatal(..))`.
///
/// ```no_compile
/// return fatal_err!("WAL index {} out of order", idx);
/// ```
#[macro_export]
macro_rules! fatal_err {
    ($($fmt_args:tt)*) => {{
        let text = format!($($fmt_args)*);
        $crate::pf_error!("invariant violated: {}", text);
        Err($crate::MirError::Fatal(text))
    }};
}

/// Logs evidence against a peer and evaluates to
/// `Err(MirError::Byzantine(..))`.
///
/// ```no_compile
/// return byzantine_err!("node {} sent bad digest", source);
/// ```
#[macro_export]
macro_rules! byzantine_err {
    ($($fmt_args:tt)*) => {{
        let text = format!($($fmt_args)*);
        $crate::pf_warn!("byzantine evidence: {}", text);
        Err($crate::MirError::Byzantine(text))
    }};
}

/// Returns `fatal_err!` from the enclosing function unless `$cond` holds.
///
/// ```no_compile
/// ensure!(seq_no > low, "seq {} below low watermark {}", seq_no, low);
/// ```
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $($fmt_args:tt)*) => {
        if !($cond) {
            return $crate::fatal_err!($($fmt_args)*);
        }
    };
}
