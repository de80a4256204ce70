//! Client for the GNU make jobserver token pool.
//!
//! A jobserver limits how many jobs a tree of cooperating processes runs at
//! once.  The top-level process creates a pipe holding one byte per extra job
//! slot and advertises it to its children through `MAKEFLAGS`.  A child takes a
//! byte before starting a job and writes it back when the job is done.
//!
//! [`PoolTransport`] is the low-level pipe client, [`TokenPool`] picks between
//! a real pipe and a disabled pool, and [`JobClient`] adds the bookkeeping a
//! well-behaved make child needs.

/// Log an error.
///
/// # Example
///
/// ```no_run
/// # use tokenpool::log_err;
/// # fn main() {
/// log_err!("{} has failed", "everything");
/// # }
/// ```
#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {{
        let s = format!($($arg)*);
        $crate::logs::meta("error", s.trim_end(), None);
    }}
}

/// Log a warning.
///
/// # Example
///
/// ```no_run
/// # use tokenpool::log_warn;
/// # fn main() {
/// log_warn!("{} has failed", "something non-critical");
/// # }
/// ```
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        let s = format!($($arg)*);
        $crate::logs::meta("warning", s.trim_end(), None);
    }}
}

/// Log a debug message.
///
/// # Example
///
/// ```no_run
/// # use tokenpool::log_debug;
/// # fn main() {
/// log_debug!("some details");
/// # }
/// ```
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        if $crate::logs::debug_level() >= 1 {
            let s = format!($($arg)*);
            $crate::logs::meta("debug", s.trim_end(), None);
        }
    }}
}

/// Log a verbose debug message, such as every token read or written.
///
/// # Example
///
/// ```no_run
/// # use tokenpool::log_debug2;
/// # fn main() {
/// log_debug2!("some verbose details");
/// # }
/// ```
#[macro_export]
macro_rules! log_debug2 {
    ($($arg:tt)*) => {{
        if $crate::logs::debug_level() >= 2 {
            let s = format!($($arg)*);
            $crate::logs::meta("debug", s.trim_end(), None);
        }
    }}
}

mod client;
mod env;
mod error;
mod exits;
mod helpers;
pub mod logs;
mod pool;
mod posix;

pub use client::JobClient;
pub use env::{Env, JobServerAuth, MakeFlags, OptionalBool, MAKEFLAGS_VARS};
pub use error::{TokenPoolError, TokenPoolErrorKind};
pub use exits::*;
pub use pool::TokenPool;
pub use posix::{Acquire, PoolTransport, DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_TOKEN};
