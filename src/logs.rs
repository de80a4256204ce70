// Copyright 2021 Ross Light
// Copyright 2010-2018 Avery Pennarun and contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

use lazy_static::lazy_static;
use libc::pid_t;
use nix::unistd::{self, Pid};
use std::env;
use std::fmt::{self, Display, Formatter};
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use super::env::{Env, OptionalBool};

/// A line-based logger.
trait Logger {
    /// Write a structured line to the logger.
    fn write_meta(&mut self, meta: &Meta<'_>);
}

/// A log printer for machine-readable logs.
#[derive(Debug)]
struct RawLog<W> {
    file: W,
}

impl<W: Write> RawLog<W> {
    fn new(file: W) -> RawLog<W> {
        RawLog { file }
    }
}

impl<W: Write> Logger for RawLog<W> {
    fn write_meta(&mut self, meta: &Meta<'_>) {
        let msg_with_nl = format!("{}\n", meta);

        let _ = io::stdout().flush();
        let _ = self.file.write_all(msg_with_nl.as_bytes());
        let _ = self.file.flush();
    }
}

#[derive(Debug)]
struct PrettyLog<W> {
    file: W,
    escapes: ColorEscapes,
    debug_pids: bool,
}

impl<W> PrettyLog<W> {
    fn new(file: W, escapes: ColorEscapes, debug_pids: bool) -> PrettyLog<W> {
        PrettyLog {
            file,
            escapes,
            debug_pids,
        }
    }

    fn pretty(&self, buf: &mut Vec<u8>, pid: pid_t, color: &[u8], label: &str, s: &str) {
        buf.extend(color);
        if self.debug_pids {
            let _ = write!(buf, "{:<6} tokenpool: ", pid);
        } else {
            buf.extend(b"tokenpool: ");
        }
        buf.extend(label.as_bytes());
        if !color.is_empty() {
            buf.extend(self.escapes.bold);
        }
        buf.extend(s.as_bytes());
        buf.extend(self.escapes.plain);
        buf.push(b'\n')
    }
}

impl<W: Write> Logger for PrettyLog<W> {
    fn write_meta(&mut self, meta: &Meta<'_>) {
        let mut buf: Vec<u8> = Vec::with_capacity(meta.text.len() + 32);

        let _ = io::stdout().flush();
        let (color, label) = match meta.kind {
            "error" => (self.escapes.red, ""),
            "warning" => (self.escapes.yellow, "warning: "),
            "debug" => (self.escapes.green, "debug: "),
            _ => (&b""[..], ""),
        };
        self.pretty(&mut buf, meta.pid, color, label, meta.text);
        let _ = self.file.write_all(&buf);
        let _ = self.file.flush();
    }
}

lazy_static! {
    static ref GLOBAL_LOGGER: Mutex<Option<Box<dyn Logger + Send>>> = Mutex::new(None);
}

/// A builder used for setting up logs.
#[derive(Clone, Debug)]
pub struct LogBuilder {
    pretty: bool,
    color: OptionalBool,
    debug_pids: bool,
}

impl LogBuilder {
    #[inline]
    pub fn new() -> LogBuilder {
        LogBuilder {
            pretty: true,
            color: OptionalBool::Auto,
            debug_pids: false,
        }
    }

    /// Set whether logs should be pretty-printed.
    #[inline]
    pub fn pretty(&mut self, val: bool) -> &mut Self {
        self.pretty = val;
        self
    }

    /// Sets terminal color behavior.
    #[inline]
    pub fn color(&mut self, val: OptionalBool) -> &mut Self {
        self.color = val;
        self
    }

    /// Prefix pretty log lines with the process ID.
    #[inline]
    pub fn debug_pids(&mut self, val: bool) -> &mut Self {
        self.debug_pids = val;
        self
    }

    /// Set up the process-wide logger with the builder's settings.
    pub fn setup<W: WriteWithMaybeFd + Send + 'static>(&self, env: &Env, tty: W) {
        let logger: Box<dyn Logger + Send> = if self.pretty {
            let escapes = tty
                .as_raw_fd()
                .map(|fd| check_tty(fd, self.color))
                .unwrap_or_default();
            Box::new(PrettyLog::new(tty, escapes, self.debug_pids))
        } else {
            Box::new(RawLog::new(tty))
        };

        DEBUG_LEVEL.store(env.debug, Ordering::SeqCst);
        let mut global_logger = GLOBAL_LOGGER.lock().unwrap_or_else(|e| e.into_inner());
        *global_logger = Some(logger);
    }
}

impl Default for LogBuilder {
    #[inline]
    fn default() -> LogBuilder {
        LogBuilder::new()
    }
}

impl From<&Env> for LogBuilder {
    fn from(e: &Env) -> LogBuilder {
        LogBuilder {
            pretty: e.pretty,
            color: e.color,
            debug_pids: e.debug >= 2,
        }
    }
}

/// A wrapper over the [`Write`] trait that can optionally capture
/// the raw file descriptor.
pub trait WriteWithMaybeFd: Write {
    fn as_raw_fd(&self) -> Option<RawFd> {
        None
    }
}

impl<T: Write + AsRawFd> WriteWithMaybeFd for T {
    fn as_raw_fd(&self) -> Option<RawFd> {
        Some(AsRawFd::as_raw_fd(self))
    }
}

/// Global debug level (used for `log_*` macros).
static DEBUG_LEVEL: AtomicI32 = AtomicI32::new(0);

/// Return the currently configured global debug level.
#[inline]
pub fn debug_level() -> i32 {
    DEBUG_LEVEL.load(Ordering::SeqCst)
}

/// Write a structured log-line to the process-wide logger.
///
/// If this is called before [`LogBuilder::setup`], then the line is
/// pretty-printed to stderr.
pub fn meta(kind: &str, s: &str, pid: Option<Pid>) {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    debug_assert!(!kind.contains(':'));
    debug_assert!(!kind.contains('@'));
    debug_assert!(!s.contains('\n'));
    let pid = pid.unwrap_or_else(unistd::getpid);
    let meta = Meta {
        kind,
        pid: pid.as_raw(),
        timestamp,
        text: s,
    };
    {
        let mut logger = GLOBAL_LOGGER.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(logger) = &mut *logger {
            logger.write_meta(&meta);
            return;
        }
    }
    let mut logger = PrettyLog::new(io::stderr(), ColorEscapes::default(), true);
    logger.write_meta(&meta);
}

/// A structured log-line: `@@TOKENPOOL:kind:pid:timestamp@@ text`.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Meta<'a> {
    kind: &'a str,
    pid: pid_t,
    timestamp: f64,
    text: &'a str,
}

impl<'a> Display for Meta<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "@@TOKENPOOL:{}:{}:{:.4}@@ {}",
            self.kind, self.pid, self.timestamp, self.text
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ColorEscapes {
    red: &'static [u8],
    green: &'static [u8],
    yellow: &'static [u8],
    bold: &'static [u8],
    plain: &'static [u8],
}

impl Default for ColorEscapes {
    /// Returns an empty set of color escapes.
    fn default() -> ColorEscapes {
        let zero = b"";
        ColorEscapes {
            red: zero,
            green: zero,
            yellow: zero,
            bold: zero,
            plain: zero,
        }
    }
}

fn check_tty(tty: RawFd, color: OptionalBool) -> ColorEscapes {
    let color = color.unwrap_or_else(|| {
        unistd::isatty(tty).unwrap_or(false)
            && env::var_os("TERM").map_or(false, |v| v != "dumb" && v != "")
    });
    if color {
        ColorEscapes {
            red: b"\x1b[31m",
            green: b"\x1b[32m",
            yellow: b"\x1b[33m",
            bold: b"\x1b[1m",
            plain: b"\x1b[m",
        }
    } else {
        ColorEscapes::default()
    }
}
