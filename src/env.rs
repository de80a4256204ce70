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

use std::env;
use std::ffi::OsStr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::error::{TokenPoolError, TokenPoolErrorKind};
use super::posix::DEFAULT_ACQUIRE_TIMEOUT;

/// Variables that may carry make flags, in lookup order.
pub const MAKEFLAGS_VARS: &[&str] = &["CARGO_MAKEFLAGS", "MAKEFLAGS", "MFLAGS"];

/// Process-wide settings read from the environment.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Env {
    pub makeflags: String,
    pub debug: i32,
    pub acquire_timeout: Duration,
    pub color: OptionalBool,
    pub pretty: bool,
}

impl Env {
    /// Read the environment to get runtime settings.
    pub fn inherit() -> Env {
        let makeflags = MAKEFLAGS_VARS
            .iter()
            .filter_map(|k| env::var(k).ok())
            .find(|v| !v.trim().is_empty())
            .unwrap_or_default();
        let timeout_ms = get_int(
            "TOKENPOOL_TIMEOUT_MS",
            DEFAULT_ACQUIRE_TIMEOUT.as_millis() as i32,
        );
        Env {
            makeflags,
            debug: get_int("TOKENPOOL_DEBUG", 0),
            acquire_timeout: Duration::from_millis(timeout_ms.max(1) as u64),
            color: match get_int("TOKENPOOL_COLOR", 1) {
                0 => OptionalBool::Off,
                1 => OptionalBool::Auto,
                _ => OptionalBool::On,
            },
            pretty: get_int("TOKENPOOL_PRETTY", 1) != 0,
        }
    }

    /// Parse the make flags found in the environment.
    #[inline]
    pub fn make_flags(&self) -> Result<MakeFlags, TokenPoolError> {
        MakeFlags::parse(&self.makeflags)
    }
}

impl Default for Env {
    fn default() -> Env {
        Env {
            makeflags: String::new(),
            debug: 0,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            color: OptionalBool::Auto,
            pretty: true,
        }
    }
}

/// A tri-state boolean.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OptionalBool {
    Off,
    Auto,
    On,
}

impl OptionalBool {
    #[inline]
    pub fn unwrap_or(self, default: bool) -> bool {
        self.unwrap_or_else(|| default)
    }

    #[inline]
    pub fn unwrap_or_else<F: FnOnce() -> bool>(self, f: F) -> bool {
        match self {
            OptionalBool::Off => false,
            OptionalBool::Auto => f(),
            OptionalBool::On => true,
        }
    }
}

impl Default for OptionalBool {
    #[inline]
    fn default() -> OptionalBool {
        OptionalBool::Auto
    }
}

/// Where an inherited jobserver lives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobServerAuth {
    /// A pipe whose two ends were inherited as descriptors.
    Fds(RawFd, RawFd),
    /// A named pipe (GNU make 4.4 and later).
    Fifo(PathBuf),
}

/// The jobserver-relevant parts of a `MAKEFLAGS` value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MakeFlags {
    pub auth: Option<JobServerAuth>,
    pub max_jobs: Option<u32>,
    pub max_load: Option<f64>,
}

impl MakeFlags {
    /// Parse a make flags string.
    ///
    /// `--jobserver-auth=` (renamed in GNU make 4.2) takes precedence over
    /// the older `--jobserver-fds=` no matter which comes first.
    pub fn parse<S: AsRef<str>>(flags: S) -> Result<MakeFlags, TokenPoolError> {
        const AUTH: &str = "--jobserver-auth=";
        const FDS: &str = "--jobserver-fds="; // fallback syntax

        let mut result = MakeFlags::default();
        let mut auth: Option<JobServerAuth> = None;
        let mut fds: Option<JobServerAuth> = None;
        for word in flags.as_ref().split_whitespace() {
            if let Some(arg) = word.strip_prefix(AUTH) {
                auth = Some(parse_auth_arg(arg)?);
            } else if let Some(arg) = word.strip_prefix(FDS) {
                fds = Some(parse_auth_arg(arg)?);
            } else if let Some(n) = word.strip_prefix("-j") {
                // A bare "-j" means unlimited.
                result.max_jobs = u32::from_str(n).ok();
            } else if let Some(n) = word.strip_prefix("-l") {
                result.max_load = f64::from_str(n).ok();
            }
        }
        result.auth = auth.or(fds);
        Ok(result)
    }

    /// Reports whether make asked for serial execution.
    #[inline]
    pub fn is_serial(&self) -> bool {
        self.max_jobs == Some(1)
    }
}

fn parse_auth_arg(arg: &str) -> Result<JobServerAuth, TokenPoolError> {
    let malformed = || {
        TokenPoolError::from(TokenPoolErrorKind::MalformedAuth(String::from(arg)))
    };
    if let Some(path) = arg.strip_prefix("fifo:") {
        if path.is_empty() {
            return Err(malformed());
        }
        return Ok(JobServerAuth::Fifo(PathBuf::from(path)));
    }
    let (r, w) = parse_fd_pair(arg).ok_or_else(malformed)?;
    Ok(JobServerAuth::Fds(r, w))
}

/// Parse `"<read>,<write>"` into two descriptor numbers.
pub(crate) fn parse_fd_pair(s: &str) -> Option<(RawFd, RawFd)> {
    let mut parts = s.splitn(2, ',');
    let r = parts.next().and_then(|s| RawFd::from_str(s).ok())?;
    let w = parts.next().and_then(|s| RawFd::from_str(s).ok())?;
    Some((r, w))
}

fn get_int<K: AsRef<OsStr>>(key: K, default: i32) -> i32 {
    env::var(key)
        .ok()
        .and_then(|v| i32::from_str(&v).ok())
        .unwrap_or(default)
}
