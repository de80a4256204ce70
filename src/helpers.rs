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

use libc::{c_int, itimerval, suseconds_t, time_t, timeval};
use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, FdFlag, OFlag};
use nix::poll::{self, PollFd, PollFlags};
use nix::sys::stat;
use std::convert::TryFrom;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub(crate) fn close_on_exec(fd: RawFd, yes: bool) -> nix::Result<()> {
    let result = fcntl::fcntl(fd, FcntlArg::F_GETFD)?;
    let mut fl = FdFlag::from_bits_truncate(result);
    fl.set(FdFlag::FD_CLOEXEC, yes);
    fcntl::fcntl(fd, fcntl::F_SETFD(fl))?;
    Ok(())
}

/// Reports whether `fd` names an open file descriptor in this process.
pub(crate) fn fd_exists(fd: RawFd) -> bool {
    fd >= 0 && fcntl::fcntl(fd, FcntlArg::F_GETFD).is_ok()
}

pub(crate) fn is_fifo(fd: RawFd) -> nix::Result<bool> {
    let st = stat::fstat(fd)?;
    Ok(st.st_mode & libc::S_IFMT == libc::S_IFIFO)
}

/// Which directions a descriptor was opened for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct AccessMode {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

pub(crate) fn access_mode(fd: RawFd) -> nix::Result<AccessMode> {
    let flags = OFlag::from_bits_truncate(fcntl::fcntl(fd, FcntlArg::F_GETFL)?);
    let mode = flags & OFlag::O_ACCMODE;
    Ok(AccessMode {
        read: mode == OFlag::O_RDONLY || mode == OFlag::O_RDWR,
        write: mode == OFlag::O_WRONLY || mode == OFlag::O_RDWR,
    })
}

/// Wait up to `timeout` for `fd` to become readable. A `timeout` of `None`
/// waits indefinitely. End-of-stream counts as readable, since a read will
/// not block.
pub(crate) fn poll_readable(fd: RawFd, timeout: Option<Duration>) -> nix::Result<bool> {
    let timeout_ms: c_int = match timeout {
        Some(d) => c_int::try_from(d.as_millis()).unwrap_or(c_int::MAX),
        None => -1,
    };
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    if poll::poll(&mut fds, timeout_ms)? == 0 {
        return Ok(false);
    }
    let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
    if revents.contains(PollFlags::POLLNVAL) {
        return Err(Errno::EBADF);
    }
    Ok(revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
}

/// Which clock an interval timer counts. Only wall-clock time (delivering
/// `SIGALRM`) is needed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub(crate) enum IntervalTimer {
    Real,
}

impl From<IntervalTimer> for c_int {
    fn from(which: IntervalTimer) -> c_int {
        match which {
            IntervalTimer::Real => libc::ITIMER_REAL,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct IntervalTimerValue {
    pub(crate) interval: Duration,
    /// Time until next expiration
    pub(crate) value: Duration,
}

impl IntervalTimerValue {
    /// A timer that fires once after `d` and is not re-armed.
    #[inline]
    pub(crate) const fn one_shot(d: Duration) -> IntervalTimerValue {
        IntervalTimerValue {
            interval: Duration::from_secs(0),
            value: d,
        }
    }
}

impl From<&IntervalTimerValue> for itimerval {
    #[inline]
    fn from(val: &IntervalTimerValue) -> itimerval {
        itimerval {
            it_interval: timeval_from_duration(val.interval),
            it_value: timeval_from_duration(val.value),
        }
    }
}

#[inline]
pub(crate) const fn timeval_from_duration(d: Duration) -> timeval {
    timeval {
        tv_sec: d.as_secs() as time_t,
        tv_usec: d.subsec_micros() as suseconds_t,
    }
}

/// Arm (or with a zero value, disarm) an interval timer.
pub(crate) fn set_interval_timer(
    which: IntervalTimer,
    value: &IntervalTimerValue,
) -> nix::Result<()> {
    let new_value = itimerval::from(value);
    let ret = unsafe { setitimer(which.into(), &new_value, std::ptr::null_mut()) };
    if ret == 0 {
        Ok(())
    } else {
        Err(Errno::last())
    }
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
extern "C" {
    fn setitimer(which: c_int, new_value: *const itimerval, old_value: *mut itimerval) -> c_int;
}
