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

//! POSIX pipe transport for a GNU make jobserver.
//!
//! Each byte in the pipe is a token.  Reading a byte takes a token,
//! writing one back returns it.  The hard part is reading without ever
//! blocking: checking that the pipe is readable and then reading are two
//! separate system calls, and another process may take the byte in between.
//! See <http://make.mad-scientist.net/papers/jobserver-implementation/>.
//!
//! We close that window by reading from a duplicate of the read end
//! (the "shadow" descriptor) while a short one-shot `SIGALRM` timer and a
//! temporary `SIGCHLD` handler are armed.  Both handlers do exactly one
//! thing: close the shadow descriptor.  Either the signal interrupts the
//! blocked `read()` with `EINTR`, or it arrives before we enter `read()` and
//! the read fails with `EBADF`.  The real read end is never touched by a
//! handler.
//!
//! Only one acquisition may be in flight per process.

use lazy_static::lazy_static;
use libc::c_int;
use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::stat::Mode;
use nix::unistd;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, TryLockError};
use std::time::Duration;

use super::env;
use super::error::{TokenPoolError, TokenPoolErrorKind};
use super::helpers::{self, IntervalTimer, IntervalTimerValue};

/// How long an acquisition may wait on a pipe that looked readable.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);

/// The byte GNU make writes for each token.
pub const DEFAULT_TOKEN: u8 = b'+';

/// The shadow descriptor of the acquisition in flight, or -1.
///
/// Whoever swaps a valid descriptor out of this slot owns closing it, so it is
/// closed exactly once whether a handler or the normal path gets there first.
static SHADOW_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn close_shadow_fd(_: c_int) {
    let fd = SHADOW_FD.swap(-1, Ordering::SeqCst);
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

/// No `SA_RESTART`: the blocked read must see `EINTR`.
fn shadow_action() -> SigAction {
    SigAction::new(
        SigHandler::Handler(close_shadow_fd),
        SaFlags::empty(),
        SigSet::empty(),
    )
}

#[derive(Default)]
struct AlarmRegistration {
    users: usize,
    previous: Option<SigAction>,
}

lazy_static! {
    static ref ALARM_HANDLER: Mutex<AlarmRegistration> =
        Mutex::new(AlarmRegistration::default());
    /// Held from storing the shadow descriptor until it is closed.
    static ref ACQUIRE_LOCK: Mutex<()> = Mutex::new(());
}

/// Point `SIGALRM` at `close_shadow_fd`, saving whatever was there for the
/// first user.
fn install_alarm_handler() -> nix::Result<()> {
    let mut reg = ALARM_HANDLER.lock().unwrap_or_else(|e| e.into_inner());
    if reg.users == 0 {
        let old = unsafe { signal::sigaction(Signal::SIGALRM, &shadow_action()) }?;
        reg.previous = Some(old);
    }
    reg.users += 1;
    Ok(())
}

/// Undo one `install_alarm_handler`. The last user puts back the handler that
/// was registered before the first.
fn restore_alarm_handler() -> nix::Result<()> {
    let mut reg = ALARM_HANDLER.lock().unwrap_or_else(|e| e.into_inner());
    debug_assert!(reg.users > 0);
    reg.users = reg.users.saturating_sub(1);
    if reg.users == 0 {
        if let Some(old) = reg.previous.take() {
            unsafe { signal::sigaction(Signal::SIGALRM, &old) }?;
        }
    }
    Ok(())
}

/// The outcome of one acquisition attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Acquire {
    /// A byte was removed from the pipe and now belongs to the caller.
    Token(u8),
    /// The pipe had nothing to read.
    Empty,
    /// Every write end of the pipe is closed.
    EndOfStream,
    /// The timer expired or a child exited, before or during the read.
    Interrupted,
    /// A system call used to attempt the read failed.
    Failed(Errno),
}

impl Acquire {
    /// Collapse the outcome to "token or no token".
    #[inline]
    pub fn token(self) -> Option<u8> {
        match self {
            Acquire::Token(b) => Some(b),
            _ => None,
        }
    }
}

/// The current process's view of a jobserver pipe.
///
/// A new transport is unattached. [`create_pool`](PoolTransport::create_pool),
/// [`parse_auth`](PoolTransport::parse_auth), [`attach`](PoolTransport::attach)
/// or [`open_fifo`](PoolTransport::open_fifo) attach it; dropping or
/// [`close`](PoolTransport::close)-ing it closes both descriptors.
///
/// The signal handlers and the shadow descriptor slot are process-wide, so
/// only one acquisition runs at a time across every transport in the
/// process. An acquisition that finds another one in flight on a different
/// thread gives up with [`Acquire::Interrupted`] instead of waiting.
#[derive(Debug)]
pub struct PoolTransport {
    fds: Option<(RawFd, RawFd)>,
    fifo: Option<PathBuf>,
    alarm_installed: bool,
    acquire_timeout: Duration,
}

impl PoolTransport {
    #[inline]
    pub fn new() -> PoolTransport {
        PoolTransport {
            fds: None,
            fifo: None,
            alarm_installed: false,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Bound how long a single acquisition may wait. A zero timer would
    /// disarm rather than fire, so values under 1ms are raised to 1ms.
    pub fn set_acquire_timeout(&mut self, d: Duration) -> &mut Self {
        self.acquire_timeout = std::cmp::max(d, Duration::from_millis(1));
        self
    }

    #[inline]
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.fds.is_some()
    }

    /// The `(read, write)` descriptors, if attached.
    #[inline]
    pub fn fds(&self) -> Option<(RawFd, RawFd)> {
        self.fds
    }

    /// The descriptor that becomes readable when a token may be available.
    #[inline]
    pub fn monitor_fd(&self) -> Option<RawFd> {
        self.fds.map(|(r, _)| r)
    }

    /// The named pipe this transport opened, if any.
    #[inline]
    pub fn fifo(&self) -> Option<&Path> {
        self.fifo.as_deref()
    }

    /// The credential string to hand to child processes.
    pub fn auth(&self) -> Option<String> {
        if let Some(path) = &self.fifo {
            return Some(format!("--jobserver-auth=fifo:{}", path.display()));
        }
        self.fds
            .map(|(r, w)| format!("--jobserver-auth={},{}", r, w))
    }

    /// Create a new pool holding `parallelism` tokens and attach to it.
    ///
    /// Returns the credential string for child processes. The descriptors are
    /// left inheritable.
    pub fn create_pool(&mut self, parallelism: usize) -> Result<String, TokenPoolError> {
        self.ensure_unattached()?;
        let (r, w) = unistd::pipe()?;
        let filled = (0..parallelism).try_for_each(|_| write_token(w, DEFAULT_TOKEN));
        if let Err(e) = filled.and_then(|_| install_alarm_handler().map_err(Into::into)) {
            let _ = unistd::close(w);
            let _ = unistd::close(r);
            return Err(e);
        }
        self.alarm_installed = true;
        self.fds = Some((r, w));
        log_debug!("created pool with {} tokens on fds {},{}", parallelism, r, w);
        Ok(format!("--jobserver-auth={},{}", r, w))
    }

    /// Attach to a pool described by `"<name>=<read>,<write>"`.
    ///
    /// Only the two numbers matter, but the name must be non-empty. On
    /// failure nothing changes.
    pub fn parse_auth(&mut self, auth: &str) -> Result<(), TokenPoolError> {
        let malformed = || {
            log_debug!("failed to parse fds from jobserver arg: {}", auth);
            TokenPoolError::from(TokenPoolErrorKind::MalformedAuth(String::from(auth)))
        };
        let (name, pair) = auth.split_once('=').ok_or_else(malformed)?;
        if name.is_empty() {
            return Err(malformed());
        }
        let (r, w) = env::parse_fd_pair(pair).ok_or_else(malformed)?;
        self.attach(r, w)
    }

    /// Attach to a pool through two already-open descriptors. The transport
    /// owns them from now on.
    pub fn attach(&mut self, r: RawFd, w: RawFd) -> Result<(), TokenPoolError> {
        self.ensure_unattached()?;
        for &fd in &[r, w] {
            if !helpers::fd_exists(fd) {
                return Err(TokenPoolErrorKind::InvalidDescriptor(fd).into());
            }
        }
        install_alarm_handler()?;
        self.alarm_installed = true;
        self.fds = Some((r, w));
        log_debug!("attached to pool on fds {},{}", r, w);
        Ok(())
    }

    /// Attach to a named-pipe pool, as created by GNU make 4.4.
    pub fn open_fifo<P: AsRef<Path>>(&mut self, path: P) -> Result<(), TokenPoolError> {
        self.ensure_unattached()?;
        let path = path.as_ref();
        // Opening read-write never blocks waiting for a peer.
        let r = fcntl::open(path, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())?;
        let w = match fcntl::open(path, OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty()) {
            Ok(w) => w,
            Err(e) => {
                let _ = unistd::close(r);
                return Err(e.into());
            }
        };
        if let Err(e) = self.attach(r, w) {
            let _ = unistd::close(w);
            let _ = unistd::close(r);
            return Err(e);
        }
        self.fifo = Some(path.to_path_buf());
        Ok(())
    }

    fn ensure_unattached(&self) -> Result<(), TokenPoolError> {
        if self.is_attached() {
            return Err(TokenPoolError::new(String::from(
                "token pool is already attached",
            )));
        }
        Ok(())
    }

    /// Take one token from the pool if one is available right now.
    ///
    /// Never blocks for longer than the acquire timeout, and never takes
    /// more than one token.
    #[inline]
    pub fn acquire_token(&self) -> Option<u8> {
        self.try_acquire().token()
    }

    /// Like [`acquire_token`](PoolTransport::acquire_token), but reports why
    /// no token was taken.
    pub fn try_acquire(&self) -> Acquire {
        let rfd = match self.fds {
            Some((r, _)) => r,
            None => return Acquire::Failed(Errno::EBADF),
        };
        // First check if read() would succeed without blocking.
        match helpers::poll_readable(rfd, Some(Duration::from_secs(0))) {
            Ok(true) => {}
            Ok(false) => return Acquire::Empty,
            Err(e) => return Acquire::Failed(e),
        }
        let _guard = match ACQUIRE_LOCK.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                log_debug2!("acquire: another acquisition is in flight");
                return Acquire::Interrupted;
            }
        };
        // The byte may be gone before we read it. Read from a duplicate
        // that a signal handler can close without harming rfd.
        let dup_fd = match unistd::dup(rfd) {
            Ok(fd) => fd,
            Err(e) => return Acquire::Failed(e),
        };
        SHADOW_FD.store(dup_fd, Ordering::SeqCst);
        let result = read_shadow(dup_fd, self.acquire_timeout);
        close_shadow_fd(0);
        match result {
            Acquire::Token(b) => log_debug2!("acquire: read ok, token = {}", b),
            other => log_debug2!("acquire: no token ({:?})", other),
        }
        result
    }

    /// Return one token to the pool. `None` writes [`DEFAULT_TOKEN`].
    ///
    /// May block if the pipe is full, which only happens if more tokens were
    /// released than acquired.
    pub fn release_token<T: Into<Option<u8>>>(&self, token: T) -> Result<(), TokenPoolError> {
        let (_, wfd) = self.fds.ok_or(TokenPoolErrorKind::NotAttached)?;
        let token = token.into().unwrap_or(DEFAULT_TOKEN);
        write_token(wfd, token)?;
        log_debug2!("release: token = {}", token);
        Ok(())
    }

    /// Close both descriptors and put back the `SIGALRM` handler, reporting
    /// the first error.
    pub fn close(mut self) -> Result<(), TokenPoolError> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), TokenPoolError> {
        let mut first_err: Option<TokenPoolError> = None;
        if let Some((r, w)) = self.fds.take() {
            for &fd in &[r, w] {
                if let Err(e) = unistd::close(fd) {
                    first_err.get_or_insert(e.into());
                }
            }
        }
        self.fifo = None;
        if self.alarm_installed {
            self.alarm_installed = false;
            if let Err(e) = restore_alarm_handler() {
                first_err.get_or_insert(e.into());
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for PoolTransport {
    #[inline]
    fn default() -> PoolTransport {
        PoolTransport::new()
    }
}

impl Drop for PoolTransport {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

/// Read one byte from the shadow descriptor with the handlers armed.
///
/// Possible results of the read:
///
/// 1. token read                                -> `Token`
/// 2. pipe closed                               -> `EndOfStream`
/// 3. alarm expires                             -> `EINTR`
/// 4. child exits                               -> `EINTR`
/// 5. alarm expired before entering read()      -> `EBADF`
/// 6. child exited before entering read()       -> `EBADF`
/// 7. child exited before handler is installed  -> one of 1-3
fn read_shadow(dup_fd: RawFd, timeout: Duration) -> Acquire {
    let old_chld = match unsafe { signal::sigaction(Signal::SIGCHLD, &shadow_action()) } {
        Ok(old) => old,
        Err(e) => return Acquire::Failed(e),
    };
    let result = match helpers::set_interval_timer(
        IntervalTimer::Real,
        &IntervalTimerValue::one_shot(timeout),
    ) {
        Ok(()) => {
            let mut buf = [0u8; 1];
            let read_result = unistd::read(dup_fd, &mut buf);
            // Disarm before anything else so a late alarm can't hit the next
            // acquisition.
            if let Err(e) =
                helpers::set_interval_timer(IntervalTimer::Real, &IntervalTimerValue::default())
            {
                log_debug!("acquire: disarming timer: {}\n", e);
            }
            match read_result {
                Ok(0) => Acquire::EndOfStream,
                Ok(_) => Acquire::Token(buf[0]),
                Err(Errno::EINTR) | Err(Errno::EBADF) => Acquire::Interrupted,
                Err(Errno::EAGAIN) => Acquire::Empty,
                Err(e) => Acquire::Failed(e),
            }
        }
        Err(e) => Acquire::Failed(e),
    };
    if let Err(e) = unsafe { signal::sigaction(Signal::SIGCHLD, &old_chld) } {
        log_debug!("acquire: restoring SIGCHLD handler: {}\n", e);
    }
    result
}

/// Write a single token, retrying only if interrupted before writing.
fn write_token(fd: RawFd, token: u8) -> Result<(), TokenPoolError> {
    loop {
        match unistd::write(fd, &[token]) {
            Ok(n) if n > 0 => return Ok(()),
            Ok(_) => {
                return Err(TokenPoolError::new(format!(
                    "short write of token to fd {}",
                    fd
                )))
            }
            // write got interrupted - retry
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{in_child, signal_lock};
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::ptr;
    use std::time::Instant;

    fn current_alarm_handler() -> libc::sighandler_t {
        unsafe {
            let mut old: libc::sigaction = std::mem::zeroed();
            assert_eq!(libc::sigaction(libc::SIGALRM, ptr::null(), &mut old), 0);
            old.sa_sigaction
        }
    }

    fn is_credential(auth: &str) -> bool {
        match auth.split_once('=') {
            Some((name, pair)) => {
                !name.contains('=')
                    && pair
                        .split_once(',')
                        .map(|(a, b)| {
                            !a.is_empty()
                                && !b.is_empty()
                                && a.bytes().all(|c| c.is_ascii_digit())
                                && b.bytes().all(|c| c.is_ascii_digit())
                        })
                        .unwrap_or(false)
            }
            None => false,
        }
    }

    #[test]
    fn create_acquire_release_cycle() {
        let _lock = signal_lock();
        let mut pool = PoolTransport::new();
        let auth = pool.create_pool(4).unwrap();
        assert!(is_credential(&auth), "auth = {:?}", auth);
        assert_eq!(pool.auth().as_deref(), Some(auth.as_str()));

        for i in 0..4 {
            assert_eq!(pool.acquire_token(), Some(DEFAULT_TOKEN), "token {}", i);
        }
        assert_eq!(pool.try_acquire(), Acquire::Empty);
        for _ in 0..4 {
            pool.release_token(None).unwrap();
        }
        for i in 0..4 {
            assert!(pool.acquire_token().is_some(), "token {} after release", i);
        }
        assert_eq!(pool.acquire_token(), None);
        pool.close().unwrap();
    }

    #[test]
    fn release_then_acquire_round_trips_value() {
        let _lock = signal_lock();
        let mut pool = PoolTransport::new();
        pool.create_pool(0).unwrap();
        pool.release_token(43).unwrap();
        assert_eq!(pool.acquire_token(), Some(43));
        pool.release_token(b'x').unwrap();
        assert_eq!(pool.acquire_token(), Some(b'x'));
    }

    #[test]
    fn empty_pool_does_not_block() {
        let _lock = signal_lock();
        let mut pool = PoolTransport::new();
        pool.create_pool(0).unwrap();
        let start = Instant::now();
        assert_eq!(pool.acquire_token(), None);
        assert!(start.elapsed() < DEFAULT_ACQUIRE_TIMEOUT);
    }

    #[test]
    fn closed_writer_is_end_of_stream() {
        let _lock = signal_lock();
        let (r, w) = unistd::pipe().unwrap();
        let w2 = unistd::dup(w).unwrap();
        let mut pool = PoolTransport::new();
        pool.attach(r, w).unwrap();
        // Close every write end so the reader sees EOF.
        unistd::close(w2).unwrap();
        let (_, w) = pool.fds().unwrap();
        unistd::close(w).unwrap();
        pool.fds = Some((r, -1));
        assert_eq!(pool.try_acquire(), Acquire::EndOfStream);
        assert!(pool.release_token(None).is_err());
    }

    #[test]
    fn malformed_credentials_rejected() {
        let _lock = signal_lock();
        for bad in &["fifo", "x=5", "x=-1,-1", "=3,4", "x=3;4", ""] {
            let mut pool = PoolTransport::new();
            assert!(pool.parse_auth(bad).is_err(), "{:?}", bad);
            assert!(!pool.is_attached(), "{:?}", bad);
        }
    }

    #[test]
    fn closed_descriptors_rejected() {
        let _lock = signal_lock();
        // High enough that no other test has them open.
        let (r, w) = (9998, 9999);
        let mut pool = PoolTransport::new();
        let err = pool.parse_auth(&format!("x={},{}", r, w)).unwrap_err();
        assert_eq!(err.kind(), &TokenPoolErrorKind::InvalidDescriptor(r));
        assert!(!pool.is_attached());
    }

    #[test]
    fn parse_auth_attaches_to_inherited_pipe() {
        let _lock = signal_lock();
        let mut parent = PoolTransport::new();
        parent.create_pool(1).unwrap();
        let (r, w) = parent.fds().unwrap();
        let auth = format!(
            "--jobserver-auth={},{}",
            unistd::dup(r).unwrap(),
            unistd::dup(w).unwrap()
        );
        let mut child = PoolTransport::new();
        child.parse_auth(&auth).unwrap();
        assert_eq!(child.acquire_token(), Some(DEFAULT_TOKEN));
        assert_eq!(parent.acquire_token(), None);
        child.release_token(None).unwrap();
        assert_eq!(parent.acquire_token(), Some(DEFAULT_TOKEN));
    }

    #[test]
    fn attach_twice_fails() {
        let _lock = signal_lock();
        let mut pool = PoolTransport::new();
        pool.create_pool(1).unwrap();
        assert!(pool.create_pool(1).is_err());
        let (r, w) = pool.fds().unwrap();
        assert!(pool.attach(r, w).is_err());
        assert_eq!(pool.fds(), Some((r, w)));
    }

    #[test]
    fn unattached_transport() {
        let pool = PoolTransport::new();
        assert_eq!(pool.monitor_fd(), None);
        assert_eq!(pool.auth(), None);
        assert_eq!(pool.acquire_token(), None);
        assert_eq!(
            pool.release_token(None).unwrap_err().kind(),
            &TokenPoolErrorKind::NotAttached
        );
    }

    #[test]
    fn acquire_timeout_has_floor() {
        let mut pool = PoolTransport::new();
        pool.set_acquire_timeout(Duration::from_secs(0));
        assert_eq!(pool.acquire_timeout(), Duration::from_millis(1));
        pool.set_acquire_timeout(Duration::from_millis(250));
        assert_eq!(pool.acquire_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn alarm_handler_restored_once_by_last_user() {
        let _lock = signal_lock();
        unsafe { signal::signal(Signal::SIGALRM, SigHandler::SigIgn) }.unwrap();
        {
            let mut a = PoolTransport::new();
            a.create_pool(0).unwrap();
            assert_eq!(current_alarm_handler(), close_shadow_fd as libc::sighandler_t);
            let (r, w) = a.fds().unwrap();
            let mut b = PoolTransport::new();
            b.attach(unistd::dup(r).unwrap(), unistd::dup(w).unwrap())
                .unwrap();
            a.close().unwrap();
            assert_eq!(current_alarm_handler(), close_shadow_fd as libc::sighandler_t);
            drop(b);
        }
        assert_eq!(current_alarm_handler(), libc::SIG_IGN);
        unsafe { signal::signal(Signal::SIGALRM, SigHandler::SigDfl) }.unwrap();
    }

    #[test]
    fn acquire_leaves_no_descriptor_behind() {
        let _lock = signal_lock();
        assert!(in_child(|| {
            let mut pool = PoolTransport::new();
            if pool.create_pool(2).is_err() {
                return false;
            }
            // The lowest free descriptor is what dup() will hand out.
            let next = match pool.monitor_fd().map(unistd::dup) {
                Some(Ok(fd)) => fd,
                _ => return false,
            };
            let _ = unistd::close(next);
            let got = pool.acquire_token() == Some(DEFAULT_TOKEN);
            got && !helpers::fd_exists(next)
                && SHADOW_FD.load(Ordering::SeqCst) == -1
                && pool.monitor_fd().map_or(false, helpers::fd_exists)
        }));
    }

    #[test]
    fn alarm_interrupts_blocked_read() {
        let _lock = signal_lock();
        assert!(in_child(|| {
            // Pretend the token vanished between poll and read: the pipe is
            // empty but we read anyway.
            let (r, _w) = match unistd::pipe() {
                Ok(p) => p,
                Err(_) => return false,
            };
            if unsafe { signal::sigaction(Signal::SIGALRM, &shadow_action()) }.is_err() {
                return false;
            }
            let dup_fd = match unistd::dup(r) {
                Ok(fd) => fd,
                Err(_) => return false,
            };
            SHADOW_FD.store(dup_fd, Ordering::SeqCst);
            let start = Instant::now();
            let result = read_shadow(dup_fd, Duration::from_millis(50));
            close_shadow_fd(0);
            result == Acquire::Interrupted
                && start.elapsed() < Duration::from_secs(5)
                && !helpers::fd_exists(dup_fd)
                && helpers::fd_exists(r)
        }));
    }

    #[test]
    fn child_exit_interrupts_blocked_read() {
        let _lock = signal_lock();
        assert!(in_child(|| {
            let (r, _w) = match unistd::pipe() {
                Ok(p) => p,
                Err(_) => return false,
            };
            if unsafe { signal::sigaction(Signal::SIGALRM, &shadow_action()) }.is_err() {
                return false;
            }
            match unsafe { unistd::fork() } {
                Ok(unistd::ForkResult::Child) => unsafe {
                    libc::usleep(20_000);
                    libc::_exit(0)
                },
                Ok(unistd::ForkResult::Parent { .. }) => {}
                Err(_) => return false,
            }
            let dup_fd = match unistd::dup(r) {
                Ok(fd) => fd,
                Err(_) => return false,
            };
            SHADOW_FD.store(dup_fd, Ordering::SeqCst);
            let start = Instant::now();
            let result = read_shadow(dup_fd, Duration::from_secs(5));
            close_shadow_fd(0);
            result == Acquire::Interrupted && start.elapsed() < Duration::from_secs(4)
        }));
    }

    #[test]
    fn racing_signals_close_shadow_once() {
        let _lock = signal_lock();
        assert!(in_child(|| {
            let mut pool = PoolTransport::new();
            if pool.create_pool(1).is_err() {
                return false;
            }
            let (r, _) = match pool.fds() {
                Some(fds) => fds,
                None => return false,
            };
            let dup_fd = match unistd::dup(r) {
                Ok(fd) => fd,
                Err(_) => return false,
            };
            SHADOW_FD.store(dup_fd, Ordering::SeqCst);
            // Timer fires, then a child exits, both before the read starts.
            if unsafe { libc::raise(libc::SIGALRM) } != 0 {
                return false;
            }
            let closed_by_alarm = !helpers::fd_exists(dup_fd);
            close_shadow_fd(libc::SIGCHLD);
            let result = read_shadow(dup_fd, Duration::from_millis(50));
            close_shadow_fd(0);
            // The token is still in the pipe for the next attempt.
            closed_by_alarm
                && result == Acquire::Interrupted
                && SHADOW_FD.load(Ordering::SeqCst) == -1
                && helpers::fd_exists(r)
                && pool.acquire_token() == Some(DEFAULT_TOKEN)
        }));
    }

    extern "C" fn ignore_signal(_: c_int) {}

    fn open_fd_count() -> Option<usize> {
        std::fs::read_dir("/proc/self/fd").ok().map(|d| d.count())
    }

    #[test]
    fn acquire_restores_child_handler_and_disarms_timer() {
        let _lock = signal_lock();
        let custom = SigAction::new(
            SigHandler::Handler(ignore_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let old = unsafe { signal::sigaction(Signal::SIGCHLD, &custom) }.unwrap();
        let mut pool = PoolTransport::new();
        pool.create_pool(1).unwrap();
        assert_eq!(pool.acquire_token(), Some(DEFAULT_TOKEN));

        let current = unsafe {
            let mut act: libc::sigaction = std::mem::zeroed();
            assert_eq!(libc::sigaction(libc::SIGCHLD, ptr::null(), &mut act), 0);
            act.sa_sigaction
        };
        let timer = unsafe {
            let mut val: libc::itimerval = std::mem::zeroed();
            assert_eq!(libc::getitimer(libc::ITIMER_REAL, &mut val), 0);
            val
        };
        unsafe { signal::sigaction(Signal::SIGCHLD, &old) }.unwrap();
        assert_eq!(current, ignore_signal as libc::sighandler_t);
        assert_eq!(timer.it_value.tv_sec, 0);
        assert_eq!(timer.it_value.tv_usec, 0);
    }

    #[test]
    fn concurrent_acquires_do_not_leak_descriptors() {
        const ROUNDS: usize = 2000;

        let _lock = signal_lock();
        // Threads are spawned in a forked child so the descriptor count
        // isn't disturbed by other tests.
        assert!(in_child(|| {
            let pools: Vec<PoolTransport> = (0..2)
                .filter_map(|_| {
                    let mut pool = PoolTransport::new();
                    pool.create_pool(1).ok().map(|_| pool)
                })
                .collect();
            if pools.len() != 2 {
                return false;
            }
            let before = match open_fd_count() {
                Some(n) => n,
                None => return false,
            };
            let workers: Vec<_> = pools
                .into_iter()
                .map(|pool| {
                    std::thread::spawn(move || {
                        let mut ok = true;
                        for _ in 0..ROUNDS {
                            match pool.try_acquire() {
                                Acquire::Token(b) => {
                                    ok &= b == DEFAULT_TOKEN;
                                    ok &= pool.release_token(b).is_ok();
                                }
                                Acquire::Interrupted => {}
                                _ => ok = false,
                            }
                        }
                        (pool, ok)
                    })
                })
                .collect();
            let mut pools = Vec::new();
            let mut ok = true;
            for w in workers {
                match w.join() {
                    Ok((pool, worker_ok)) => {
                        ok &= worker_ok;
                        pools.push(pool);
                    }
                    Err(_) => return false,
                }
            }
            ok && open_fd_count() == Some(before)
                && SHADOW_FD.load(Ordering::SeqCst) == -1
                && pools.iter().all(|p| p.acquire_token() == Some(DEFAULT_TOKEN))
        }));
    }

    #[test]
    fn tokens_are_conserved_across_clients() {
        const TOKENS: usize = 4;
        const CLIENTS: usize = 3;

        let _lock = signal_lock();
        let mut creator = PoolTransport::new();
        creator.create_pool(TOKENS).unwrap();
        let (r, w) = creator.fds().unwrap();
        let clients: Vec<PoolTransport> = (0..CLIENTS)
            .map(|i| {
                let mut c = PoolTransport::new();
                c.parse_auth(&format!(
                    "client{}={},{}",
                    i,
                    unistd::dup(r).unwrap(),
                    unistd::dup(w).unwrap()
                ))
                .unwrap();
                c
            })
            .collect();

        let mut rng = StdRng::seed_from_u64(0x6d616b65);
        let mut held: Vec<Vec<u8>> = vec![Vec::new(); CLIENTS];
        for _ in 0..500 {
            let i = rng.gen_range(0..CLIENTS);
            let out: usize = held.iter().map(Vec::len).sum();
            if rng.gen_bool(0.5) {
                match clients[i].acquire_token() {
                    Some(b) => held[i].push(b),
                    None => assert_eq!(out, TOKENS, "token refused with {} out", out),
                }
            } else if let Some(b) = held[i].pop() {
                clients[i].release_token(b).unwrap();
            }
            let out: usize = held.iter().map(Vec::len).sum();
            assert!(out <= TOKENS, "{} tokens checked out", out);
        }
        for (c, h) in clients.iter().zip(held.iter_mut()) {
            for b in h.drain(..) {
                c.release_token(b).unwrap();
            }
        }
        drop(clients);
        let mut remaining = 0;
        while creator.acquire_token().is_some() {
            remaining += 1;
        }
        assert_eq!(remaining, TOKENS);
    }
}
