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

use nix::errno::Errno;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::Duration;

use super::env::Env;
use super::error::{TokenPoolError, TokenPoolErrorKind};
use super::helpers;
use super::pool::TokenPool;
use super::posix::Acquire;

/// A jobserver participant that remembers which tokens it holds.
///
/// Every process implicitly owns one job slot, so a client running `-jN`
/// only ever holds up to N-1 tokens from the pipe.  Tokens still held when
/// the client is dropped are written back.
///
/// Acquisitions are serialized process-wide. When several threads acquire at
/// once, all but one come back without a token and should retry.
#[derive(Debug)]
pub struct JobClient {
    pool: TokenPool,
    held: Vec<u8>,
    max_jobs: Option<u32>,
    max_load: Option<f64>,
}

impl JobClient {
    /// Join the jobserver advertised in the environment.
    ///
    /// Takes and returns one token to make sure the pipe actually works.
    pub fn from_env(env: &Env) -> Result<JobClient, TokenPoolError> {
        let flags = env.make_flags()?;
        let pool = TokenPool::from_make_flags(&flags, env)?;
        match pool.try_acquire() {
            Acquire::Token(b) => pool.release(b)?,
            Acquire::Empty | Acquire::Interrupted => {}
            Acquire::EndOfStream => {
                return Err(TokenPoolError::with_msg(
                    TokenPoolErrorKind::NoJobServer,
                    String::from("jobserver pipe is closed"),
                ))
            }
            Acquire::Failed(Errno::EBADF) => return Err(TokenPoolErrorKind::NoJobServer.into()),
            Acquire::Failed(e) => return Err(e.into()),
        }
        log_debug!(
            "joined jobserver {} (-j{})",
            pool.auth().unwrap_or_default(),
            flags
                .max_jobs
                .map_or_else(String::new, |n| n.to_string())
        );
        Ok(JobClient {
            pool,
            held: Vec::new(),
            max_jobs: flags.max_jobs,
            max_load: flags.max_load,
        })
    }

    /// Like [`from_env`](JobClient::from_env), but falls back to a disabled
    /// pool when there is no usable jobserver to join. Only operating system
    /// failures are returned.
    pub fn from_env_or_disabled(env: &Env) -> Result<JobClient, TokenPoolError> {
        match JobClient::from_env(env) {
            Ok(client) => Ok(client),
            Err(e) => match e.kind() {
                TokenPoolErrorKind::NoJobServer => {
                    log_debug!("no jobserver: {}\n", e);
                    Ok(JobClient::disabled())
                }
                TokenPoolErrorKind::Os(_) => Err(e),
                _ => {
                    log_warn!("{}; running without a jobserver\n", e);
                    Ok(JobClient::disabled())
                }
            },
        }
    }

    /// Start a new jobserver allowing `max_jobs` concurrent jobs, counting
    /// the caller's own.
    pub fn create(max_jobs: u32, env: &Env) -> Result<JobClient, TokenPoolError> {
        let max_jobs = max_jobs.max(1);
        let pool = TokenPool::create((max_jobs - 1) as usize, env)?;
        Ok(JobClient {
            pool,
            held: Vec::new(),
            max_jobs: Some(max_jobs),
            max_load: None,
        })
    }

    pub fn disabled() -> JobClient {
        JobClient {
            pool: TokenPool::Disabled,
            held: Vec::new(),
            max_jobs: None,
            max_load: None,
        }
    }

    #[inline]
    pub fn pool(&self) -> &TokenPool {
        &self.pool
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.pool.is_enabled()
    }

    /// Number of tokens currently held.
    #[inline]
    pub fn held(&self) -> usize {
        self.held.len()
    }

    #[inline]
    pub fn max_jobs(&self) -> Option<u32> {
        self.max_jobs
    }

    #[inline]
    pub fn max_load(&self) -> Option<f64> {
        self.max_load
    }

    /// Take a token if one is available right now.
    pub fn acquire(&mut self) -> Option<u8> {
        let token = self.pool.acquire()?;
        if self.pool.is_enabled() {
            self.held.push(token);
        }
        Some(token)
    }

    /// Return the most recently acquired token. Returns `false` if none is
    /// held.
    pub fn release(&mut self) -> Result<bool, TokenPoolError> {
        match self.held.pop() {
            Some(token) => {
                if let Err(e) = self.pool.release(token) {
                    self.held.push(token);
                    return Err(e);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Return every held token, stopping at the first failure.
    pub fn release_all(&mut self) -> Result<(), TokenPoolError> {
        while self.release()? {}
        Ok(())
    }

    /// Wait up to `timeout` for the pool to look non-empty. The pool may be
    /// empty again by the time the caller acquires.
    pub fn wait_for_token(&self, timeout: Duration) -> Result<bool, TokenPoolError> {
        let fd = match self.pool.monitor_fd() {
            Some(fd) => fd,
            None => return Ok(true),
        };
        match helpers::poll_readable(fd, Some(timeout)) {
            Ok(ready) => Ok(ready),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// The `MAKEFLAGS` value that hands this jobserver to a child.
    pub fn makeflags(&self) -> Option<String> {
        let auth = self.pool.auth()?;
        let jobs = match self.max_jobs {
            Some(n) => format!("-j{}", n),
            None => String::from("-j"),
        };
        let mut flags = format!(" {} {}", jobs, auth);
        if !auth.contains("fifo:") {
            if let Some((r, w)) = self.pool.transport().and_then(|t| t.fds()) {
                // Older makes only understand this spelling.
                flags.push_str(&format!(" --jobserver-fds={},{}", r, w));
            }
        }
        if let Some(load) = self.max_load {
            flags.push_str(&format!(" -l{}", load));
        }
        Some(flags)
    }

    /// Set up `cmd` so the child joins this jobserver. A disabled client
    /// leaves `cmd` alone.
    ///
    /// A pipe pool's descriptors are inherited by the child. A FIFO pool's
    /// are not, since the child reopens the FIFO by path.
    pub fn configure(&self, cmd: &mut Command) {
        let flags = match self.makeflags() {
            Some(flags) => flags,
            None => return,
        };
        cmd.env_remove("CARGO_MAKEFLAGS");
        cmd.env("MAKEFLAGS", &flags);
        cmd.env("MFLAGS", &flags);
        let inherited = self
            .pool
            .transport()
            .filter(|t| t.fifo().is_none())
            .and_then(|t| t.fds());
        if let Some((r, w)) = inherited {
            unsafe {
                cmd.pre_exec(move || {
                    helpers::close_on_exec(r, false)?;
                    helpers::close_on_exec(w, false)?;
                    Ok(())
                });
            }
        }
    }
}

impl Drop for JobClient {
    fn drop(&mut self) {
        if let Err(e) = self.release_all() {
            log_warn!("returning {} tokens: {}\n", self.held.len(), e);
        }
    }
}
