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

use std::os::unix::io::RawFd;

use super::env::{Env, JobServerAuth, MakeFlags};
use super::error::{TokenPoolError, TokenPoolErrorKind};
use super::helpers;
use super::posix::{Acquire, PoolTransport, DEFAULT_TOKEN};

/// A source of job tokens.
///
/// `Disabled` stands in when there is no jobserver: every acquisition
/// succeeds and releases do nothing.
#[derive(Debug)]
pub enum TokenPool {
    Pipe(PoolTransport),
    Disabled,
}

impl TokenPool {
    /// Attach to the jobserver named by the environment's make flags.
    ///
    /// Fails with `NoJobServer` if make did not advertise one or asked for
    /// serial execution.
    pub fn from_env(env: &Env) -> Result<TokenPool, TokenPoolError> {
        let flags = env.make_flags()?;
        TokenPool::from_make_flags(&flags, env)
    }

    pub fn from_make_flags(flags: &MakeFlags, env: &Env) -> Result<TokenPool, TokenPoolError> {
        let auth = match &flags.auth {
            Some(auth) if !flags.is_serial() => auth,
            _ => return Err(TokenPoolErrorKind::NoJobServer.into()),
        };
        let mut transport = PoolTransport::new();
        transport.set_acquire_timeout(env.acquire_timeout);
        match auth {
            JobServerAuth::Fds(r, w) => {
                check_inherited_fds(*r, *w)?;
                transport.attach(*r, *w)?;
            }
            JobServerAuth::Fifo(path) => {
                transport.open_fifo(path)?;
                let (r, _) = transport.fds().unwrap_or((-1, -1));
                if !helpers::is_fifo(r)? {
                    return Err(TokenPoolErrorKind::NotAPipe(r).into());
                }
            }
        }
        Ok(TokenPool::Pipe(transport))
    }

    /// Create a fresh pipe pool holding `parallelism` tokens.
    pub fn create(parallelism: usize, env: &Env) -> Result<TokenPool, TokenPoolError> {
        let mut transport = PoolTransport::new();
        transport.set_acquire_timeout(env.acquire_timeout);
        transport.create_pool(parallelism)?;
        Ok(TokenPool::Pipe(transport))
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        matches!(self, TokenPool::Pipe(_))
    }

    pub fn try_acquire(&self) -> Acquire {
        match self {
            TokenPool::Pipe(t) => t.try_acquire(),
            TokenPool::Disabled => Acquire::Token(DEFAULT_TOKEN),
        }
    }

    #[inline]
    pub fn acquire(&self) -> Option<u8> {
        self.try_acquire().token()
    }

    pub fn release<T: Into<Option<u8>>>(&self, token: T) -> Result<(), TokenPoolError> {
        match self {
            TokenPool::Pipe(t) => t.release_token(token),
            TokenPool::Disabled => Ok(()),
        }
    }

    pub fn monitor_fd(&self) -> Option<RawFd> {
        match self {
            TokenPool::Pipe(t) => t.monitor_fd(),
            TokenPool::Disabled => None,
        }
    }

    pub fn auth(&self) -> Option<String> {
        match self {
            TokenPool::Pipe(t) => t.auth(),
            TokenPool::Disabled => None,
        }
    }

    pub fn transport(&self) -> Option<&PoolTransport> {
        match self {
            TokenPool::Pipe(t) => Some(t),
            TokenPool::Disabled => None,
        }
    }
}

/// Make sure inherited descriptors really are the two ends of a pipe.
fn check_inherited_fds(r: RawFd, w: RawFd) -> Result<(), TokenPoolError> {
    for &fd in &[r, w] {
        if !helpers::fd_exists(fd) {
            log_err!("broken --jobserver-auth from parent process:\n");
            log_err!("  using GNU make? prefix your Makefile rule with \"+\"\n");
            return Err(TokenPoolErrorKind::InvalidDescriptor(fd).into());
        }
        if !helpers::is_fifo(fd)? {
            return Err(TokenPoolErrorKind::NotAPipe(fd).into());
        }
    }
    if !helpers::access_mode(r)?.read {
        return Err(TokenPoolErrorKind::WrongAccessMode(r).into());
    }
    if !helpers::access_mode(w)?.write {
        return Err(TokenPoolErrorKind::WrongAccessMode(w).into());
    }
    Ok(())
}
