// Copyright 2021 Ross Light
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
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::os::unix::io::RawFd;

/// The error type for the `tokenpool` crate.
#[derive(Debug)]
pub struct TokenPoolError {
    pub(crate) kind: TokenPoolErrorKind,
    pub(crate) msg: String,
}

impl TokenPoolError {
    /// Returns a generic error with the given message.
    #[inline]
    pub fn new(msg: String) -> TokenPoolError {
        TokenPoolError {
            kind: TokenPoolErrorKind::default(),
            msg,
        }
    }

    /// Returns an error of the given kind with a more specific message.
    #[inline]
    pub(crate) fn with_msg(kind: TokenPoolErrorKind, msg: String) -> TokenPoolError {
        TokenPoolError { kind, msg }
    }

    #[inline]
    pub fn kind(&self) -> &TokenPoolErrorKind {
        &self.kind
    }

    /// Returns the kind of the error if it is a `TokenPoolError`,
    /// or `Generic` otherwise.
    pub fn kind_of(e: &anyhow::Error) -> TokenPoolErrorKind {
        e.downcast_ref::<TokenPoolError>()
            .map(|e| e.kind.clone())
            .unwrap_or_default()
    }
}

impl Display for TokenPoolError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.msg, f)
    }
}

impl Error for TokenPoolError {}

impl From<TokenPoolErrorKind> for TokenPoolError {
    fn from(kind: TokenPoolErrorKind) -> TokenPoolError {
        TokenPoolError {
            msg: format!("{}", kind),
            kind,
        }
    }
}

impl From<Errno> for TokenPoolError {
    #[inline]
    fn from(e: Errno) -> TokenPoolError {
        TokenPoolErrorKind::Os(e).into()
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum TokenPoolErrorKind {
    Generic,
    /// No jobserver was advertised to this process (or it was told to run
    /// serially).
    NoJobServer,
    MalformedAuth(String),
    InvalidDescriptor(RawFd),
    NotAPipe(RawFd),
    WrongAccessMode(RawFd),
    /// An operation that needs a pool was called on an unattached transport.
    NotAttached,
    Os(Errno),
}

impl Default for TokenPoolErrorKind {
    #[inline]
    fn default() -> TokenPoolErrorKind {
        TokenPoolErrorKind::Generic
    }
}

impl Display for TokenPoolErrorKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            TokenPoolErrorKind::Generic => f.write_str("error"),
            TokenPoolErrorKind::NoJobServer => f.write_str("no jobserver in environment"),
            TokenPoolErrorKind::MalformedAuth(auth) => {
                write!(f, "malformed jobserver auth {:?}", auth)
            }
            TokenPoolErrorKind::InvalidDescriptor(fd) => {
                write!(f, "file descriptor {} is not open", fd)
            }
            TokenPoolErrorKind::NotAPipe(fd) => write!(f, "file descriptor {} is not a pipe", fd),
            TokenPoolErrorKind::WrongAccessMode(fd) => {
                write!(f, "file descriptor {} has the wrong access mode", fd)
            }
            TokenPoolErrorKind::NotAttached => f.write_str("token pool is not attached"),
            TokenPoolErrorKind::Os(e) => write!(f, "{}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_of_foreign_error_is_generic() {
        let e = anyhow::anyhow!("something else");
        assert_eq!(TokenPoolError::kind_of(&e), TokenPoolErrorKind::Generic);
    }

    #[test]
    fn kind_of_survives_anyhow() {
        let e: anyhow::Error = TokenPoolError::from(TokenPoolErrorKind::NotAPipe(7)).into();
        assert_eq!(TokenPoolError::kind_of(&e), TokenPoolErrorKind::NotAPipe(7));
        assert_eq!(e.to_string(), "file descriptor 7 is not a pipe");
    }
}
