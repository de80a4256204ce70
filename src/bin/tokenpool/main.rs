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

mod info;
mod take;
mod run;

use anyhow::Error;
use clap::{crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};
use std::io;
use std::str::FromStr;

use tokenpool::logs::LogBuilder;
use tokenpool::{
    log_err, Env, TokenPoolError, TokenPoolErrorKind, EXIT_FAILURE, EXIT_INVALID_JOBSERVER,
    EXIT_MALFORMED_AUTH,
};

fn main() {
    let env = Env::inherit();
    LogBuilder::from(&env).setup(&env, io::stderr());

    let matches = App::new("tokenpool")
        .about("Create, join and inspect GNU make jobservers.")
        .version(crate_version!())
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .setting(AppSettings::DeriveDisplayOrder)
        .setting(AppSettings::UnifiedHelpMessage)
        .subcommand(
            SubCommand::with_name("run")
                .about("Run a command under a new jobserver.")
                .setting(AppSettings::TrailingVarArg)
                .arg(Arg::from_usage(
                    "-j, --jobs [N] 'maximum number of concurrent jobs (default: number of CPUs)'",
                ))
                .arg(Arg::from_usage("<command>... 'command to run'")),
        )
        .subcommand(
            SubCommand::with_name("take")
                .about("Join the jobserver in MAKEFLAGS and take as many tokens as possible.")
                .arg(Arg::from_usage(
                    "--max [N] 'stop after taking this many tokens (default: 10)'",
                ))
                .arg(Arg::from_usage(
                    "--hold [MS] 'keep the tokens this many milliseconds before returning them'",
                ))
                .arg(Arg::from_usage(
                    "--wait [MS] 'wait this long for a token before giving up'",
                )),
        )
        .subcommand(
            SubCommand::with_name("info").about("Print the jobserver settings found in MAKEFLAGS."),
        )
        .get_matches();

    let result = match matches.subcommand() {
        ("run", Some(m)) => run::run(&env, m),
        ("take", Some(m)) => take::run(&env, m),
        _ => info::run(&env),
    };
    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            let msg = {
                use std::fmt::Write;

                let mut s = String::new();
                for e in e.chain() {
                    if !s.is_empty() {
                        write!(s, ": ").unwrap();
                    }
                    write!(s, "{}", e).unwrap();
                }
                s
            };
            log_err!("{}", msg);
            let retcode = match TokenPoolError::kind_of(&e) {
                TokenPoolErrorKind::NoJobServer
                | TokenPoolErrorKind::InvalidDescriptor(_)
                | TokenPoolErrorKind::NotAPipe(_)
                | TokenPoolErrorKind::WrongAccessMode(_) => EXIT_INVALID_JOBSERVER,
                TokenPoolErrorKind::MalformedAuth(_) => EXIT_MALFORMED_AUTH,
                _ => EXIT_FAILURE,
            };
            std::process::exit(retcode)
        }
    }
}

/// Parse an optional integer flag.
pub(crate) fn int_arg<T: FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>, Error>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match matches.value_of(name) {
        Some(s) => T::from_str(s)
            .map(Some)
            .map_err(|e| Error::new(e).context(format!("invalid --{} {:?}", name, s))),
        None => Ok(None),
    }
}
