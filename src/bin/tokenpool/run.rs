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

//! Run a command under a freshly created jobserver.

use anyhow::{anyhow, Error};
use clap::ArgMatches;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus};
use std::thread;

use tokenpool::{
    log_debug, log_err, log_warn, Env, JobClient, EXIT_FAILURE, EXIT_SPAWN_FAILURE,
    EXIT_TOKENS_LOST,
};

use super::int_arg;

pub(crate) fn run(env: &Env, matches: &ArgMatches) -> Result<i32, Error> {
    let jobs: u32 = match int_arg(matches, "jobs")? {
        Some(n) => n,
        None => thread::available_parallelism().map_or(1, |n| n.get() as u32),
    };
    if jobs == 0 || jobs > 1000 {
        return Err(anyhow!(
            "invalid --jobs value: {} (must be between 1 and 1000)",
            jobs
        ));
    }
    let mut argv = matches.values_of_os("command").into_iter().flatten();
    let prog = argv.next().ok_or_else(|| anyhow!("no command given"))?;

    let mut client = JobClient::create(jobs, env)?;
    let mut cmd = Command::new(prog);
    cmd.args(argv);
    client.configure(&mut cmd);
    log_debug!("running {:?} with -j{}\n", cmd, jobs);
    let status = match cmd.status() {
        Ok(status) => status,
        Err(e) => {
            log_err!("{}: {}\n", prog.to_string_lossy(), e);
            return Ok(EXIT_SPAWN_FAILURE);
        }
    };

    // Every token should be back in the pipe now.
    let expected = (jobs - 1) as usize;
    let mut found = 0;
    while client.acquire().is_some() {
        found += 1;
    }
    client.release_all()?;
    let code = exit_code(status);
    if found != expected {
        log_warn!("on exit: expected {} tokens; found {}\n", expected, found);
        if found < expected && code == 0 {
            return Ok(EXIT_TOKENS_LOST);
        }
    }
    Ok(code)
}

/// Map a child's status to our exit code, shell style: `128 + N` for a
/// child killed by signal N.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(EXIT_FAILURE)
}
