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

//! Join an inherited jobserver and take as many tokens as it will give.

use anyhow::Error;
use clap::ArgMatches;
use std::thread;
use std::time::Duration;

use tokenpool::{log_debug, Env, JobClient, EXIT_SUCCESS};

use super::int_arg;

pub(crate) fn run(env: &Env, matches: &ArgMatches) -> Result<i32, Error> {
    let max: usize = int_arg(matches, "max")?.unwrap_or(10);
    let hold = Duration::from_millis(int_arg(matches, "hold")?.unwrap_or(0));
    let wait = int_arg::<u64>(matches, "wait")?.map(Duration::from_millis);

    let mut client = JobClient::from_env(env)?;
    log_debug!(
        "taking tokens: -j{:?} -l{:?}\n",
        client.max_jobs(),
        client.max_load()
    );
    while client.held() < max {
        if client.acquire().is_some() {
            continue;
        }
        match wait {
            Some(d) if client.wait_for_token(d)? && client.acquire().is_some() => {}
            _ => break,
        }
    }
    let n = client.held();
    println!("acquired {} tokens", n);
    if !hold.is_zero() {
        thread::sleep(hold);
    }
    client.release_all()?;
    println!("released {} tokens", n);
    Ok(EXIT_SUCCESS)
}
