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

//! Describe the jobserver this process would join.

use anyhow::Error;

use tokenpool::{Env, JobServerAuth, EXIT_SUCCESS};

pub(crate) fn run(env: &Env) -> Result<i32, Error> {
    let flags = env.make_flags()?;
    match &flags.auth {
        Some(JobServerAuth::Fds(r, w)) => println!("auth: fds {},{}", r, w),
        Some(JobServerAuth::Fifo(path)) => println!("auth: fifo {}", path.display()),
        None => println!("auth: none"),
    }
    match flags.max_jobs {
        Some(n) => println!("jobs: {}", n),
        None => println!("jobs: unlimited"),
    }
    if let Some(load) = flags.max_load {
        println!("load: {}", load);
    }
    println!("serial: {}", flags.is_serial());
    println!("timeout: {}ms", env.acquire_timeout.as_millis());
    Ok(EXIT_SUCCESS)
}
