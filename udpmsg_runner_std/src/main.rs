// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::process::ExitCode;

use clap::Parser as _;
use udpmsg_runner_std::{CliArgs, error_code, exit_status};

fn main() -> ExitCode {
    match udpmsg_runner_std::run(CliArgs::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::from(exit_status(error_code(&e)))
        }
    }
}
