// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Binary entrypoint for the accelerator scheduler daemon.

fn main() -> std::process::ExitCode {
    accelschedd::run()
}
