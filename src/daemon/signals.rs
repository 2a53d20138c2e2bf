// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::Context;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
};
use tracing::info;

/// Spawn the signal handler task. The first SIGINT or SIGTERM flips
/// the shutdown flag so the accept loop stops and the daemon runs
/// its orderly teardown; a second one kills the process the hard way
/// in case teardown is stuck.
pub fn spawn_handler(shutdown_tx: watch::Sender<bool>) -> anyhow::Result<()> {
    let mut interrupt =
        signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("caught SIGINT"),
            _ = terminate.recv() => info!("caught SIGTERM"),
        }
        let _ = shutdown_tx.send(true);

        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        info!("second term signal, exiting immediately");
        std::process::exit(1);
    });

    Ok(())
}
