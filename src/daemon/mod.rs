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

use std::{fs, os::unix::fs::PermissionsExt as _, path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::{net::UnixListener, sync::watch};
use tracing::{error, info, instrument};

use crate::{config, consts, hooks};

mod events;
mod messages;
mod output;
mod pty;
mod registry;
mod server;
mod session;
mod signals;
mod store;
mod wait;

#[instrument(skip_all)]
pub async fn run(
    config: config::Config,
    data_dir: PathBuf,
    hooks: Arc<dyn hooks::Hooks + Send + Sync>,
    socket: PathBuf,
) -> anyhow::Result<()> {
    info!("\n\n======================== STARTING NODE ============================\n\n");

    fs::create_dir_all(&data_dir).context("creating data dir")?;
    // the socket and catalogue in here belong to one user only
    let mut perms = fs::metadata(&data_dir).context("stating data dir")?.permissions();
    if perms.mode() & 0o777 != 0o700 {
        perms.set_mode(0o700);
        fs::set_permissions(&data_dir, perms).context("locking down data dir permissions")?;
    }

    let restored = store::load(&data_dir).context("restoring session catalogue")?;
    let store = store::spawn(data_dir.clone());
    let bus = events::EventBus::new(config.subscription_buffer());
    let router = messages::MessageRouter::new(bus.clone(), config.inbox_cap());
    let registry = registry::Registry::new(
        bus.clone(),
        store.clone(),
        router.clone(),
        Arc::clone(&hooks),
        config.clone(),
        restored,
    );

    if socket.exists() {
        info!("removing stale socket file");
        fs::remove_file(&socket).context("removing stale socket")?;
    }
    let listener = UnixListener::bind(&socket).context("binding to socket")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    signals::spawn_handler(shutdown_tx)?;

    let server = server::Server::new(registry.clone(), bus, router, hooks, config);
    server::Server::serve(server, listener, shutdown_rx).await?;

    // term signal received: no new connections, take the sessions
    // down, get the catalogue on disk, clean up the socket
    registry.shutdown(consts::KILL_GRACE_PERIOD).await;
    registry.persist();
    store.flush().await;
    if let Err(e) = fs::remove_file(&socket) {
        error!("cleaning up socket on exit: {}", e);
    }
    info!("node exited cleanly");

    Ok(())
}
