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

//! The durable session catalogue. One background task owns the file;
//! the registry pushes full snapshots into a watch channel and the
//! task debounces them to disk with a temp-file-then-rename write.

use std::{fs, io, path::{Path, PathBuf}};

use anyhow::Context;
use chrono::Utc;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{self, Instant},
};
use tracing::{error, info, instrument, warn};

use crate::{
    consts,
    protocol::{SessionInfo, SessionStatus},
};

pub fn catalogue_path(data_dir: &Path) -> PathBuf {
    data_dir.join(consts::CATALOGUE_FILE)
}

/// Parse the catalogue left by a prior run. A file that does not
/// parse is moved aside to `sessions.json.corrupt-<unix-ts>` and we
/// start empty. Only terminal sessions survive a restart: the
/// process has no pty state from before, so non-terminal records
/// come back as `killed` with exit code -1.
#[instrument(skip_all)]
pub fn load(data_dir: &Path) -> anyhow::Result<Vec<SessionInfo>> {
    let path = catalogue_path(data_dir);
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e).context("reading session catalogue"),
    };

    let mut sessions: Vec<SessionInfo> = match serde_json::from_slice(&bytes) {
        Ok(s) => s,
        Err(e) => {
            let quarantine = data_dir
                .join(format!("{}.corrupt-{}", consts::CATALOGUE_FILE, Utc::now().timestamp()));
            warn!("catalogue failed to parse ({}), quarantining to {:?}", e, quarantine);
            fs::rename(&path, &quarantine).context("quarantining corrupt catalogue")?;
            return Ok(vec![]);
        }
    };

    for session in sessions.iter_mut() {
        session.attached_count = 0;
        if !session.status.is_terminal() {
            session.status = SessionStatus::Killed;
            session.exit_code = Some(-1);
            session.completed_at = Some(Utc::now().to_rfc3339());
            session.pid = None;
        }
    }

    info!("restored {} sessions from catalogue", sessions.len());
    Ok(sessions)
}

/// Handle held by the registry. Updates are cheap; the store task
/// decides when to touch the disk.
#[derive(Clone)]
pub struct StoreHandle {
    catalogue_tx: watch::Sender<Vec<SessionInfo>>,
    flush_tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl StoreHandle {
    /// Replace the pending snapshot. Called on every mutating event.
    pub fn update(&self, catalogue: Vec<SessionInfo>) {
        // an error just means the store task is gone, which only
        // happens during shutdown
        let _ = self.catalogue_tx.send(catalogue);
    }

    /// Force any pending snapshot to disk and wait for it.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.flush_tx.send(tx).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Spawn the store task. It is the sole writer of the catalogue file.
pub fn spawn(data_dir: PathBuf) -> StoreHandle {
    let (catalogue_tx, catalogue_rx) = watch::channel(vec![]);
    let (flush_tx, flush_rx) = mpsc::channel(4);
    tokio::spawn(run(data_dir, catalogue_rx, flush_rx));
    StoreHandle { catalogue_tx, flush_tx }
}

#[instrument(skip_all)]
async fn run(
    data_dir: PathBuf,
    mut catalogue_rx: watch::Receiver<Vec<SessionInfo>>,
    mut flush_rx: mpsc::Receiver<oneshot::Sender<()>>,
) {
    let path = catalogue_path(&data_dir);
    let tmp_path = data_dir.join(format!("{}.tmp", consts::CATALOGUE_FILE));

    // trailing-edge debounce with a hard cap so a steady stream of
    // mutations still hits the disk at least once a second
    let mut deadline: Option<Instant> = None;
    let mut hard_deadline: Option<Instant> = None;

    loop {
        let wake = match (deadline, hard_deadline) {
            (Some(d), Some(h)) => Some(d.min(h)),
            (d, h) => d.or(h),
        };

        tokio::select! {
            changed = catalogue_rx.changed() => match changed {
                Ok(()) => {
                    let now = Instant::now();
                    if deadline.is_none() {
                        hard_deadline = Some(now + consts::STORE_MAX_DELAY);
                    }
                    deadline = Some(now + consts::STORE_DEBOUNCE);
                }
                Err(_) => {
                    // the registry dropped its handle: final write and out
                    if deadline.is_some() {
                        let catalogue = catalogue_rx.borrow().clone();
                        if let Err(e) = write_catalogue(&path, &tmp_path, &catalogue).await {
                            error!("final catalogue write failed: {:?}", e);
                        }
                    }
                    break;
                }
            },
            _ = sleep_until_opt(wake), if wake.is_some() => {
                let catalogue = catalogue_rx.borrow_and_update().clone();
                match write_catalogue(&path, &tmp_path, &catalogue).await {
                    Ok(()) => {
                        deadline = None;
                        hard_deadline = None;
                    }
                    Err(e) => {
                        // never fail a request over this; try again
                        // on the next debounce interval
                        error!("catalogue write failed, will retry: {:?}", e);
                        deadline = Some(Instant::now() + consts::STORE_DEBOUNCE);
                    }
                }
            },
            req = flush_rx.recv() => match req {
                Some(ack) => {
                    if deadline.is_some() || catalogue_rx.has_changed().unwrap_or(false) {
                        let catalogue = catalogue_rx.borrow_and_update().clone();
                        if let Err(e) = write_catalogue(&path, &tmp_path, &catalogue).await {
                            error!("flush write failed: {:?}", e);
                        }
                        deadline = None;
                        hard_deadline = None;
                    }
                    let _ = ack.send(());
                }
                None => break,
            },
        }
    }
}

async fn sleep_until_opt(wake: Option<Instant>) {
    match wake {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn write_catalogue(
    path: &Path,
    tmp_path: &Path,
    catalogue: &[SessionInfo],
) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(catalogue).context("serializing catalogue")?;
    tokio::fs::write(tmp_path, &bytes).await.context("writing catalogue temp file")?;
    tokio::fs::rename(tmp_path, path).await.context("renaming catalogue into place")?;
    Ok(())
}
