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

//! The wait coordinator: block until some or all of a set of
//! sessions reach a terminal status. Each session actor keeps its
//! snapshot in a watch channel, which serves as the terminal-status
//! notifier here.

use std::time::Duration;

use tokio::{sync::watch, task::JoinSet, time};

use crate::protocol::{SessionInfo, WaitCondition};

/// Wait for the targets per `condition`. Returns the snapshot of
/// every target at completion time and whether the deadline fired
/// first. The target set was resolved at admission; an empty set is
/// the caller's error to report.
pub async fn wait_for_terminal(
    targets: Vec<(u32, watch::Receiver<SessionInfo>)>,
    condition: WaitCondition,
    timeout: Option<Duration>,
) -> (Vec<SessionInfo>, bool) {
    let mut set = JoinSet::new();
    for (_, rx) in &targets {
        let mut rx = rx.clone();
        set.spawn(async move {
            // A closed channel means the actor is gone; its last
            // snapshot is already terminal, so either way we are done.
            let _ = rx.wait_for(|info| info.status.is_terminal()).await;
        });
    }

    let wanted = match condition {
        WaitCondition::Any => 1,
        WaitCondition::All => targets.len(),
    };

    let wait_all = async {
        let mut done = 0;
        while done < wanted {
            if set.join_next().await.is_none() {
                break;
            }
            done += 1;
        }
    };

    let timed_out = match timeout {
        Some(limit) => time::timeout(limit, wait_all).await.is_err(),
        None => {
            wait_all.await;
            false
        }
    };
    set.abort_all();

    let sessions = targets.iter().map(|(_, rx)| rx.borrow().clone()).collect();
    (sessions, timed_out)
}
