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

use anyhow::anyhow;

/// A KV operation forwarded to the remote relay. The node never
/// interprets keys or values, it only proxies.
#[derive(Debug, Clone)]
pub enum KvRequest {
    Set { key: String, value: String },
    Get { key: String },
    List { prefix: Option<String> },
    Delete { key: String },
}

#[derive(Debug, Clone, Default)]
pub struct KvResult {
    pub value: Option<String>,
    pub keys: Vec<String>,
}

/// Callbacks that the wrapping binary can implement to splice in the
/// external collaborators the node itself does not ship: the remote
/// relay's KV store and lifecycle notifications.
///
/// Hooks are invoked inline within the daemon's control flow, so
/// you MUST NOT block for extended periods of time. If you need to
/// do work that could block for a while, you should spin up a worker
/// task and enqueue events so the hooks can be processed async.
///
/// Lifecycle hook errors are logged and otherwise ignored; `kv`
/// errors are surfaced to the requesting client.
pub trait Hooks {
    /// Triggered when a fresh session is launched.
    fn on_session_start(&self, _session_id: u32, _name: Option<&str>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Triggered when a session reaches a terminal status.
    fn on_session_end(&self, _session_id: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Service a forwarded KV operation. The bundled node has no
    /// relay, so the default refuses.
    fn kv(&self, _request: KvRequest) -> anyhow::Result<KvResult> {
        Err(anyhow!("no relay configured"))
    }
}

/// The hooks used when the wrapping binary does not provide any.
pub struct NoopHooks;
impl Hooks for NoopHooks {}
