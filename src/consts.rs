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

use std::time;

/// The largest frame payload we will accept or emit on the wire.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// The size of the buffer used to slurp bytes out of the pty master.
pub const PTY_BUF_SIZE: usize = 4096;

/// How many bytes of output history each session spools by default.
pub const DEFAULT_OUTPUT_RING_BYTES: usize = 4 * 1024 * 1024;

/// How many bytes may sit unsent in a single attacher's delivery
/// channel before the session drops it as a slow consumer.
pub const DEFAULT_ATTACHER_HIGH_WATER: usize = 256 * 1024;

/// How many events a single subscription buffers before the bus
/// starts discarding the oldest.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 256;

/// How many directed messages a session inbox retains.
pub const DEFAULT_INBOX_CAP: usize = 1000;

/// How many messages `MsgRead` returns when no tail is given.
pub const DEFAULT_MSG_READ_TAIL: usize = 50;

/// How long a `MsgRequest` waits for a reply when no timeout is given.
pub const DEFAULT_REQUEST_TIMEOUT: time::Duration = time::Duration::from_secs(30);

/// Sessions publish at most one `session.output` event per interval.
pub const OUTPUT_EVENT_INTERVAL: time::Duration = time::Duration::from_millis(100);

/// How long a killed child gets to react to SIGTERM before we
/// escalate to SIGKILL.
pub const KILL_GRACE_PERIOD: time::Duration = time::Duration::from_secs(5);

/// The catalogue is flushed this long after the last mutating event.
pub const STORE_DEBOUNCE: time::Duration = time::Duration::from_millis(500);

/// Under a steady stream of mutations a flush still happens at least
/// this often.
pub const STORE_MAX_DELAY: time::Duration = time::Duration::from_secs(1);

pub const DEFAULT_TTY_COLS: u16 = 80;
pub const DEFAULT_TTY_ROWS: u16 = 24;

/// The longest session name we will register.
pub const MAX_NAME_LEN: usize = 64;

pub const SOCKET_FILE: &str = "codewire.sock";
pub const CATALOGUE_FILE: &str = "sessions.json";

/// Injected into every child so processes can tell which session
/// they live in.
pub const SESSION_ID_VAR: &str = "CW_SESSION_ID";
pub const SESSION_NAME_VAR: &str = "CW_SESSION_NAME";
