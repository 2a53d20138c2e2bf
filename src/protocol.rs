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

//! The wire protocol spoken on the control socket.
//!
//! Every exchange is a frame: a one byte kind tag, a 4 byte big endian
//! length prefix, then the payload. Control frames carry UTF-8 JSON
//! objects tagged with a top-level `"type"` field; data frames carry
//! opaque pty bytes.

use std::fmt;

use anyhow::Context;
use byteorder::BigEndian;
use serde::Serialize;
use serde_derive::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::consts;

/// The kind tag prefixed to every frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// The payload is a JSON control object.
    Control = 0x00,
    /// The payload is raw pty input or output bytes.
    Data = 0x01,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, FrameError> {
        match v {
            0x00 => Ok(FrameKind::Control),
            0x01 => Ok(FrameKind::Data),
            _ => Err(FrameError::UnknownKind(v)),
        }
    }
}

/// A single frame, as read off or written to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn data(payload: Vec<u8>) -> Frame {
        Frame { kind: FrameKind::Data, payload }
    }

    /// Wrap a control value in a frame by serializing it to JSON.
    pub fn control<T: Serialize>(v: &T) -> anyhow::Result<Frame> {
        let payload = serde_json::to_vec(v).context("serializing control payload")?;
        Ok(Frame { kind: FrameKind::Control, payload })
    }
}

/// Frame level errors. These are connection-fatal: the peer is not
/// speaking our protocol, so there is no point in answering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The advertized payload length exceeds the frame cap.
    TooLarge { len: usize },
    /// The kind tag byte is not one we know.
    UnknownKind(u8),
    /// The stream ended partway through a frame.
    Truncated,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::TooLarge { len } => {
                write!(f, "frame payload of {} bytes exceeds {} byte cap", len, consts::MAX_FRAME_PAYLOAD)
            }
            FrameError::UnknownKind(k) => write!(f, "unknown frame kind {k:#04x}"),
            FrameError::Truncated => write!(f, "stream ended inside a frame"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Read one frame. Returns `Ok(None)` on a clean EOF, meaning the
/// stream ended on a frame boundary. An EOF inside a frame is an
/// error ([`FrameError::Truncated`]).
pub async fn read_frame<R>(r: &mut R) -> anyhow::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let kind = match r.read_u8().await {
        Ok(b) => FrameKind::try_from(b)?,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("reading frame kind"),
    };

    let len = match r.read_u32().await {
        Ok(l) => l as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::Truncated.into());
        }
        Err(e) => return Err(e).context("reading frame length"),
    };
    if len > consts::MAX_FRAME_PAYLOAD {
        return Err(FrameError::TooLarge { len }.into());
    }

    let mut payload = vec![0; len];
    match r.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::Truncated.into());
        }
        Err(e) => return Err(e).context("reading frame payload"),
    }

    Ok(Some(Frame { kind, payload }))
}

/// Write one frame. The header and payload go out in a single
/// write-all so a frame is never visibly half-written; callers must
/// still serialize concurrent writes on the same sink.
pub async fn write_frame<W>(w: &mut W, frame: &Frame) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frame.payload.len() > consts::MAX_FRAME_PAYLOAD {
        return Err(FrameError::TooLarge { len: frame.payload.len() }.into());
    }

    let mut buf = Vec::with_capacity(5 + frame.payload.len());
    byteorder::WriteBytesExt::write_u8(&mut buf, frame.kind as u8).context("encoding frame kind")?;
    byteorder::WriteBytesExt::write_u32::<BigEndian>(&mut buf, frame.payload.len() as u32)
        .context("encoding frame length")?;
    std::io::Write::write_all(&mut buf, &frame.payload).context("encoding frame payload")?;

    w.write_all(&buf).await.context("writing frame")?;
    Ok(())
}

/// Parse a control payload. Unknown tags and missing required fields
/// surface as errors for the dispatcher to report; the connection
/// stays up.
pub fn decode_request(payload: &[u8]) -> anyhow::Result<Request> {
    serde_json::from_slice(payload).context("parsing control request")
}

pub fn decode_response(payload: &[u8]) -> anyhow::Result<Response> {
    serde_json::from_slice(payload).context("parsing control response")
}

/// Picks a session either by id or by name. Requests that operate on
/// a single session carry these two fields flattened in.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
}

impl SessionSelector {
    pub fn id(id: u32) -> SessionSelector {
        SessionSelector { session_id: Some(id), session_name: None }
    }

    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.session_name.is_none()
    }
}

impl fmt::Display for SessionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.session_id, &self.session_name) {
            (Some(id), _) => write!(f, "{id}"),
            (None, Some(name)) => write!(f, "'{name}'"),
            (None, None) => write!(f, "<unspecified>"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WaitCondition {
    #[default]
    Any,
    All,
}

/// Everything a client can ask the node to do.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum Request {
    ListSessions,
    Launch {
        #[serde(default)]
        cmd: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        /// KEY=VALUE pairs overlaid on the daemon's environment.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        env: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
        /// Fed to the pty right after spawn, before any attacher input.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stdin_data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    Attach {
        #[serde(flatten)]
        session: SessionSelector,
        /// Absent means true.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        include_history: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    Detach,
    Kill {
        #[serde(flatten)]
        session: SessionSelector,
    },
    KillAll,
    KillByTags {
        #[serde(default)]
        tags: Vec<String>,
    },
    Resize {
        #[serde(flatten)]
        session: SessionSelector,
        cols: u16,
        rows: u16,
    },
    Logs {
        #[serde(flatten)]
        session: SessionSelector,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_bytes: Option<u64>,
        /// Absent means true.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        strip_ansi: Option<bool>,
        /// Keep streaming output as data frames after the reply.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        follow: Option<bool>,
    },
    SendInput {
        #[serde(flatten)]
        session: SessionSelector,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<u32>,
    },
    GetStatus {
        #[serde(flatten)]
        session: SessionSelector,
    },
    WatchSession {
        #[serde(flatten)]
        session: SessionSelector,
        /// Absent means true.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        include_history: Option<bool>,
    },
    Subscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<u32>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
        /// Empty means any event type.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        event_types: Vec<String>,
    },
    Unsubscribe {
        subscription_id: u64,
    },
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<u32>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
        #[serde(default)]
        condition: WaitCondition,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_s: Option<u64>,
    },
    // The KV family is proxied to the remote relay hook; the node
    // never interprets keys or values.
    KVSet {
        key: String,
        value: String,
    },
    KVGet {
        key: String,
    },
    KVList {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
    KVDelete {
        key: String,
    },
    MsgSend {
        /// 0 or absent means anonymous.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_id: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_name: Option<String>,
        #[serde(default)]
        body: String,
    },
    MsgRead {
        session_id: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tail: Option<usize>,
    },
    MsgRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_id: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_name: Option<String>,
        #[serde(default)]
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_s: Option<u64>,
    },
    MsgReply {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<u32>,
        request_id: String,
        #[serde(default)]
        body: String,
    },
    MsgListen {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<u32>,
    },
}

/// Everything the node can answer with. `Error` and `Ok` are
/// universal; the rest mirror their request.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum Response {
    SessionList {
        sessions: Vec<SessionInfo>,
    },
    Launched {
        session_id: u32,
    },
    Attached {
        session_id: u32,
        attacher_id: u64,
        /// Where in the output stream the attach begins. With history
        /// this is the earliest retained offset, which may be later
        /// than zero if the ring already dropped its prefix.
        from_offset: u64,
    },
    Detached,
    Killed {
        session_id: u32,
    },
    KilledAll {
        killed: Vec<u32>,
    },
    Resized,
    LogData {
        session_id: u32,
        data: String,
        start_offset: u64,
        next_offset: u64,
    },
    InputSent,
    SessionStatus {
        session: SessionInfo,
    },
    WatchUpdate {
        session_id: u32,
        done: bool,
    },
    SubscribeAck {
        subscription_id: u64,
    },
    Unsubscribed {
        subscription_id: u64,
        /// Events discarded because the subscription buffer overflowed.
        dropped: u64,
    },
    Event {
        subscription_id: u64,
        timestamp: String,
        event_type: String,
        data: serde_json::Value,
    },
    WaitResult {
        sessions: Vec<SessionInfo>,
        timed_out: bool,
    },
    MsgSent {
        message_id: String,
    },
    MsgReadResult {
        messages: Vec<StoredMessage>,
    },
    MsgRequestResult {
        request_id: String,
        reply_body: String,
        from_id: u32,
        from_name: String,
    },
    MsgReplySent,
    MsgListenAck {
        subscription_id: u64,
    },
    KVResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        keys: Vec<String>,
    },
    Ok,
    Error {
        message: String,
    },
}

impl Response {
    pub fn error<S: Into<String>>(message: S) -> Response {
        Response::Error { message: message.into() }
    }
}

/// The lifecycle state of a session. A session enters exactly one of
/// the terminal states, exactly once.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "completed-error")]
    CompletedError,
    #[serde(rename = "killed")]
    Killed,
    #[serde(rename = "failed")]
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::CompletedError => write!(f, "completed-error"),
            SessionStatus::Killed => write!(f, "killed"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The full descriptor of a session as reported to clients and
/// persisted in the catalogue.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionInfo {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The command vector joined for display.
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(default)]
    pub attached_count: u32,
    #[serde(default)]
    pub output_bytes: u64,
    #[serde(default)]
    pub output_lines: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output_at: Option<String>,
}

/// A directed message parked in a session inbox.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoredMessage {
    pub message_id: String,
    /// Present when the message is the request half of a
    /// request/reply exchange; feed it back via `MsgReply`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub from_id: u32,
    pub from_name: String,
    pub body: String,
    pub sent_at: String,
}

pub const EVENT_SESSION_STATUS: &str = "session.status";
pub const EVENT_SESSION_OUTPUT: &str = "session.output";
pub const EVENT_DIRECT_MESSAGE: &str = "direct.message";
pub const EVENT_MESSAGE_REQUEST: &str = "message.request";
pub const EVENT_MESSAGE_REPLY: &str = "message.reply";
