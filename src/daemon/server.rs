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

//! The connection dispatcher. Each accepted connection gets a frame
//! read loop plus one writer task that owns the write half; every
//! producer (request replies, attached session output, subscription
//! events) funnels frames through the writer so emission stays
//! serialized.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context};
use tokio::{
    net::{unix::OwnedReadHalf, UnixListener, UnixStream},
    sync::{mpsc, oneshot, watch},
    time,
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config,
    consts,
    daemon::{
        events::{EventBus, EventFilter},
        messages::MessageRouter,
        registry::{LaunchParams, Registry},
        session::{AttachDone, AttachRole, InputSource, SessionCommand, SessionHandle},
        wait,
    },
    hooks::{Hooks, KvRequest},
    protocol::{
        self, Frame, FrameError, FrameKind, Request, Response, SessionSelector,
    },
};

/// Frames queued for a connection's writer task.
pub enum Outgoing {
    Control(Response),
    Data {
        payload: Vec<u8>,
        /// The byte accounting cell of whichever sink enqueued this,
        /// decremented once the frame is on the wire.
        pending: Arc<AtomicUsize>,
    },
}

/// The sink side of one attacher, watcher or subscription: a clone
/// of the connection's outbound queue plus its own byte accounting
/// and closed flag. The owning producer checks `pending_bytes`
/// against its high-water mark to spot slow consumers.
#[derive(Clone)]
pub struct ClientSink {
    tx: mpsc::UnboundedSender<Outgoing>,
    pending: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

/// The far side of a sink is gone or was closed by its producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

impl ClientSink {
    pub fn new(tx: mpsc::UnboundedSender<Outgoing>) -> ClientSink {
        ClientSink {
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn send_control(&self, resp: Response) -> Result<(), SinkClosed> {
        if self.is_closed() {
            return Err(SinkClosed);
        }
        self.tx.send(Outgoing::Control(resp)).map_err(|_| {
            self.closed.store(true, Ordering::Release);
            SinkClosed
        })
    }

    pub fn send_data(&self, payload: Vec<u8>) -> Result<(), SinkClosed> {
        if self.is_closed() {
            return Err(SinkClosed);
        }
        let len = payload.len();
        self.pending.fetch_add(len, Ordering::AcqRel);
        self.tx
            .send(Outgoing::Data { payload, pending: Arc::clone(&self.pending) })
            .map_err(|_| {
                self.pending.fetch_sub(len, Ordering::AcqRel);
                self.closed.store(true, Ordering::Release);
                SinkClosed
            })
    }

    /// Bytes enqueued but not yet written to the socket.
    pub fn pending_bytes(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Mark the sink dead. The registration this sink backs is gone;
    /// the connection side notices on its next use.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    #[cfg(test)]
    pub fn test_pair() -> (ClientSink, TestSinkRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientSink::new(tx), TestSinkRx { rx })
    }
}

/// Test-side consumer of a [`ClientSink`], standing in for a
/// connection's writer task.
#[cfg(test)]
pub struct TestSinkRx {
    rx: mpsc::UnboundedReceiver<Outgoing>,
}

#[cfg(test)]
impl TestSinkRx {
    /// Next control frame, skipping interleaved data.
    pub async fn recv_control(&mut self) -> Option<Response> {
        loop {
            match self.rx.recv().await? {
                Outgoing::Control(resp) => return Some(resp),
                Outgoing::Data { payload, pending } => {
                    pending.fetch_sub(payload.len(), Ordering::AcqRel);
                }
            }
        }
    }

    /// Next data frame, skipping interleaved control frames.
    pub async fn recv_data(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.rx.recv().await? {
                Outgoing::Data { payload, pending } => {
                    pending.fetch_sub(payload.len(), Ordering::AcqRel);
                    return Some(payload);
                }
                Outgoing::Control(_) => {}
            }
        }
    }
}

pub struct Server {
    registry: Registry,
    bus: EventBus,
    router: MessageRouter,
    hooks: Arc<dyn Hooks + Send + Sync>,
    config: config::Config,
}

impl Server {
    pub fn new(
        registry: Registry,
        bus: EventBus,
        router: MessageRouter,
        hooks: Arc<dyn Hooks + Send + Sync>,
        config: config::Config,
    ) -> Arc<Server> {
        Arc::new(Server { registry, bus, router, hooks, config })
    }

    /// Accept connections until the shutdown flag flips.
    #[instrument(skip_all)]
    pub async fn serve(
        server: Arc<Self>,
        listener: UnixListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut conn_counter = 0usize;
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        conn_counter += 1;
                        let conn_id = conn_counter;
                        info!("socket got a new connection");
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            if let Err(err) = server.handle_conn(stream, conn_id).await {
                                error!("handling connection: {:?}", err);
                            }
                        });
                    }
                    Err(err) => {
                        error!("accepting stream: {:?}", err);
                    }
                },
                _ = shutdown.changed() => {
                    info!("stopping new connection admission");
                    return Ok(());
                },
            }
        }
    }

    #[instrument(skip_all, fields(cid = conn_id))]
    async fn handle_conn(
        self: Arc<Self>,
        stream: UnixStream,
        conn_id: usize,
    ) -> anyhow::Result<()> {
        check_peer(&stream)?;

        let (mut read_half, mut write_half) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();

        // sole writer of this connection: everything that leaves
        // goes through this queue, which is the write lock
        let writer = tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                let res = match out {
                    Outgoing::Control(resp) => match Frame::control(&resp) {
                        Ok(frame) => protocol::write_frame(&mut write_half, &frame).await,
                        Err(e) => {
                            error!("encoding control frame: {:?}", e);
                            continue;
                        }
                    },
                    Outgoing::Data { payload, pending } => {
                        let len = payload.len();
                        let res =
                            protocol::write_frame(&mut write_half, &Frame::data(payload)).await;
                        pending.fetch_sub(len, Ordering::AcqRel);
                        res
                    }
                };
                if res.is_err() {
                    break;
                }
            }
        });

        let mut conn = Conn {
            server: Arc::clone(&self),
            out_tx: out_tx.clone(),
            attached: None,
            watches: vec![],
            subscriptions: vec![],
        };
        let result = conn.read_loop(&mut read_half).await;
        conn.cleanup().await;

        drop(conn);
        drop(out_tx);
        let _ = writer.await;
        result
    }
}

/// One attached stream held by a connection.
struct AttachedStream {
    session: SessionHandle,
    attacher_id: u64,
    sink: ClientSink,
}

/// Per-connection dispatcher state: what this client holds and must
/// give back on disconnect.
struct Conn {
    server: Arc<Server>,
    out_tx: mpsc::UnboundedSender<Outgoing>,
    attached: Option<AttachedStream>,
    watches: Vec<(SessionHandle, u64)>,
    subscriptions: Vec<u64>,
}

impl Conn {
    async fn read_loop(&mut self, r: &mut OwnedReadHalf) -> anyhow::Result<()> {
        loop {
            match protocol::read_frame(r).await {
                Ok(None) => {
                    debug!("client hung up cleanly");
                    return Ok(());
                }
                Ok(Some(frame)) => match frame.kind {
                    FrameKind::Data => self.relay_input(frame.payload).await,
                    FrameKind::Control => {
                        let resp = match protocol::decode_request(&frame.payload) {
                            Ok(req) => self.handle_request(req).await,
                            Err(e) => Response::error(format!("bad request: {e:#}")),
                        };
                        if self.out_tx.send(Outgoing::Control(resp)).is_err() {
                            return Ok(());
                        }
                    }
                },
                Err(e) => {
                    // a malformed frame means the peer is off the
                    // rails; close without a response
                    if let Some(frame_err) = e.downcast_ref::<FrameError>() {
                        warn!("closing connection on frame error: {}", frame_err);
                        return Ok(());
                    }
                    return Err(e).context("reading frame");
                }
            }
        }
    }

    /// A raw data frame from the client: stdin for the attached
    /// session, relayed on behalf of this connection's attacher.
    async fn relay_input(&mut self, data: Vec<u8>) {
        match &self.attached {
            Some(att) if att.sink.is_closed() => {
                debug!("attached stream already ended, dropping input");
                self.attached = None;
            }
            Some(att) => {
                let cmd = SessionCommand::WriteInput {
                    data,
                    source: InputSource::Attacher(att.attacher_id),
                    reply: None,
                };
                if !att.session.send(cmd).await {
                    self.attached = None;
                }
            }
            None => {
                debug!("data frame with no attached session, dropping");
            }
        }
    }

    async fn handle_request(&mut self, req: Request) -> Response {
        match req {
            Request::ListSessions => {
                Response::SessionList { sessions: self.server.registry.list() }
            }
            Request::Launch { cmd, cwd, env, name, tags, stdin_data, cols, rows } => {
                let params = LaunchParams {
                    cmd,
                    cwd,
                    env,
                    name,
                    tags,
                    stdin_data: stdin_data.map(String::into_bytes),
                    cols,
                    rows,
                };
                match self.server.registry.launch(params) {
                    Ok(session_id) => Response::Launched { session_id },
                    Err(e) => Response::error(format!("{e:#}")),
                }
            }
            Request::Attach { session, include_history, cols, rows } => {
                self.handle_attach(session, include_history.unwrap_or(true), cols, rows).await
            }
            Request::Detach => {
                if let Some(att) = self.attached.take() {
                    let (tx, rx) = oneshot::channel();
                    if att
                        .session
                        .send(SessionCommand::Detach { attacher_id: att.attacher_id, reply: tx })
                        .await
                    {
                        let _ = rx.await;
                    }
                }
                // idempotent: detaching when not attached, or after
                // the session ended, is still a Detached
                Response::Detached
            }
            Request::Kill { session } => match self.server.registry.resolve(&session) {
                Ok(handle) => {
                    if handle.is_live() {
                        let (tx, rx) = oneshot::channel();
                        if handle
                            .send(SessionCommand::Kill { signal: None, reply: Some(tx) })
                            .await
                        {
                            let _ = rx.await;
                        }
                    }
                    // a kill on a terminal session is a no-op
                    Response::Killed { session_id: handle.id }
                }
                Err(e) => Response::error(format!("{e:#}")),
            },
            Request::KillAll => {
                Response::KilledAll { killed: self.server.registry.kill_all().await }
            }
            Request::KillByTags { tags } => {
                Response::KilledAll { killed: self.server.registry.kill_by_tags(&tags).await }
            }
            Request::Resize { session, cols, rows } => {
                let handle = match self.resolve_or_attached(&session) {
                    Ok(h) => h,
                    Err(resp) => return *resp,
                };
                let (tx, rx) = oneshot::channel();
                if !handle.send(SessionCommand::Resize { cols, rows, reply: tx }).await {
                    return Response::error(format!("session {} completed", handle.id));
                }
                match rx.await {
                    Ok(Ok(())) => Response::Resized,
                    Ok(Err(e)) => Response::error(format!("{e:#}")),
                    Err(_) => Response::error(format!("session {} completed", handle.id)),
                }
            }
            Request::Logs { session, offset, max_bytes, strip_ansi, follow } => {
                self.handle_logs(session, offset, max_bytes, strip_ansi, follow).await
            }
            Request::SendInput { session, data, from: _ } => {
                let handle = match self.resolve_or_attached(&session) {
                    Ok(h) => h,
                    Err(resp) => return *resp,
                };
                let (tx, rx) = oneshot::channel();
                let cmd = SessionCommand::WriteInput {
                    data: data.into_bytes(),
                    source: InputSource::Explicit,
                    reply: Some(tx),
                };
                if !handle.send(cmd).await {
                    return Response::error(format!("session {} completed", handle.id));
                }
                match rx.await {
                    Ok(Ok(())) => Response::InputSent,
                    Ok(Err(e)) => Response::error(format!("{e:#}")),
                    Err(_) => Response::error(format!("session {} completed", handle.id)),
                }
            }
            Request::GetStatus { session } => match self.server.registry.resolve(&session) {
                Ok(handle) => Response::SessionStatus { session: handle.snapshot().await },
                Err(e) => Response::error(format!("{e:#}")),
            },
            Request::WatchSession { session, include_history } => {
                self.handle_watch(session, include_history.unwrap_or(true)).await
            }
            Request::Subscribe { session_id, tags, event_types } => {
                let filter = EventFilter { session_id, tags, event_types };
                let sink = ClientSink::new(self.out_tx.clone());
                let subscription_id = self.server.bus.subscribe(filter, sink);
                self.subscriptions.push(subscription_id);
                Response::SubscribeAck { subscription_id }
            }
            Request::Unsubscribe { subscription_id } => {
                if let Some(idx) =
                    self.subscriptions.iter().position(|id| *id == subscription_id)
                {
                    self.subscriptions.remove(idx);
                }
                match self.server.bus.unsubscribe(subscription_id) {
                    Some(dropped) => Response::Unsubscribed { subscription_id, dropped },
                    None => {
                        Response::error(format!("subscription {subscription_id} not found"))
                    }
                }
            }
            Request::Wait { session_id, tags, condition, timeout_s } => {
                let targets = self.server.registry.wait_targets(session_id, &tags);
                if targets.is_empty() {
                    return Response::error("no matching sessions");
                }
                let timeout = timeout_s.map(Duration::from_secs);
                let (sessions, timed_out) =
                    wait::wait_for_terminal(targets, condition, timeout).await;
                Response::WaitResult { sessions, timed_out }
            }
            Request::KVSet { key, value } => self.forward_kv(KvRequest::Set { key, value }),
            Request::KVGet { key } => self.forward_kv(KvRequest::Get { key }),
            Request::KVList { prefix } => self.forward_kv(KvRequest::List { prefix }),
            Request::KVDelete { key } => self.forward_kv(KvRequest::Delete { key }),
            Request::MsgSend { from, to_id, to_name, body } => {
                let selector = SessionSelector { session_id: to_id, session_name: to_name };
                let handle = match self.server.registry.resolve(&selector) {
                    Ok(h) => h,
                    Err(e) => return Response::error(format!("{e:#}")),
                };
                let from_id = from.unwrap_or(0);
                let from_name = self.server.registry.session_name(from_id);
                let message_id =
                    self.server.router.send(from_id, from_name, handle.id, &handle.tags, body);
                Response::MsgSent { message_id }
            }
            Request::MsgRead { session_id, tail } => {
                let messages = self
                    .server
                    .router
                    .read(session_id, tail.unwrap_or(consts::DEFAULT_MSG_READ_TAIL));
                Response::MsgReadResult { messages }
            }
            Request::MsgRequest { from, to_id, to_name, body, timeout_s } => {
                self.handle_msg_request(from, to_id, to_name, body, timeout_s).await
            }
            Request::MsgReply { from, request_id, body } => {
                let from_id = from.unwrap_or(0);
                let from_name = self.server.registry.session_name(from_id);
                match self.server.router.reply(from_id, from_name, &request_id, body) {
                    Ok(()) => Response::MsgReplySent,
                    Err(e) => Response::error(e.to_string()),
                }
            }
            Request::MsgListen { session_id } => {
                let filter = EventFilter {
                    session_id,
                    tags: vec![],
                    event_types: vec![
                        String::from(protocol::EVENT_DIRECT_MESSAGE),
                        String::from(protocol::EVENT_MESSAGE_REQUEST),
                        String::from(protocol::EVENT_MESSAGE_REPLY),
                    ],
                };
                let sink = ClientSink::new(self.out_tx.clone());
                let subscription_id = self.server.bus.subscribe(filter, sink);
                self.subscriptions.push(subscription_id);
                Response::MsgListenAck { subscription_id }
            }
        }
    }

    async fn handle_attach(
        &mut self,
        session: SessionSelector,
        include_history: bool,
        cols: Option<u16>,
        rows: Option<u16>,
    ) -> Response {
        if let Some(att) = &self.attached {
            if att.sink.is_closed() {
                // the previous stream ended under us (session done or
                // slow-consumer drop); the slot is free again
                self.attached = None;
            } else {
                return Response::error("already attached");
            }
        }

        let handle = match self.server.registry.resolve(&session) {
            Ok(h) => h,
            Err(e) => return Response::error(format!("{e:#}")),
        };
        if !handle.is_live() {
            return Response::error(format!("session {} completed", handle.id));
        }

        let sink = ClientSink::new(self.out_tx.clone());
        let size = match (cols, rows) {
            (Some(c), Some(r)) => Some((c, r)),
            _ => None,
        };
        let (tx, rx) = oneshot::channel();
        let cmd = SessionCommand::Attach {
            sink: sink.clone(),
            role: AttachRole::Attached,
            include_history,
            size,
            reply: tx,
        };
        if !handle.send(cmd).await {
            return Response::error(format!("session {} completed", handle.id));
        }
        match rx.await {
            Ok(AttachDone { attacher_id, from_offset }) => {
                let session_id = handle.id;
                self.attached = Some(AttachedStream { session: handle, attacher_id, sink });
                Response::Attached { session_id, attacher_id, from_offset }
            }
            Err(_) => Response::error(format!("session {} completed", handle.id)),
        }
    }

    async fn handle_watch(&mut self, session: SessionSelector, include_history: bool) -> Response {
        let handle = match self.server.registry.resolve(&session) {
            Ok(h) => h,
            Err(e) => return Response::error(format!("{e:#}")),
        };
        if !handle.is_live() {
            // nothing left to stream
            return Response::WatchUpdate { session_id: handle.id, done: true };
        }

        let sink = ClientSink::new(self.out_tx.clone());
        let (tx, rx) = oneshot::channel();
        let cmd = SessionCommand::Attach {
            sink,
            role: AttachRole::Watching,
            include_history,
            size: None,
            reply: tx,
        };
        if !handle.send(cmd).await {
            return Response::WatchUpdate { session_id: handle.id, done: true };
        }
        match rx.await {
            Ok(AttachDone { attacher_id, .. }) => {
                let session_id = handle.id;
                self.watches.push((handle, attacher_id));
                Response::WatchUpdate { session_id, done: false }
            }
            Err(_) => Response::WatchUpdate { session_id: handle.id, done: true },
        }
    }

    async fn handle_logs(
        &mut self,
        session: SessionSelector,
        offset: Option<u64>,
        max_bytes: Option<u64>,
        strip_ansi: Option<bool>,
        follow: Option<bool>,
    ) -> Response {
        let handle = match self.server.registry.resolve(&session) {
            Ok(h) => h,
            Err(e) => return Response::error(format!("{e:#}")),
        };

        // a LogData reply has to fit in one frame
        let cap = (consts::MAX_FRAME_PAYLOAD / 2) as u64;
        let max = max_bytes.unwrap_or(cap).min(cap) as usize;
        let (bytes, start_offset, next_offset) =
            handle.read_output(offset.unwrap_or(0), max);

        let data = if strip_ansi.unwrap_or(true) {
            String::from_utf8_lossy(&strip_ansi_escapes::strip(&bytes)).into_owned()
        } else {
            String::from_utf8_lossy(&bytes).into_owned()
        };

        if follow.unwrap_or(false) && handle.is_live() {
            let sink = ClientSink::new(self.out_tx.clone());
            let (tx, rx) = oneshot::channel();
            let cmd = SessionCommand::Attach {
                sink,
                role: AttachRole::Watching,
                include_history: false,
                size: None,
                reply: tx,
            };
            if handle.send(cmd).await {
                if let Ok(AttachDone { attacher_id, .. }) = rx.await {
                    self.watches.push((handle.clone(), attacher_id));
                }
            }
        }

        Response::LogData { session_id: handle.id, data, start_offset, next_offset }
    }

    async fn handle_msg_request(
        &mut self,
        from: Option<u32>,
        to_id: Option<u32>,
        to_name: Option<String>,
        body: String,
        timeout_s: Option<u64>,
    ) -> Response {
        let selector = SessionSelector { session_id: to_id, session_name: to_name };
        let handle = match self.server.registry.resolve(&selector) {
            Ok(h) => h,
            Err(e) => return Response::error(format!("{e:#}")),
        };

        let from_id = from.unwrap_or(0);
        let from_name = self.server.registry.session_name(from_id);
        let timeout = timeout_s
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.server.config.default_request_timeout());

        let (request_id, reply_rx) =
            self.server.router.request(from_id, from_name, handle.id, &handle.tags, body, timeout);

        // this deliberately parks the connection until the reply or
        // the deadline; that is the contract of MsgRequest
        match time::timeout(timeout, reply_rx).await {
            Ok(Ok(payload)) => Response::MsgRequestResult {
                request_id,
                reply_body: payload.body,
                from_id: payload.from_id,
                from_name: payload.from_name,
            },
            Ok(Err(_)) | Err(_) => {
                self.server.router.expire(&request_id);
                Response::error("request timed out")
            }
        }
    }

    /// Resolve a selector, falling back to this connection's
    /// attached session when the selector is empty.
    fn resolve_or_attached(
        &self,
        session: &SessionSelector,
    ) -> Result<SessionHandle, Box<Response>> {
        if session.is_empty() {
            if let Some(att) = &self.attached {
                return Ok(att.session.clone());
            }
        }
        self.server
            .registry
            .resolve(session)
            .map_err(|e| Box::new(Response::error(format!("{e:#}"))))
    }

    fn forward_kv(&self, req: KvRequest) -> Response {
        match self.server.hooks.kv(req) {
            Ok(result) => Response::KVResult { value: result.value, keys: result.keys },
            Err(e) => Response::error(format!("{e:#}")),
        }
    }

    /// Give back everything this connection holds. Runs on every
    /// disconnect, clean or not.
    async fn cleanup(&mut self) {
        if let Some(att) = self.attached.take() {
            let (tx, _rx) = oneshot::channel();
            let _ = att
                .session
                .send(SessionCommand::Detach { attacher_id: att.attacher_id, reply: tx })
                .await;
        }
        for (session, attacher_id) in self.watches.drain(..) {
            let (tx, _rx) = oneshot::channel();
            let _ = session.send(SessionCommand::Detach { attacher_id, reply: tx }).await;
        }
        for id in self.subscriptions.drain(..) {
            self.server.bus.unsubscribe(id);
        }
    }
}

/// Reject connections from other users: the socket lives in the
/// operator's data dir, and the sessions behind it run as them.
fn check_peer(stream: &UnixStream) -> anyhow::Result<()> {
    let cred = stream.peer_cred().context("could not get peer creds from socket")?;
    let self_uid = nix::unistd::Uid::current();
    if cred.uid() != self_uid.as_raw() {
        return Err(anyhow!("codewire prohibits connections across users"));
    }
    Ok(())
}
