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

//! The pty-session actor. One task owns everything mutable about a
//! session: the child handle, the pty master, the output ring, the
//! attacher set, and the authoritative session record. Everyone else
//! talks to it through its inbox and gets copies back.

use std::{
    os::fd::OwnedFd,
    os::unix::process::ExitStatusExt as _,
    process::ExitStatus,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use nix::{sys::signal, unistd::Pid};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    process::{Child, Command},
    sync::{mpsc, oneshot, watch},
    time::{self, Instant},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    consts,
    daemon::{events::EventBus, output::OutputBuffer, pty, server::ClientSink},
    protocol::{self, Response, SessionInfo, SessionStatus},
};

/// How long after child exit we keep draining buffered pty output.
/// Grandchildren can keep the pty open indefinitely, so this has to
/// be bounded.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// History replay is cut into data frames of at most this size.
const HISTORY_CHUNK: usize = 32 * 1024;

/// Everything needed to launch one session.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub id: u32,
    pub name: Option<String>,
    pub cmd: Vec<String>,
    pub cwd: Option<String>,
    /// KEY=VALUE overlay on top of the daemon's environment.
    pub env: Vec<String>,
    /// Operator-configured extra environment, applied first.
    pub extra_env: Vec<(String, String)>,
    pub tags: Vec<String>,
    pub stdin_data: Option<Vec<u8>>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachRole {
    /// Counts toward attached-count and may send stdin.
    Attached,
    /// Read-only observer.
    Watching,
}

/// Where a stdin write came from. Input relayed for a data frame is
/// only honored for the first attached attacher; explicit
/// `SendInput` requests always go through.
#[derive(Debug, Clone, Copy)]
pub enum InputSource {
    Attacher(u64),
    Explicit,
}

#[derive(Debug)]
pub struct AttachDone {
    pub attacher_id: u64,
    pub from_offset: u64,
}

pub enum SessionCommand {
    Resize {
        cols: u16,
        rows: u16,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    WriteInput {
        data: Vec<u8>,
        source: InputSource,
        reply: Option<oneshot::Sender<anyhow::Result<()>>>,
    },
    Attach {
        sink: ClientSink,
        role: AttachRole,
        include_history: bool,
        size: Option<(u16, u16)>,
        reply: oneshot::Sender<AttachDone>,
    },
    Detach {
        attacher_id: u64,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionInfo>,
    },
    Kill {
        signal: Option<i32>,
        reply: Option<oneshot::Sender<()>>,
    },
}

/// A cheap handle to a session. The watch side keeps working after
/// the actor exits, so terminal sessions stay inspectable until the
/// registry evicts them.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: u32,
    pub tags: Vec<String>,
    inbox: mpsc::Sender<SessionCommand>,
    pub info_rx: watch::Receiver<SessionInfo>,
    ring: Arc<Mutex<OutputBuffer>>,
}

impl SessionHandle {
    /// Whether the owning actor is still running.
    pub fn is_live(&self) -> bool {
        !self.inbox.is_closed()
    }

    /// Post a command to the actor. Returns false if the actor has
    /// already terminated.
    pub async fn send(&self, cmd: SessionCommand) -> bool {
        self.inbox.send(cmd).await.is_ok()
    }

    /// The latest published snapshot, without a round trip.
    pub fn info(&self) -> SessionInfo {
        self.info_rx.borrow().clone()
    }

    /// The authoritative snapshot from the actor, falling back to
    /// the final published record once the actor is gone.
    pub async fn snapshot(&self) -> SessionInfo {
        let (tx, rx) = oneshot::channel();
        if self.inbox.send(SessionCommand::Snapshot { reply: tx }).await.is_ok() {
            if let Ok(info) = rx.await {
                return info;
            }
        }
        self.info()
    }

    /// Concurrent read of the output ring; does not involve the actor.
    pub fn read_output(&self, from: u64, max: usize) -> (Vec<u8>, u64, u64) {
        let ring = self.ring.lock().unwrap();
        ring.snapshot(from, max)
    }

    /// A handle for a session restored from the catalogue: no actor,
    /// no pty, just the terminal record.
    pub fn finished(info: SessionInfo) -> SessionHandle {
        let (inbox, _) = mpsc::channel(1);
        let (_info_tx, info_rx) = watch::channel(info.clone());
        SessionHandle {
            id: info.id,
            tags: info.tags,
            inbox,
            info_rx,
            ring: Arc::new(Mutex::new(OutputBuffer::new(1))),
        }
    }
}

/// Launch the child in a fresh pty and start its owning actor.
/// Failure here means no session exists: the registry releases its
/// name reservation and reports the OS error.
#[instrument(skip_all, fields(sid = spec.id))]
pub fn spawn(
    spec: LaunchSpec,
    ring_bytes: usize,
    high_water: usize,
    bus: EventBus,
    exit_tx: mpsc::UnboundedSender<u32>,
) -> anyhow::Result<SessionHandle> {
    if spec.cmd.is_empty() {
        return Err(anyhow!("no command to run"));
    }

    let cols = spec.cols.unwrap_or(consts::DEFAULT_TTY_COLS);
    let rows = spec.rows.unwrap_or(consts::DEFAULT_TTY_ROWS);
    let (master, slave) = pty::open(cols, rows)?;
    let (stdin, stdout, stderr) = pty::child_stdio(&slave)?;

    let cwd = spec
        .cwd
        .clone()
        .or_else(|| std::env::var("HOME").ok())
        .unwrap_or_else(|| String::from("/"));

    let mut cmd = Command::new(&spec.cmd[0]);
    cmd.args(&spec.cmd[1..])
        .current_dir(&cwd)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(stderr);
    for (key, val) in spec.extra_env.iter() {
        cmd.env(key, val);
    }
    for entry in spec.env.iter() {
        let (key, val) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid env entry '{entry}', want KEY=VALUE"))?;
        cmd.env(key, val);
    }
    cmd.env(consts::SESSION_ID_VAR, spec.id.to_string());
    if let Some(name) = &spec.name {
        cmd.env(consts::SESSION_NAME_VAR, name);
    }
    // Safety: set_controlling_tty only makes async-signal-safe calls.
    unsafe {
        cmd.pre_exec(pty::set_controlling_tty);
    }

    let child = cmd.spawn().with_context(|| format!("spawning '{}'", spec.cmd[0]))?;
    drop(slave);
    let pid = child.id().map(|p| p as i32);
    info!("spawned '{}' as pid {:?} in {}", spec.cmd[0], pid, cwd);

    let writer = pty::dup_async_file(&master)?;
    let mut reader = pty::dup_async_file(&master)?;

    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(32);
    tokio::spawn(async move {
        let mut buf = vec![0u8; consts::PTY_BUF_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if out_tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // EIO here just means the last slave handle closed
                    debug!("pty read loop ending: {}", e);
                    break;
                }
            }
        }
    });

    let info = SessionInfo {
        id: spec.id,
        name: spec.name.clone(),
        prompt: shell_words::join(spec.cmd.iter()),
        cmd: spec.cmd.clone(),
        cwd,
        env: spec.env.clone(),
        tags: spec.tags.clone(),
        created_at: Utc::now().to_rfc3339(),
        completed_at: None,
        exit_code: None,
        status: SessionStatus::Running,
        pid,
        attached_count: 0,
        output_bytes: 0,
        output_lines: 0,
        last_output_at: None,
    };

    // announce the running transition before the actor exists, so a
    // child that exits immediately cannot publish its terminal
    // transition first
    bus.publish(
        protocol::EVENT_SESSION_STATUS,
        spec.id,
        &spec.tags,
        serde_json::json!({ "session_id": spec.id, "status": "running" }),
    );

    let (info_tx, info_rx) = watch::channel(info.clone());
    let (inbox_tx, inbox_rx) = mpsc::channel(64);
    let ring = Arc::new(Mutex::new(OutputBuffer::new(ring_bytes)));

    let actor = SessionActor {
        info,
        ring: Arc::clone(&ring),
        attachers: vec![],
        next_attacher_id: 1,
        master,
        writer,
        info_tx,
        bus,
        exit_tx,
        high_water,
        last_output_event: None,
        kill_deadline: None,
        pid,
    };
    tokio::spawn(actor.run(inbox_rx, out_rx, child, spec.stdin_data));

    Ok(SessionHandle {
        id: spec.id,
        tags: spec.tags,
        inbox: inbox_tx,
        info_rx,
        ring,
    })
}

struct Attacher {
    id: u64,
    role: AttachRole,
    sink: ClientSink,
}

struct SessionActor {
    info: SessionInfo,
    ring: Arc<Mutex<OutputBuffer>>,
    attachers: Vec<Attacher>,
    next_attacher_id: u64,
    master: OwnedFd,
    writer: tokio::fs::File,
    info_tx: watch::Sender<SessionInfo>,
    bus: EventBus,
    exit_tx: mpsc::UnboundedSender<u32>,
    high_water: usize,
    last_output_event: Option<Instant>,
    kill_deadline: Option<Instant>,
    pid: Option<i32>,
}

impl SessionActor {
    #[instrument(skip_all, fields(sid = self.info.id))]
    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<SessionCommand>,
        mut out_rx: mpsc::Receiver<Vec<u8>>,
        mut child: Child,
        stdin_data: Option<Vec<u8>>,
    ) {
        // Initial stdin goes to the pty before any attacher input.
        // This only feeds data, it never signals end-of-input: ptys
        // have no EOF to give.
        if let Some(data) = stdin_data {
            if let Err(e) = self.writer.write_all(&data).await {
                warn!("writing launch stdin_data: {}", e);
            }
            let _ = self.writer.flush().await;
        }

        let mut inbox_open = true;
        let exit_status = loop {
            let kill_wake = self.kill_deadline;
            tokio::select! {
                cmd = inbox.recv(), if inbox_open => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        // every handle is gone, which means the
                        // registry evicted us; take the child down
                        inbox_open = false;
                        self.signal_child(signal::Signal::SIGKILL);
                    }
                },
                chunk = out_rx.recv() => {
                    if let Some(bytes) = chunk {
                        self.handle_output(&bytes);
                    }
                },
                status = child.wait() => break status,
                _ = sleep_until_opt(kill_wake), if kill_wake.is_some() => {
                    info!("kill grace period expired, escalating to SIGKILL");
                    self.kill_deadline = None;
                    self.signal_child(signal::Signal::SIGKILL);
                },
            }
        };

        // pick up output that was already in flight when the child went down
        let drain_deadline = Instant::now() + EXIT_DRAIN_TIMEOUT;
        loop {
            match time::timeout_at(drain_deadline, out_rx.recv()).await {
                Ok(Some(bytes)) => self.handle_output(&bytes),
                Ok(None) | Err(_) => break,
            }
        }

        self.finish(exit_status.ok());
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Resize { cols, rows, reply } => {
                let res = pty::resize(&self.master, cols, rows);
                let _ = reply.send(res);
            }
            SessionCommand::WriteInput { data, source, reply } => {
                let allowed = match source {
                    InputSource::Explicit => true,
                    InputSource::Attacher(id) => self.first_attached() == Some(id),
                };
                let res = if allowed {
                    self.write_stdin(&data).await
                } else {
                    debug!("dropping stdin from non-primary attacher");
                    Ok(())
                };
                if let Some(reply) = reply {
                    let _ = reply.send(res);
                }
            }
            SessionCommand::Attach { sink, role, include_history, size, reply } => {
                let attacher_id = self.next_attacher_id;
                self.next_attacher_id += 1;

                if let (Some((cols, rows)), AttachRole::Attached) = (size, role) {
                    if let Err(e) = pty::resize(&self.master, cols, rows) {
                        warn!("resize on attach failed: {:?}", e);
                    }
                }

                let from_offset = if include_history {
                    self.replay_history(&sink)
                } else {
                    self.ring.lock().unwrap().end_offset()
                };

                self.attachers.push(Attacher { id: attacher_id, role, sink });
                self.refresh_attached_count();
                let _ = reply.send(AttachDone { attacher_id, from_offset });
            }
            SessionCommand::Detach { attacher_id, reply } => {
                let found = match self.attachers.iter().position(|a| a.id == attacher_id) {
                    Some(idx) => {
                        let attacher = self.attachers.remove(idx);
                        attacher.sink.close();
                        true
                    }
                    None => false,
                };
                self.refresh_attached_count();
                let _ = reply.send(found);
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.info.clone());
            }
            SessionCommand::Kill { signal: sig, reply } => {
                match sig {
                    Some(raw) => match signal::Signal::try_from(raw) {
                        Ok(sig) => self.signal_child(sig),
                        Err(_) => warn!("ignoring unknown signal {}", raw),
                    },
                    None => {
                        self.signal_child(signal::Signal::SIGTERM);
                        if self.kill_deadline.is_none() {
                            self.kill_deadline =
                                Some(Instant::now() + consts::KILL_GRACE_PERIOD);
                        }
                    }
                }
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
    }

    /// Feed retained history into a fresh attacher sink, returning
    /// the offset the replay starts at. If the ring already shed its
    /// prefix this is later than zero; no marker is inserted, the
    /// attach reply carries the offset instead.
    fn replay_history(&self, sink: &ClientSink) -> u64 {
        let (history, start, _) = {
            let ring = self.ring.lock().unwrap();
            let earliest = ring.earliest_offset();
            ring.snapshot(earliest, usize::MAX)
        };
        for chunk in history.chunks(HISTORY_CHUNK) {
            if sink.send_data(chunk.to_vec()).is_err() {
                break;
            }
        }
        start
    }

    fn handle_output(&mut self, bytes: &[u8]) {
        let end_offset = {
            let mut ring = self.ring.lock().unwrap();
            ring.append(bytes)
        };
        self.info.output_bytes += bytes.len() as u64;
        self.info.output_lines += bytes.iter().filter(|b| **b == b'\n').count() as u64;
        self.info.last_output_at = Some(Utc::now().to_rfc3339());

        let mut dropped = vec![];
        for (idx, attacher) in self.attachers.iter().enumerate() {
            if attacher.sink.pending_bytes() > self.high_water {
                warn!(
                    "attacher {} of session {} fell {} bytes behind, dropping",
                    attacher.id,
                    self.info.id,
                    attacher.sink.pending_bytes()
                );
                let _ = attacher.sink.send_control(Response::error(format!(
                    "slow consumer: detached from session {}",
                    self.info.id
                )));
                attacher.sink.close();
                dropped.push(idx);
                continue;
            }
            if attacher.sink.send_data(bytes.to_vec()).is_err() {
                dropped.push(idx);
            }
        }
        for idx in dropped.into_iter().rev() {
            self.attachers.remove(idx);
        }
        self.refresh_attached_count();

        let now = Instant::now();
        let due = self
            .last_output_event
            .map(|at| now.duration_since(at) >= consts::OUTPUT_EVENT_INTERVAL)
            .unwrap_or(true);
        if due {
            // excess chunks within the interval are coalesced by
            // dropping the event, never the bytes
            self.last_output_event = Some(now);
            self.bus.publish(
                protocol::EVENT_SESSION_OUTPUT,
                self.info.id,
                &self.info.tags,
                serde_json::json!({
                    "session_id": self.info.id,
                    "output_bytes": self.info.output_bytes,
                    "end_offset": end_offset,
                }),
            );
            self.push_info();
        }
    }

    fn finish(&mut self, exit_status: Option<ExitStatus>) {
        let (status, exit_code) = match exit_status {
            Some(es) => match es.code() {
                Some(0) => (SessionStatus::Completed, 0),
                Some(code) => (SessionStatus::CompletedError, code),
                None => {
                    let signum = es.signal().unwrap_or(libc::SIGKILL);
                    (SessionStatus::Killed, 128 + signum)
                }
            },
            None => (SessionStatus::Failed, -1),
        };
        info!("session {} finished: {} (exit code {})", self.info.id, status, exit_code);

        self.info.status = status;
        self.info.exit_code = Some(exit_code);
        self.info.completed_at = Some(Utc::now().to_rfc3339());
        self.info.attached_count = 0;
        self.push_info();

        // the one and only terminal-status publication for this session
        self.bus.publish(
            protocol::EVENT_SESSION_STATUS,
            self.info.id,
            &self.info.tags,
            serde_json::json!({
                "session_id": self.info.id,
                "status": status.to_string(),
                "exit_code": exit_code,
            }),
        );

        for attacher in self.attachers.drain(..) {
            let farewell = match attacher.role {
                AttachRole::Attached => {
                    Response::error(format!("session {} completed", self.info.id))
                }
                AttachRole::Watching => {
                    Response::WatchUpdate { session_id: self.info.id, done: true }
                }
            };
            let _ = attacher.sink.send_control(farewell);
            attacher.sink.close();
        }

        let _ = self.exit_tx.send(self.info.id);
    }

    async fn write_stdin(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.writer.write_all(data).await.context("writing to pty")?;
        self.writer.flush().await.context("flushing pty")?;
        Ok(())
    }

    fn first_attached(&self) -> Option<u64> {
        self.attachers.iter().find(|a| a.role == AttachRole::Attached).map(|a| a.id)
    }

    fn refresh_attached_count(&mut self) {
        let count =
            self.attachers.iter().filter(|a| a.role == AttachRole::Attached).count() as u32;
        if count != self.info.attached_count {
            self.info.attached_count = count;
            self.push_info();
        }
    }

    fn push_info(&self) {
        let _ = self.info_tx.send(self.info.clone());
    }

    fn signal_child(&self, sig: signal::Signal) {
        if let Some(pid) = self.pid {
            if let Err(e) = signal::kill(Pid::from_raw(pid), Some(sig)) {
                debug!("signalling child {}: {}", pid, e);
            }
        }
    }
}

async fn sleep_until_opt(wake: Option<Instant>) {
    match wake {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::daemon::server::ClientSink;

    fn launch(id: u32, cmd: Vec<&str>) -> LaunchSpec {
        LaunchSpec {
            id,
            name: None,
            cmd: cmd.into_iter().map(String::from).collect(),
            cwd: Some(String::from("/tmp")),
            env: vec![],
            extra_env: vec![],
            tags: vec![],
            stdin_data: None,
            cols: None,
            rows: None,
        }
    }

    fn test_bus() -> EventBus {
        EventBus::new(crate::consts::DEFAULT_SUBSCRIPTION_BUFFER)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn echo_reaches_attacher_and_ring() -> anyhow::Result<()> {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let handle = spawn(
            launch(1, vec!["sh", "-c", "echo pty-actor-test; sleep 0.1"]),
            1024 * 1024,
            1024 * 1024,
            test_bus(),
            exit_tx,
        )?;

        let (sink, mut rx) = ClientSink::test_pair();
        let (tx, attach_rx) = oneshot::channel();
        assert!(
            handle
                .send(SessionCommand::Attach {
                    sink,
                    role: AttachRole::Attached,
                    include_history: true,
                    size: None,
                    reply: tx,
                })
                .await
        );
        let done = attach_rx.await?;
        assert_eq!(done.from_offset, 0);

        let mut collected = vec![];
        while !String::from_utf8_lossy(&collected).contains("pty-actor-test") {
            let data = time::timeout(Duration::from_secs(5), rx.recv_data())
                .await
                .expect("output within 5s")
                .expect("stream open");
            collected.extend_from_slice(&data);
        }

        // the ring saw the same bytes
        assert_eq!(exit_rx.recv().await, Some(1));
        let (ring_bytes, _, _) = handle.read_output(0, 1 << 20);
        assert!(String::from_utf8_lossy(&ring_bytes).contains("pty-actor-test"));

        let final_info = handle.info();
        assert_eq!(final_info.status, SessionStatus::Completed);
        assert_eq!(final_info.exit_code, Some(0));
        assert!(final_info.completed_at.is_some());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn kill_escalates_and_reports_signal_exit() -> anyhow::Result<()> {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let handle = spawn(
            launch(2, vec!["sleep", "30"]),
            1024,
            1024 * 1024,
            test_bus(),
            exit_tx,
        )?;

        assert!(handle.send(SessionCommand::Kill { signal: None, reply: None }).await);
        assert_eq!(
            time::timeout(Duration::from_secs(5), exit_rx.recv()).await.expect("exit within 5s"),
            Some(2)
        );

        let info = handle.info();
        assert_eq!(info.status, SessionStatus::Killed);
        assert_eq!(info.exit_code, Some(128 + libc::SIGTERM));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stdin_data_is_fed_to_the_child() -> anyhow::Result<()> {
        let (exit_tx, _exit_rx) = mpsc::unbounded_channel();
        let mut spec = launch(3, vec!["head", "-n", "1"]);
        spec.stdin_data = Some(b"PROMPT_CONTENT_12345\n".to_vec());
        let handle = spawn(spec, 1024 * 1024, 1024 * 1024, test_bus(), exit_tx)?;

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let (bytes, _, _) = handle.read_output(0, 1 << 20);
            if String::from_utf8_lossy(&bytes).contains("PROMPT_CONTENT_12345") {
                break;
            }
            assert!(Instant::now() < deadline, "no echo of stdin_data within 5s");
            time::sleep(Duration::from_millis(25)).await;
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn injected_session_env_is_visible() -> anyhow::Result<()> {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let mut spec = launch(9, vec!["sh", "-c", "echo id=$CW_SESSION_ID name=$CW_SESSION_NAME"]);
        spec.name = Some(String::from("envcheck"));
        let handle = spawn(spec, 1024 * 1024, 1024 * 1024, test_bus(), exit_tx)?;

        assert_eq!(
            time::timeout(Duration::from_secs(5), exit_rx.recv()).await.expect("exit within 5s"),
            Some(9)
        );
        let (bytes, _, _) = handle.read_output(0, 1 << 20);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("id=9"), "output was: {text}");
        assert!(text.contains("name=envcheck"), "output was: {text}");
        Ok(())
    }
}
