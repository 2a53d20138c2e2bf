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

//! Directed messaging between sessions: fire-and-forget sends into
//! bounded per-session inboxes, plus request/reply with a pending
//! table and deadlines.
//!
//! Ordering guarantee: a message is appended (and a request
//! registered) before its event is published, so a subscriber that
//! observes a `message.request` can always reply to it.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::anyhow;
use chrono::Utc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    daemon::events::EventBus,
    protocol::{self, StoredMessage},
};

/// What a replier hands back to the blocked requester.
#[derive(Debug)]
pub struct ReplyPayload {
    pub body: String,
    pub from_id: u32,
    pub from_name: String,
}

struct Pending {
    to_id: u32,
    deadline: Instant,
    reply_tx: oneshot::Sender<ReplyPayload>,
}

struct RouterInner {
    next_message_id: u64,
    next_request_id: u64,
    inboxes: HashMap<u32, VecDeque<StoredMessage>>,
    pending: HashMap<String, Pending>,
}

#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<Mutex<RouterInner>>,
    bus: EventBus,
    inbox_cap: usize,
}

impl MessageRouter {
    pub fn new(bus: EventBus, inbox_cap: usize) -> MessageRouter {
        MessageRouter {
            inner: Arc::new(Mutex::new(RouterInner {
                next_message_id: 1,
                next_request_id: 1,
                inboxes: HashMap::new(),
                pending: HashMap::new(),
            })),
            bus,
            inbox_cap,
        }
    }

    /// Append a fire-and-forget message to the target inbox and
    /// publish `direct.message`. The caller has already resolved the
    /// target through the registry.
    pub fn send(
        &self,
        from_id: u32,
        from_name: String,
        to_id: u32,
        to_tags: &[String],
        body: String,
    ) -> String {
        let message_id;
        {
            let mut inner = self.inner.lock().unwrap();
            message_id = format!("msg-{}", inner.next_message_id);
            inner.next_message_id += 1;
            let msg = StoredMessage {
                message_id: message_id.clone(),
                request_id: None,
                from_id,
                from_name: from_name.clone(),
                body: body.clone(),
                sent_at: Utc::now().to_rfc3339(),
            };
            self.push_to_inbox(&mut inner, to_id, msg);
        }

        self.bus.publish(
            protocol::EVENT_DIRECT_MESSAGE,
            to_id,
            to_tags,
            serde_json::json!({
                "message_id": message_id,
                "from_id": from_id,
                "from_name": from_name,
                "to_id": to_id,
                "body": body,
            }),
        );

        message_id
    }

    /// Newest-last view of the target inbox, at most `tail` entries.
    pub fn read(&self, session_id: u32, tail: usize) -> Vec<StoredMessage> {
        let inner = self.inner.lock().unwrap();
        match inner.inboxes.get(&session_id) {
            Some(inbox) => {
                let skip = inbox.len().saturating_sub(tail);
                inbox.iter().skip(skip).cloned().collect()
            }
            None => vec![],
        }
    }

    /// Register a request with a deadline, park the requester's
    /// one-shot reply sink, drop the request into the target inbox,
    /// then publish `message.request`. The caller awaits the
    /// receiver (with its own timeout) and calls [`Self::expire`] if
    /// the deadline passes first.
    pub fn request(
        &self,
        from_id: u32,
        from_name: String,
        to_id: u32,
        to_tags: &[String],
        body: String,
        timeout: Duration,
    ) -> (String, oneshot::Receiver<ReplyPayload>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request_id;
        {
            let mut inner = self.inner.lock().unwrap();
            sweep_pending(&mut inner);

            request_id = format!("req-{}", inner.next_request_id);
            inner.next_request_id += 1;
            inner.pending.insert(
                request_id.clone(),
                Pending { to_id, deadline: Instant::now() + timeout, reply_tx },
            );

            let message_id = format!("msg-{}", inner.next_message_id);
            inner.next_message_id += 1;
            let msg = StoredMessage {
                message_id,
                request_id: Some(request_id.clone()),
                from_id,
                from_name: from_name.clone(),
                body: body.clone(),
                sent_at: Utc::now().to_rfc3339(),
            };
            self.push_to_inbox(&mut inner, to_id, msg);
        }

        self.bus.publish(
            protocol::EVENT_MESSAGE_REQUEST,
            to_id,
            to_tags,
            serde_json::json!({
                "request_id": request_id,
                "from_id": from_id,
                "from_name": from_name,
                "to_id": to_id,
                "body": body,
            }),
        );

        (request_id, reply_rx)
    }

    /// Deliver a reply to the waiting requester. A request can be
    /// answered at most once; second answers and answers to expired
    /// requests are refused.
    pub fn reply(
        &self,
        from_id: u32,
        from_name: String,
        request_id: &str,
        body: String,
    ) -> anyhow::Result<()> {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            sweep_pending(&mut inner);
            inner
                .pending
                .remove(request_id)
                .ok_or_else(|| anyhow!("unknown or expired request"))?
        };

        let to_id = pending.to_id;
        if pending
            .reply_tx
            .send(ReplyPayload { body: body.clone(), from_id, from_name: from_name.clone() })
            .is_err()
        {
            // requester hung up after the deadline sweep; treat the
            // request as expired
            return Err(anyhow!("unknown or expired request"));
        }

        self.bus.publish(
            protocol::EVENT_MESSAGE_REPLY,
            to_id,
            &[],
            serde_json::json!({
                "request_id": request_id,
                "from_id": from_id,
                "from_name": from_name,
                "body": body,
            }),
        );

        Ok(())
    }

    /// Forget a request whose deadline passed. Harmless if a reply
    /// already claimed it.
    pub fn expire(&self, request_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.remove(request_id).is_some() {
            debug!("request {} expired unanswered", request_id);
        }
    }

    /// Drop the inbox of an evicted session.
    pub fn evict(&self, session_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.inboxes.remove(&session_id);
    }

    fn push_to_inbox(&self, inner: &mut RouterInner, to_id: u32, msg: StoredMessage) {
        let inbox = inner.inboxes.entry(to_id).or_default();
        inbox.push_back(msg);
        while inbox.len() > self.inbox_cap {
            inbox.pop_front();
        }
    }
}

/// Drop pending entries whose deadline passed or whose requester
/// already hung up, so abandoned requests cannot pile up.
fn sweep_pending(inner: &mut RouterInner) {
    let now = Instant::now();
    inner.pending.retain(|_, p| p.deadline > now && !p.reply_tx.is_closed());
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::consts;

    fn router() -> MessageRouter {
        MessageRouter::new(EventBus::new(consts::DEFAULT_SUBSCRIPTION_BUFFER), 5)
    }

    #[tokio::test]
    async fn send_and_read_newest_last() {
        let r = router();
        for i in 0..3 {
            r.send(0, String::new(), 9, &[], format!("m{i}"));
        }

        let msgs = r.read(9, 2);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].body, "m1");
        assert_eq!(msgs[1].body, "m2");
        assert_eq!(msgs[1].from_id, 0);
        assert_eq!(msgs[1].from_name, "");

        assert!(r.read(1234, 10).is_empty());
    }

    #[tokio::test]
    async fn inbox_keeps_latest() {
        let r = router();
        for i in 0..8 {
            r.send(1, String::from("a"), 2, &[], format!("m{i}"));
        }
        let msgs = r.read(2, 100);
        assert_eq!(msgs.len(), 5);
        assert_eq!(msgs[0].body, "m3");
        assert_eq!(msgs[4].body, "m7");
    }

    #[tokio::test]
    async fn request_reply_round_trip() -> anyhow::Result<()> {
        let r = router();
        let (request_id, reply_rx) =
            r.request(1, String::from("alpha"), 2, &[], String::from("status?"), Duration::from_secs(5));

        // the request is visible in the target inbox with its id
        let msgs = r.read(2, 10);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].request_id.as_deref(), Some(request_id.as_str()));

        r.reply(2, String::from("beta"), &request_id, String::from("ok"))?;
        let payload = reply_rx.await?;
        assert_eq!(payload.body, "ok");
        assert_eq!(payload.from_id, 2);
        assert_eq!(payload.from_name, "beta");

        // a second reply is refused
        let err = r.reply(2, String::from("beta"), &request_id, String::from("again")).unwrap_err();
        assert!(err.to_string().contains("unknown or expired"));

        Ok(())
    }

    #[tokio::test]
    async fn unknown_request_refused() {
        let r = router();
        let err = r.reply(1, String::new(), "req-404", String::from("hi")).unwrap_err();
        assert!(err.to_string().contains("unknown or expired"));
    }

    #[tokio::test]
    async fn expired_request_refused() {
        let r = router();
        let (request_id, _reply_rx) =
            r.request(0, String::new(), 2, &[], String::from("ping"), Duration::from_millis(0));

        // deadline already passed, so the sweep eats it
        let err = r.reply(2, String::new(), &request_id, String::from("pong")).unwrap_err();
        assert!(err.to_string().contains("unknown or expired"));
    }
}
