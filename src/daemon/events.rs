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

//! The typed event bus. Publishers fire and forget; every
//! subscription gets its own bounded buffer and delivery task so one
//! slow client can only ever lose its own events.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::{daemon::server::ClientSink, protocol::Response};

/// What a subscription wants to see. All present parts must match.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events for this session.
    pub session_id: Option<u32>,
    /// Only events for sessions carrying every one of these tags.
    pub tags: Vec<String>,
    /// Only these event types; empty means any.
    pub event_types: Vec<String>,
}

impl EventFilter {
    fn matches(&self, session_id: u32, tags: &[String], event_type: &str) -> bool {
        if let Some(want) = self.session_id {
            if want != session_id {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().all(|t| tags.contains(t)) {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.iter().any(|t| t == event_type) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone)]
struct QueuedEvent {
    timestamp: String,
    event_type: &'static str,
    data: serde_json::Value,
}

struct SubQueue {
    filter: EventFilter,
    buf: Mutex<VecDeque<QueuedEvent>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

struct BusInner {
    next_id: u64,
    subs: HashMap<u64, Arc<SubQueue>>,
}

/// Handle to the bus. Cheap to clone; publishing takes a short lock
/// on the subscription table and never waits on any client.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
    buffer_cap: usize,
}

impl EventBus {
    pub fn new(buffer_cap: usize) -> EventBus {
        EventBus {
            inner: Arc::new(Mutex::new(BusInner { next_id: 1, subs: HashMap::new() })),
            buffer_cap,
        }
    }

    /// Register a subscription delivering matching events to `sink`
    /// as `Event` control frames. Returns the subscription id.
    pub fn subscribe(&self, filter: EventFilter, sink: ClientSink) -> u64 {
        let queue = Arc::new(SubQueue {
            filter,
            buf: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let id = {
            // we unwrap to propagate the poison as an unwind
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.subs.insert(id, Arc::clone(&queue));
            id
        };

        let bus = self.clone();
        tokio::spawn(async move {
            loop {
                if queue.closed.load(Ordering::Acquire) {
                    break;
                }
                let next = queue.buf.lock().unwrap().pop_front();
                match next {
                    Some(ev) => {
                        let resp = Response::Event {
                            subscription_id: id,
                            timestamp: ev.timestamp,
                            event_type: String::from(ev.event_type),
                            data: ev.data,
                        };
                        if sink.send_control(resp).is_err() {
                            debug!("subscription {} sink closed, reaping", id);
                            bus.unsubscribe(id);
                            break;
                        }
                    }
                    None => {
                        if queue.closed.load(Ordering::Acquire) {
                            break;
                        }
                        queue.notify.notified().await;
                    }
                }
            }
        });

        id
    }

    /// Tear down a subscription. Returns how many events it dropped
    /// on the floor over its lifetime, or None if the id is unknown.
    pub fn unsubscribe(&self, id: u64) -> Option<u64> {
        let queue = {
            let mut inner = self.inner.lock().unwrap();
            inner.subs.remove(&id)
        }?;
        queue.closed.store(true, Ordering::Release);
        queue.notify.notify_one();
        Some(queue.dropped.load(Ordering::Acquire))
    }

    /// Fan an event out to every matching subscription. Best-effort:
    /// a full subscription buffer sheds its oldest event.
    pub fn publish(
        &self,
        event_type: &'static str,
        session_id: u32,
        tags: &[String],
        data: serde_json::Value,
    ) {
        let timestamp = Utc::now().to_rfc3339();
        let inner = self.inner.lock().unwrap();
        for (id, queue) in inner.subs.iter() {
            if !queue.filter.matches(session_id, tags, event_type) {
                continue;
            }

            {
                let mut buf = queue.buf.lock().unwrap();
                if buf.len() >= self.buffer_cap {
                    buf.pop_front();
                    let dropped = queue.dropped.fetch_add(1, Ordering::AcqRel) + 1;
                    if dropped == 1 || dropped % 100 == 0 {
                        warn!("subscription {} overflowed, {} events dropped so far", id, dropped);
                    }
                }
                buf.push_back(QueuedEvent {
                    timestamp: timestamp.clone(),
                    event_type,
                    data: data.clone(),
                });
            }
            queue.notify.notify_one();
        }
    }
}
