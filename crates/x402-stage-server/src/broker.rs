//! In-process pub/sub for realtime stage events.
//!
//! Each live push connection is a bounded channel of pre-rendered SSE frames,
//! grouped by resource id and tagged with an [`Audience`]. Delivery is
//! best-effort: no buffering for late subscribers, a full channel drops the
//! frame for that connection only, and a closed channel is pruned on the next
//! publish or keepalive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::metrics::{EVENTS_PUBLISHED, SSE_SUBSCRIBERS};

/// Frames buffered per connection before new frames are dropped.
const CHANNEL_CAPACITY: usize = 64;

const KEEPALIVE_FRAME: &[u8] = b": keepalive\n\n";

/// Subscriber category for realtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    /// Public-facing display (e.g. a stream overlay).
    Display,
    /// Operator console.
    Console,
}

impl Audience {
    pub fn as_str(self) -> &'static str {
        match self {
            Audience::Display => "display",
            Audience::Console => "console",
        }
    }
}

/// Which audiences a published event reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudienceFilter {
    All,
    Only(Audience),
}

impl AudienceFilter {
    fn matches(self, audience: Audience) -> bool {
        match self {
            AudienceFilter::All => true,
            AudienceFilter::Only(a) => a == audience,
        }
    }
}

struct Subscriber {
    id: u64,
    audience: Audience,
    tx: mpsc::Sender<Bytes>,
}

/// A registered connection. Dropping the receiver unsubscribes.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Bytes>,
}

/// Registry of live connections keyed by resource id.
#[derive(Default)]
pub struct EventBroker {
    groups: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl EventBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `resource_id` and `audience`.
    pub fn subscribe(&self, resource_id: &str, audience: Audience) -> Subscription {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut groups = self.lock_groups();
        groups
            .entry(resource_id.to_string())
            .or_default()
            .push(Subscriber { id, audience, tx });
        SSE_SUBSCRIBERS.inc();

        tracing::debug!(
            resource_id = %resource_id,
            audience = audience.as_str(),
            subscriber = id,
            "subscriber connected"
        );
        Subscription { id, rx }
    }

    /// Fan an event out to every live connection on `resource_id` matching
    /// `filter`. Returns the number of connections the frame was queued on.
    pub fn publish(
        &self,
        resource_id: &str,
        event: &str,
        payload: &serde_json::Value,
        filter: AudienceFilter,
    ) -> usize {
        let frame = Bytes::from(sse_frame(event, payload));
        let mut delivered = 0;

        let mut groups = self.lock_groups();
        if let Some(subscribers) = groups.get_mut(resource_id) {
            subscribers.retain(|sub| {
                if sub.tx.is_closed() {
                    SSE_SUBSCRIBERS.dec();
                    return false;
                }
                if !filter.matches(sub.audience) {
                    return true;
                }
                match sub.tx.try_send(frame.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            resource_id = %resource_id,
                            subscriber = sub.id,
                            event = %event,
                            "subscriber lagging, dropping event"
                        );
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        SSE_SUBSCRIBERS.dec();
                        false
                    }
                }
            });
            if subscribers.is_empty() {
                groups.remove(resource_id);
            }
        }
        drop(groups);

        EVENTS_PUBLISHED.with_label_values(&[event]).inc();
        tracing::debug!(resource_id = %resource_id, event = %event, delivered, "event published");
        delivered
    }

    /// Send a comment frame to every connection and prune closed ones.
    pub fn keepalive(&self) {
        let frame = Bytes::from_static(KEEPALIVE_FRAME);
        let mut groups = self.lock_groups();
        groups.retain(|_, subscribers| {
            subscribers.retain(|sub| match sub.tx.try_send(frame.clone()) {
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    SSE_SUBSCRIBERS.dec();
                    false
                }
                _ => true,
            });
            !subscribers.is_empty()
        });
    }

    /// Run [`keepalive`](Self::keepalive) every `period` until the runtime shuts down.
    pub fn spawn_keepalive(
        self: &std::sync::Arc<Self>,
        period: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let broker = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                broker.keepalive();
            }
        })
    }

    /// Live connections on a resource (closed ones not yet pruned are excluded).
    pub fn subscriber_count(&self, resource_id: &str) -> usize {
        self.lock_groups()
            .get(resource_id)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn lock_groups(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Subscriber>>> {
        self.groups.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Render one named SSE event.
pub fn sse_frame(event: &str, payload: &serde_json::Value) -> String {
    format!("event: {event}\ndata: {payload}\n\n")
}
