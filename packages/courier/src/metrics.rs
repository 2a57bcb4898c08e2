//! Messaging service counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct ServiceMetrics {
    // Outbound
    pub requests_sent: AtomicU64,
    pub messages_sent: AtomicU64,
    pub responses_received: AtomicU64,
    /// Exchanges retried after a broken stream
    pub retries: AtomicU64,
    pub timeouts: AtomicU64,
    pub streams_opened: AtomicU64,
    /// Streams closed after reaching the reuse threshold
    pub streams_recycled: AtomicU64,
    pub senders_evicted: AtomicU64,

    // Inbound
    pub active_inbound_streams: AtomicU64,
    pub total_inbound_streams: AtomicU64,
    pub idle_resets: AtomicU64,
    pub messages_received: AtomicU64,
    /// Envelopes dropped for failing to decode or verify
    pub messages_dropped: AtomicU64,
    pub handler_errors: AtomicU64,

    // Broadcast
    pub broadcasts_received: AtomicU64,
    pub broadcast_replies: AtomicU64,

    start_time: Option<Instant>,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn request_sent(&self) {
        bump(&self.requests_sent);
    }

    pub fn message_sent(&self) {
        bump(&self.messages_sent);
    }

    pub fn response_received(&self) {
        bump(&self.responses_received);
    }

    pub fn retry(&self) {
        bump(&self.retries);
    }

    pub fn timeout(&self) {
        bump(&self.timeouts);
    }

    pub fn stream_opened(&self) {
        bump(&self.streams_opened);
    }

    pub fn stream_recycled(&self) {
        bump(&self.streams_recycled);
    }

    pub fn sender_evicted(&self) {
        bump(&self.senders_evicted);
    }

    pub fn inbound_stream_opened(&self) {
        bump(&self.active_inbound_streams);
        bump(&self.total_inbound_streams);
    }

    pub fn inbound_stream_closed(&self) {
        self.active_inbound_streams.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn idle_reset(&self) {
        bump(&self.idle_resets);
    }

    pub fn message_received(&self) {
        bump(&self.messages_received);
    }

    pub fn message_dropped(&self) {
        bump(&self.messages_dropped);
    }

    pub fn handler_error(&self) {
        bump(&self.handler_errors);
    }

    pub fn broadcast_received(&self) {
        bump(&self.broadcasts_received);
    }

    pub fn broadcast_replied(&self) {
        bump(&self.broadcast_replies);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            outbound: OutboundMetrics {
                requests: load(&self.requests_sent),
                messages: load(&self.messages_sent),
                responses: load(&self.responses_received),
                retries: load(&self.retries),
                timeouts: load(&self.timeouts),
                streams_opened: load(&self.streams_opened),
                streams_recycled: load(&self.streams_recycled),
                senders_evicted: load(&self.senders_evicted),
            },
            inbound: InboundMetrics {
                active_streams: load(&self.active_inbound_streams),
                total_streams: load(&self.total_inbound_streams),
                idle_resets: load(&self.idle_resets),
                messages: load(&self.messages_received),
                dropped: load(&self.messages_dropped),
                handler_errors: load(&self.handler_errors),
            },
            broadcast: BroadcastMetrics {
                received: load(&self.broadcasts_received),
                replies: load(&self.broadcast_replies),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub outbound: OutboundMetrics,
    pub inbound: InboundMetrics,
    pub broadcast: BroadcastMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMetrics {
    pub requests: u64,
    pub messages: u64,
    pub responses: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub streams_opened: u64,
    pub streams_recycled: u64,
    pub senders_evicted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMetrics {
    pub active_streams: u64,
    pub total_streams: u64,
    pub idle_resets: u64,
    pub messages: u64,
    pub dropped: u64,
    pub handler_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMetrics {
    pub received: u64,
    pub replies: u64,
}
