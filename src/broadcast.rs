//! Topic-keyed subscriber broadcast.
//!
//! Every topic is a bounded `tokio::sync::broadcast` channel. Publishing
//! never blocks and never waits for subscribers; a slow subscriber that
//! falls behind the ring buffer observes a lag count (its gap counter)
//! and continues from the oldest retained event. Payloads are tagged
//! variants; nothing crosses this boundary as opaque JSON.

use alloy_primitives::Address;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::fixed::{Amount, SignedAmount};
use crate::klines::{KlineBucket, Resolution};
use crate::models::{amount_str, signed_str, BookDepth, PairStatus, PositionView, Trade};

/// Topic address space. String forms are the wire subscription keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Book(Address),
    Trades(Address),
    Klines(Address, Resolution),
    Positions(Address),
    Funding(Address),
    Lifecycle(Address),
}

impl Topic {
    pub fn key(&self) -> String {
        match self {
            Topic::Book(token) => format!("book:{token:#x}"),
            Topic::Trades(token) => format!("trades:{token:#x}"),
            Topic::Klines(token, res) => format!("klines:{token:#x}:{}", res.as_str()),
            Topic::Positions(trader) => format!("positions:{trader:#x}"),
            Topic::Funding(token) => format!("funding:{token:#x}"),
            Topic::Lifecycle(token) => format!("lifecycle:{token:#x}"),
        }
    }

    /// Parse a wire subscription key back into a topic.
    pub fn parse(key: &str) -> Option<Topic> {
        let mut parts = key.split(':');
        let kind = parts.next()?;
        let addr = parts.next()?.parse::<Address>().ok()?;
        match (kind, parts.next()) {
            ("book", None) => Some(Topic::Book(addr)),
            ("trades", None) => Some(Topic::Trades(addr)),
            ("klines", Some(res)) => Some(Topic::Klines(addr, Resolution::parse(res)?)),
            ("positions", None) => Some(Topic::Positions(addr)),
            ("funding", None) => Some(Topic::Funding(addr)),
            ("lifecycle", None) => Some(Topic::Lifecycle(addr)),
            _ => None,
        }
    }
}

/// Everything the engine pushes to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    BookSnapshot(BookDepth),
    Trade(Trade),
    Kline(KlineBucket),
    Position(PositionView),
    PairClosed {
        pair_id: u64,
        token: Address,
        status: PairStatus,
        #[serde(with = "amount_str")]
        exit_price: Amount,
        #[serde(with = "signed_str")]
        pnl_long: SignedAmount,
        #[serde(with = "signed_str")]
        pnl_short: SignedAmount,
    },
    Funding {
        token: Address,
        #[serde(with = "signed_str")]
        rate_bps: i128,
        #[serde(with = "signed_str")]
        index: SignedAmount,
    },
    Lifecycle {
        token: Address,
        state: String,
        reason: String,
    },
    InsuranceDraw {
        pair_id: u64,
        token: Address,
        #[serde(with = "amount_str")]
        amount: Amount,
    },
}

/// Wire envelope. `seq` is per-topic monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub seq: u64,
    /// Unix millis.
    pub timestamp: i64,
    pub payload: EventPayload,
}

struct TopicChannel {
    tx: broadcast::Sender<Arc<Envelope>>,
    seq: AtomicU64,
}

/// The fanout hub. Cheap to clone via `Arc`.
pub struct Broadcaster {
    capacity: usize,
    topics: RwLock<HashMap<String, TopicChannel>>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Publish an event. Non-blocking; if the topic has no subscribers the
    /// event is dropped after the seq advances (late subscribers start at
    /// the live edge, not from history).
    pub fn publish(&self, topic: Topic, payload: EventPayload) -> u64 {
        let key = topic.key();
        {
            let topics = self.topics.read();
            if let Some(chan) = topics.get(&key) {
                return Self::send(chan, key, payload);
            }
        }
        let mut topics = self.topics.write();
        let chan = topics.entry(key.clone()).or_insert_with(|| TopicChannel {
            tx: broadcast::channel(self.capacity).0,
            seq: AtomicU64::new(0),
        });
        Self::send(chan, key, payload)
    }

    fn send(chan: &TopicChannel, key: String, payload: EventPayload) -> u64 {
        let seq = chan.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let envelope = Arc::new(Envelope {
            topic: key,
            seq,
            timestamp: crate::models::now_ms(),
            payload,
        });
        // send() only errors when there are no receivers; that is fine.
        let _ = chan.tx.send(envelope);
        seq
    }

    /// Subscribe to a topic from the live edge.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Arc<Envelope>> {
        let key = topic.key();
        {
            let topics = self.topics.read();
            if let Some(chan) = topics.get(&key) {
                return chan.tx.subscribe();
            }
        }
        let mut topics = self.topics.write();
        topics
            .entry(key)
            .or_insert_with(|| TopicChannel {
                tx: broadcast::channel(self.capacity).0,
                seq: AtomicU64::new(0),
            })
            .tx
            .subscribe()
    }

    /// Published-event count for a topic.
    pub fn topic_seq(&self, topic: Topic) -> u64 {
        self.topics
            .read()
            .get(&topic.key())
            .map(|c| c.seq.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}
