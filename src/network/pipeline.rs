//! Packet Pipeline
//!
//! Inbound: a bounded FIFO of client packets, drained once per tick and
//! dispatched to mode-filtered action bindings.
//!
//! Outbound: one [`OutboundChannel`] per player. The push loop asks it for a
//! packet on its own cadence; unchanged payloads are skipped, sent packets are
//! stamped with a global sequence id and kept in a small ledger so client
//! receipts can be turned into latency samples.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::hash::{short_hex, PayloadHasher, StateHash};
use crate::network::protocol::{ClientPacket, DeltaPacket, ServerPacket, StateFrame};
use crate::state::mutation::Mutation;

/// Default bound of a session's input queue.
pub const DEFAULT_INPUT_CAPACITY: usize = 1024;

/// Sent packets remembered per channel for receipt matching.
pub const SENT_LEDGER_CAPACITY: usize = 128;

/// Deltas held for an unsent push before the channel falls back to a full
/// frame.
pub const BACKLOG_CAPACITY: usize = 256;

/// Weight of a new sample in the latency average.
const LATENCY_SMOOTHING: f64 = 0.2;

/// Wall-clock time in milliseconds, as stamped on packets.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// INBOUND
// =============================================================================

/// A client packet waiting for the next tick.
#[derive(Debug, Clone)]
pub struct QueuedInput {
    /// The packet as received.
    pub packet: ClientPacket,
    /// Server time of arrival, in milliseconds.
    pub received_at: i64,
    /// Owning session.
    pub session_id: String,
    /// Sending player.
    pub player_id: String,
    /// Session mode at arrival.
    pub mode: String,
}

/// Bounded FIFO of inbound packets.
#[derive(Debug)]
pub struct InputQueue {
    entries: VecDeque<QueuedInput>,
    capacity: usize,
    dropped: u64,
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new(DEFAULT_INPUT_CAPACITY)
    }
}

impl InputQueue {
    /// Queue holding at most `capacity` packets.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Append a packet. Returns false, dropping it, if the queue is full.
    pub fn push(&mut self, input: QueuedInput) -> bool {
        if self.entries.len() >= self.capacity {
            self.dropped += 1;
            warn!(
                session = %input.session_id,
                player = %input.player_id,
                capacity = self.capacity,
                "input queue full, dropping packet"
            );
            return false;
        }
        self.entries.push_back(input);
        true
    }

    /// Take the packets present at tick start, oldest first.
    pub fn drain_tick(&mut self) -> Vec<QueuedInput> {
        let count = self.entries.len();
        self.entries.drain(..count).collect()
    }

    /// Waiting packets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Packets rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// What an action handler sees for one input packet.
#[derive(Debug)]
pub struct InputContext<'a> {
    /// Owning session.
    pub session_id: &'a str,
    /// Sending player.
    pub player_id: &'a str,
    /// Session mode at arrival.
    pub mode: &'a str,
    /// Client sequence id.
    pub packet_id: Option<u64>,
    /// Server time of arrival, in milliseconds.
    pub received_at: i64,
    /// Captured input fields.
    pub input: &'a Map<String, Value>,
    /// Committed state at tick start.
    pub state: &'a Value,
}

/// Action handler. A returned mutation joins the current tick.
pub type ActionHandler = Arc<dyn Fn(&InputContext<'_>) -> Option<Mutation> + Send + Sync>;

struct Binding {
    name: String,
    mode: Option<String>,
    handler: ActionHandler,
}

/// Game logic bound to input, optionally per mode.
#[derive(Default)]
pub struct ActionBindings {
    bindings: Vec<Binding>,
}

impl ActionBindings {
    /// No bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler. `mode: None` applies in every mode.
    pub fn bind<F>(&mut self, name: impl Into<String>, mode: Option<&str>, handler: F) -> &mut Self
    where
        F: Fn(&InputContext<'_>) -> Option<Mutation> + Send + Sync + 'static,
    {
        self.bindings.push(Binding {
            name: name.into(),
            mode: mode.map(str::to_string),
            handler: Arc::new(handler),
        });
        self
    }

    /// Run every handler applicable to the context's mode, in bind order.
    pub fn dispatch(&self, ctx: &InputContext<'_>) -> Vec<Mutation> {
        self.bindings
            .iter()
            .filter(|b| b.mode.as_deref().map_or(true, |m| m == ctx.mode))
            .filter_map(|b| {
                let out = (b.handler)(ctx);
                if out.is_some() {
                    debug!(binding = %b.name, player = ctx.player_id, "action produced mutation");
                }
                out
            })
            .collect()
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// True if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl fmt::Debug for ActionBindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.bindings.iter().map(|b| (&b.name, &b.mode)))
            .finish()
    }
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Process-wide packet sequence.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    /// Counter starting at zero; the first id handed out is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Last id handed out.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// How pushes are framed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushMode {
    /// Send committed change deltas.
    #[default]
    Delta,
    /// Send the full committed state.
    Snapshot,
}

/// Unknown push mode name.
#[derive(Debug, Error)]
#[error("unknown push mode: {0}")]
pub struct ParsePushModeError(String);

impl FromStr for PushMode {
    type Err = ParsePushModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delta" => Ok(PushMode::Delta),
            "snapshot" => Ok(PushMode::Snapshot),
            other => Err(ParsePushModeError(other.to_string())),
        }
    }
}

/// Outbound state of one player's connection.
#[derive(Debug)]
pub struct OutboundChannel {
    mode: PushMode,
    backlog: Vec<Value>,
    last_digest: Option<StateHash>,
    resync: bool,
    highest_processed: Option<u64>,
    sent_processed: Option<u64>,
    sent: VecDeque<(u64, i64)>,
    latency_ms: Option<f64>,
    packets_sent: u64,
    packets_skipped: u64,
}

impl OutboundChannel {
    /// Channel framing pushes with `mode`.
    pub fn new(mode: PushMode) -> Self {
        Self {
            mode,
            backlog: Vec::new(),
            last_digest: None,
            resync: false,
            highest_processed: None,
            sent_processed: None,
            sent: VecDeque::with_capacity(SENT_LEDGER_CAPACITY),
            latency_ms: None,
            packets_sent: 0,
            packets_skipped: 0,
        }
    }

    /// Push framing.
    pub fn mode(&self) -> PushMode {
        self.mode
    }

    /// Queue committed deltas for the next push. A backlog past
    /// [`BACKLOG_CAPACITY`] is dropped in favour of a full frame.
    pub fn queue_changes(&mut self, deltas: impl IntoIterator<Item = Value>) {
        if self.mode != PushMode::Delta || self.resync {
            return;
        }
        self.backlog.extend(deltas);
        if self.backlog.len() > BACKLOG_CAPACITY {
            debug!(backlog = self.backlog.len(), "backlog full, resyncing");
            self.request_resync();
        }
    }

    /// Whether the next push is a full frame.
    pub fn resync_pending(&self) -> bool {
        self.resync
    }

    /// Deltas waiting to be sent.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Send the full state on the next push, whatever the mode.
    pub fn request_resync(&mut self) {
        self.backlog.clear();
        self.resync = true;
    }

    /// Record a processed client input id.
    pub fn note_processed(&mut self, id: u64) {
        self.highest_processed = Some(self.highest_processed.map_or(id, |h| h.max(id)));
    }

    /// Highest client input id processed so far.
    pub fn highest_processed(&self) -> Option<u64> {
        self.highest_processed
    }

    /// Build the next packet, or `None` if it would repeat the last one.
    pub fn prepare_push(&mut self, state: &Value, sequence: &SequenceCounter, now: i64) -> Option<ServerPacket> {
        let full = self.resync || self.mode == PushMode::Snapshot;
        if !full && self.backlog.is_empty() && self.highest_processed == self.sent_processed {
            return None;
        }

        let mut hasher = if full {
            PayloadHasher::for_snapshot()
        } else {
            PayloadHasher::for_deltas()
        };
        hasher.update_bytes(&self.highest_processed.unwrap_or(0).to_le_bytes());
        if full {
            hasher.update_value(state);
        } else {
            for delta in &self.backlog {
                hasher.update_value(delta);
            }
        }
        let digest = hasher.finalize();

        if !self.resync && self.last_digest == Some(digest) {
            self.backlog.clear();
            self.packets_skipped += 1;
            return None;
        }

        let id = sequence.next();
        let packet = if full {
            ServerPacket::Frame(StateFrame {
                id,
                timestamp: now,
                highest_processed_message: self.highest_processed,
                state: state.clone(),
            })
        } else {
            ServerPacket::Delta(DeltaPacket {
                id,
                timestamp: now,
                highest_processed_message: self.highest_processed,
                change_deltas: std::mem::take(&mut self.backlog),
            })
        };

        debug!(id, digest = %short_hex(&digest), full, "push prepared");
        self.resync = false;
        self.last_digest = Some(digest);
        self.sent_processed = self.highest_processed;
        self.packets_sent += 1;
        if self.sent.len() == SENT_LEDGER_CAPACITY {
            self.sent.pop_front();
        }
        self.sent.push_back((id, now));
        Some(packet)
    }

    /// Match a client receipt with its send time. Returns the round trip in
    /// milliseconds, or `None` if the id is unknown or already matched.
    pub fn record_receipt(&mut self, id: u64, received_at: i64) -> Option<u64> {
        let index = self.sent.iter().position(|(sent_id, _)| *sent_id == id)?;
        let (_, sent_at) = self.sent[index];
        self.sent.drain(..=index);

        let sample = received_at.saturating_sub(sent_at).max(0) as u64;
        self.latency_ms = Some(match self.latency_ms {
            Some(avg) => avg + LATENCY_SMOOTHING * (sample as f64 - avg),
            None => sample as f64,
        });
        Some(sample)
    }

    /// Smoothed latency in milliseconds.
    pub fn latency_ms(&self) -> Option<f64> {
        self.latency_ms
    }

    /// Packets handed to the transport.
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// Pushes skipped because nothing changed.
    pub fn packets_skipped(&self) -> u64 {
        self.packets_skipped
    }
}
