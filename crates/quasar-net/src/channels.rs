//! Per-link message channels.
//!
//! Each link owns three channels, identified by a 2-bit wire id:
//!
//! - `ReliableOrdered` — held on the sender until acked, delivered in
//!   sequence order; out-of-order arrivals are buffered.
//! - `ReliableUnordered` — held until acked, delivered on arrival,
//!   duplicates dropped.
//! - `Unreliable` — fire-and-forget but sequenced: a datagram older than the
//!   newest delivered one is dropped.
//!
//! Sequence numbers are per-channel `u32`s compared with wrapping order so
//! long-lived links survive wraparound.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;

use crate::messages::Message;

/// Wire id of a message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelKind {
    ReliableOrdered = 0,
    ReliableUnordered = 1,
    Unreliable = 2,
}

impl ChannelKind {
    /// Decodes the 2-bit wire id.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::ReliableOrdered,
            1 => Self::ReliableUnordered,
            2 => Self::Unreliable,
            _ => return None,
        })
    }

    /// True when messages on this channel are held for acknowledgement.
    pub fn is_reliable(self) -> bool {
        !matches!(self, Self::Unreliable)
    }
}

/// `a > b` in wrapping sequence order.
fn seq_greater(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < u32::MAX / 2
}

/// A reliable message awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingSend {
    /// Sequence number on its channel.
    pub seq: u32,
    /// The encoded datagram, resent verbatim.
    pub datagram: Vec<u8>,
    /// Last (re)send time.
    pub last_send_ms: u64,
    /// Total sends so far.
    pub send_count: u32,
    /// Sender-chosen receipt id to surface when the ack arrives.
    pub receipt: Option<u64>,
}

/// Sender half of one channel.
#[derive(Debug, Default)]
pub struct OutgoingChannel {
    next_seq: u32,
    /// In-flight reliable messages, oldest first.
    pending: Vec<PendingSend>,
}

impl OutgoingChannel {
    /// Claims the next sequence number.
    pub fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Tracks a reliable datagram until it is acked.
    pub fn track(&mut self, send: PendingSend) {
        self.pending.push(send);
    }

    /// Acknowledges `seq`, returning its receipt id if one was attached.
    pub fn ack(&mut self, seq: u32) -> Option<Option<u64>> {
        let index = self.pending.iter().position(|p| p.seq == seq)?;
        Some(self.pending.remove(index).receipt)
    }

    /// Messages due for a resend.
    pub fn due_for_resend(&mut self, now_ms: u64, interval_ms: u64) -> Vec<&mut PendingSend> {
        self.pending
            .iter_mut()
            .filter(|p| now_ms.saturating_sub(p.last_send_ms) >= interval_ms)
            .collect()
    }

    /// Count of unacknowledged messages.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

/// What the receiver should do with an arrived message.
#[derive(Debug)]
pub enum Arrival {
    /// Deliver these messages, in order.
    Deliver(Vec<Message>),
    /// Duplicate or stale; drop it.
    Drop,
}

/// Receiver half of one channel.
#[derive(Debug)]
pub struct IncomingChannel {
    kind: ChannelKind,
    /// Next sequence to deliver (ordered channel).
    next_deliver: u32,
    /// Out-of-order holdbacks (ordered channel).
    held: BTreeMap<u32, Message>,
    /// Every sequence below this is known-seen (unordered channel).
    seen_floor: u32,
    /// Seen sequences above the floor (unordered channel).
    seen: FxHashSet<u32>,
    /// Newest delivered sequence (unreliable channel).
    newest: Option<u32>,
}

impl IncomingChannel {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            next_deliver: 0,
            held: BTreeMap::new(),
            seen_floor: 0,
            seen: FxHashSet::default(),
            newest: None,
        }
    }

    /// Processes an arrived message with its sequence number.
    pub fn receive(&mut self, seq: u32, message: Message) -> Arrival {
        match self.kind {
            ChannelKind::ReliableOrdered => self.receive_ordered(seq, message),
            ChannelKind::ReliableUnordered => self.receive_unordered(seq, message),
            ChannelKind::Unreliable => self.receive_sequenced(seq, message),
        }
    }

    fn receive_ordered(&mut self, seq: u32, message: Message) -> Arrival {
        if !seq_greater(seq, self.next_deliver) && seq != self.next_deliver {
            return Arrival::Drop;
        }
        if seq != self.next_deliver {
            // Future message: hold it until the gap fills.
            self.held.entry(seq).or_insert(message);
            return Arrival::Deliver(Vec::new());
        }

        let mut out = vec![message];
        self.next_deliver = self.next_deliver.wrapping_add(1);
        while let Some(next) = self.held.remove(&self.next_deliver) {
            out.push(next);
            self.next_deliver = self.next_deliver.wrapping_add(1);
        }
        Arrival::Deliver(out)
    }

    fn receive_unordered(&mut self, seq: u32, message: Message) -> Arrival {
        if seq_greater(self.seen_floor, seq) {
            // Below the floor: everything down there is known-seen.
            return Arrival::Drop;
        }
        if !self.seen.insert(seq) {
            return Arrival::Drop;
        }
        self.advance_floor();
        Arrival::Deliver(vec![message])
    }

    fn advance_floor(&mut self) {
        while self.seen.remove(&self.seen_floor) {
            self.seen_floor = self.seen_floor.wrapping_add(1);
        }
    }

    fn receive_sequenced(&mut self, seq: u32, message: Message) -> Arrival {
        match self.newest {
            Some(newest) if !seq_greater(seq, newest) => Arrival::Drop,
            _ => {
                self.newest = Some(seq);
                Arrival::Deliver(vec![message])
            }
        }
    }

    /// Messages currently held back waiting for a gap to fill.
    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}
