//! The communication channel of one node in one direction (unicast or broadcast). It holds
//!  both halves of the sliding window protocol: the receive window for messages from the node,
//!  and the send window for messages to it.
//!
//! Message ids wrap around at 16 bits. Both windows are at most half the id ring, so 'before'
//!  and 'after' are unambiguous within a window's reach.

use std::collections::VecDeque;
use std::mem;
use bit_set::BitSet;
use rustc_hash::FxHashMap;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::buffers::fragment_pool::FragmentPool;
use crate::config::NetConfig;
use crate::envelope::{InsertOutcome, OutboundEnvelope, PendingSend, Reassembly};
use crate::error::NetError;
use crate::fragment::Fragment;
use crate::message_id::MessageId;
use crate::node_id::NodeId;

/// Acknowledgements more than this far behind the send window are treated as stale rather
///  than as acknowledging ids that were never sent
const STALE_ACK_REACH: u16 = u16::MAX / 2;

/// The parts of the configuration that shape a channel's windows
#[derive(Copy, Clone, Debug)]
pub struct WindowParams {
    pub window: u16,
    pub ring_size: usize,
    pub max_fragments: u16,
}

impl WindowParams {
    pub fn new(config: &NetConfig) -> WindowParams {
        WindowParams {
            window: config.window_size(),
            ring_size: config.ring_size,
            max_fragments: config.max_fragments_per_message,
        }
    }
}

/// A complete message, handed over for dispatch in id order
#[derive(Debug, Eq, PartialEq)]
pub struct Delivery {
    pub id: MessageId,
    pub priority: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Eq, PartialEq)]
pub enum DataOutcome {
    /// The message was delivered before: the sender evidently missed the acknowledgement
    AlreadyDelivered,
    /// The fragment is known already, but its message is not delivered yet
    Duplicate,
    OutOfWindow,
    Accepted {
        /// sequence numbers of fragments that were discovered missing
        missing: Vec<u16>,
        /// messages that became deliverable, in id order
        deliveries: Vec<Delivery>,
    },
}

pub struct ReceiveWindow {
    next_expected: MessageId,
    /// ids that are completely reassembled but wait for an earlier id, indexed by ring slot
    complete: BitSet,
    reassembly: FxHashMap<MessageId, Reassembly>,
    /// an acknowledgement is due and will be sent with the next outgoing data fragment or by
    ///  the maintenance sweep, whichever comes first
    pub delayed_ack: bool,
    /// priority for sending acknowledgements
    pub ack_priority: u16,
}

impl ReceiveWindow {
    pub fn new(next_expected: MessageId) -> ReceiveWindow {
        ReceiveWindow {
            next_expected,
            complete: BitSet::new(),
            reassembly: Default::default(),
            delayed_ack: false,
            ack_priority: 0,
        }
    }

    /// The cumulative acknowledgement value: all ids before it were delivered
    pub fn next_expected(&self) -> MessageId {
        self.next_expected
    }

    pub fn num_in_progress(&self) -> usize {
        self.reassembly.len()
    }

    /// Accepts a DATA or BROADCAST-DATA fragment. Fragments outside the window and duplicates
    ///  are released to the pool without side effects. An error is a protocol violation by the
    ///  sending node.
    pub fn on_data(&mut self, fragment: Fragment, params: WindowParams, pool: &FragmentPool, now: Instant) -> Result<DataOutcome, String> {
        let id = fragment.header.packet_id;
        if !id.is_in_window(self.next_expected, params.window) {
            let already_delivered = id.is_recently_before(self.next_expected, params.window);
            debug!("fragment for {} outside of receive window starting at {} - dropping", id, self.next_expected);
            pool.release(fragment);
            return Ok(if already_delivered { DataOutcome::AlreadyDelivered } else { DataOutcome::OutOfWindow });
        }

        let slot = id.ring_slot(params.ring_size);
        if self.complete.contains(slot) {
            debug!("fragment for complete message {} - dropping", id);
            pool.release(fragment);
            return Ok(DataOutcome::Duplicate);
        }

        let priority = fragment.header.priority;
        let reassembly = self.reassembly.entry(id)
            .or_insert_with(|| Reassembly::new(now, priority));
        match reassembly.insert(fragment, pool, params.max_fragments) {
            Err(msg) => {
                if reassembly.is_empty() {
                    self.reassembly.remove(&id);
                }
                Err(format!("message {}: {}", id, msg))
            }
            Ok(InsertOutcome::Duplicate) => Ok(DataOutcome::Duplicate),
            Ok(InsertOutcome::Accepted { missing, complete }) => {
                if complete {
                    trace!("message {} is complete", id);
                    self.complete.insert(slot);
                }
                let deliveries = self.deliver_in_order(params.ring_size, pool);
                Ok(DataOutcome::Accepted { missing, deliveries })
            }
        }
    }

    fn deliver_in_order(&mut self, ring_size: usize, pool: &FragmentPool) -> Vec<Delivery> {
        let mut result = Vec::new();
        loop {
            let slot = self.next_expected.ring_slot(ring_size);
            if !self.complete.contains(slot) {
                break;
            }
            self.complete.remove(slot);

            if let Some(reassembly) = self.reassembly.remove(&self.next_expected) {
                result.push(Delivery {
                    id: self.next_expected,
                    priority: reassembly.priority,
                    data: reassembly.into_bytes(pool),
                });
            }
            self.next_expected = self.next_expected.next();
        }
        result
    }

    /// Abandons incomplete messages that have been in reassembly for longer than `timeout`.
    ///  If the oldest expected message is among them, the window moves past it. Returns the
    ///  abandoned ids.
    pub fn expire_reassembly(&mut self, now: Instant, timeout: Duration, pool: &FragmentPool) -> Vec<MessageId> {
        let expired = self.reassembly.iter()
            .filter(|(_, r)| !r.is_complete() && r.started_at + timeout <= now)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in &expired {
            if let Some(r) = self.reassembly.remove(id) {
                r.release(pool);
            }
            if *id == self.next_expected {
                self.next_expected = self.next_expected.next();
            }
        }
        expired
    }

    /// Discards everything in reassembly and restarts the window at `next_expected`
    pub fn reset(&mut self, next_expected: MessageId, pool: &FragmentPool) {
        for (_, r) in self.reassembly.drain() {
            r.release(pool);
        }
        self.complete.make_empty();
        self.next_expected = next_expected;
        self.delayed_ack = false;
    }
}

pub struct SendWindow {
    next_send: MessageId,
    last_ack_received: MessageId,
    pub awaiting_window: VecDeque<PendingSend>,
    /// admitted envelopes in id order
    pub awaiting_ack: VecDeque<OutboundEnvelope>,
}

impl SendWindow {
    pub fn new(next_send: MessageId) -> SendWindow {
        SendWindow {
            next_send,
            last_ack_received: next_send,
            awaiting_window: Default::default(),
            awaiting_ack: Default::default(),
        }
    }

    pub fn next_send(&self) -> MessageId {
        self.next_send
    }

    pub fn last_ack_received(&self) -> MessageId {
        self.last_ack_received
    }

    /// The oldest id that is not acknowledged yet, i.e. the lower bound of the send window
    pub fn next_ack_expected(&self) -> MessageId {
        self.awaiting_ack.front()
            .map(|e| e.id)
            .unwrap_or(self.next_send)
    }

    pub fn in_flight(&self) -> u16 {
        self.next_send.distance_from(self.next_ack_expected())
    }

    pub fn has_window_slot(&self, window: u16) -> bool {
        self.in_flight() < window
    }

    /// Returns the id for the next admitted envelope, advancing the send cursor
    pub fn assign_id(&mut self) -> MessageId {
        let result = self.next_send;
        self.next_send = self.next_send.next();
        result
    }

    fn num_acknowledged(&self, ack: MessageId) -> Result<Option<u16>, String> {
        let base = self.next_ack_expected();
        let num_acked = ack.distance_from(base);
        if num_acked <= self.in_flight() {
            return Ok(Some(num_acked));
        }
        if ack.is_recently_before(base, STALE_ACK_REACH) {
            trace!("stale acknowledgement {} - window starts at {}", ack, base);
            return Ok(None);
        }
        Err(format!("acknowledgement {} is beyond the next id to be sent {}", ack, self.next_send))
    }

    /// Processes a cumulative acknowledgement of a unicast channel, returning the envelopes
    ///  it acknowledges in id order
    pub fn on_ack(&mut self, ack: MessageId) -> Result<Vec<OutboundEnvelope>, String> {
        let Some(num_acked) = self.num_acknowledged(ack)? else {
            return Ok(vec![]);
        };
        self.last_ack_received = ack;

        let n = (num_acked as usize).min(self.awaiting_ack.len());
        Ok(self.awaiting_ack.drain(..n).collect())
    }

    /// Processes one node's cumulative acknowledgement of broadcast messages. The node is
    ///  removed from the quorum of every envelope the acknowledgement covers, and envelopes
    ///  with an empty quorum are returned as done.
    pub fn on_broadcast_ack(&mut self, from: NodeId, ack: MessageId) -> Result<Vec<OutboundEnvelope>, String> {
        let Some(num_acked) = self.num_acknowledged(ack)? else {
            return Ok(vec![]);
        };

        let base = self.next_ack_expected();
        for envelope in self.awaiting_ack.iter_mut() {
            if envelope.id.distance_from(base) >= num_acked {
                break;
            }
            envelope.transmission.outstanding.remove(&from);
        }
        Ok(self.take_done())
    }

    /// Removes a node from the quorum of all unacknowledged broadcast envelopes, returning
    ///  envelopes that need no further acknowledgement as a result
    pub fn remove_from_quorum(&mut self, node: NodeId) -> Vec<OutboundEnvelope> {
        for envelope in self.awaiting_ack.iter_mut() {
            envelope.transmission.outstanding.remove(&node);
        }
        self.take_done()
    }

    fn take_done(&mut self) -> Vec<OutboundEnvelope> {
        let (done, remaining): (VecDeque<_>, VecDeque<_>) = mem::take(&mut self.awaiting_ack)
            .into_iter()
            .partition(|e| e.transmission.outstanding.is_empty());
        self.awaiting_ack = remaining;
        done.into()
    }

    /// Fails every waiting and unacknowledged envelope with `error`, releases their fragments
    ///  and restarts the window at `next_send`
    pub fn reset(&mut self, next_send: MessageId, error: NetError, pool: &FragmentPool) {
        for mut pending in self.awaiting_window.drain(..) {
            pending.complete(Err(error.clone()));
            pool.release_all(mem::take(&mut pending.fragments));
        }
        for mut envelope in self.awaiting_ack.drain(..) {
            envelope.transmission.complete(Err(error.clone()));
            pool.release_all(mem::take(&mut envelope.fragments));
        }
        self.next_send = next_send;
        self.last_ack_received = next_send;
    }
}

pub struct CommChannel {
    pub receive: ReceiveWindow,
    pub send: SendWindow,
}

impl CommChannel {
    pub fn new(receive_start: MessageId, send_start: MessageId) -> CommChannel {
        CommChannel {
            receive: ReceiveWindow::new(receive_start),
            send: SendWindow::new(send_start),
        }
    }
}
