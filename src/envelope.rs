use std::collections::BTreeMap;

use rustc_hash::FxHashSet;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::buffers::fragment_pool::FragmentPool;
use crate::error::NetResult;
use crate::fragment::{reassemble, Fragment};
use crate::message_id::MessageId;
use crate::node_id::NodeId;

/// The sending half of a caller's wait for the outcome of a send
pub type Completion = oneshot::Sender<NetResult<()>>;

fn complete(completion: &mut Option<Completion>, result: NetResult<()>) {
    if let Some(c) = completion.take() {
        // the caller may have given up waiting, which is fine
        let _ = c.send(result);
    }
}

/// An outbound message that is fragmented but waits for a slot in the send window. It has no
///  message id yet: ids are assigned on admission to the window.
#[derive(Debug)]
pub struct PendingSend {
    pub ticket: u64,
    pub priority: u16,
    pub fragments: Vec<Fragment>,
    pub deadline: Option<Instant>,
    pub completion: Option<Completion>,
}

impl PendingSend {
    pub fn complete(&mut self, result: NetResult<()>) {
        complete(&mut self.completion, result);
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.map(|d| d <= now).unwrap_or(false)
    }

    pub fn admit(self, id: MessageId, transmission_deadline: Instant, quorum: FxHashSet<NodeId>) -> OutboundEnvelope {
        OutboundEnvelope {
            id,
            ticket: self.ticket,
            priority: self.priority,
            fragments: self.fragments,
            transmission: Transmission {
                retries: 0,
                next_retry_at: transmission_deadline,
                outstanding: quorum,
                completion: self.completion,
            },
        }
    }
}

/// An admitted message, waiting for acknowledgement
#[derive(Debug)]
pub struct OutboundEnvelope {
    pub id: MessageId,
    pub ticket: u64,
    pub priority: u16,
    pub fragments: Vec<Fragment>,
    pub transmission: Transmission,
}

impl OutboundEnvelope {
    pub fn len(&self) -> usize {
        self.fragments.iter()
            .map(|f| f.payload().len())
            .sum()
    }

    /// Signals the outcome to the waiting caller (if any) and releases the fragments
    pub fn finish(mut self, result: NetResult<()>, pool: &FragmentPool) {
        self.transmission.complete(result);
        pool.release_all(self.fragments);
    }
}

/// Retry bookkeeping of an unacknowledged envelope, and the caller's completion signal.
///
/// `outstanding` holds the nodes that still owe an acknowledgement for a broadcast; it is
///  empty for unicast messages, which are acknowledged by their single destination.
///
/// The completion is taken by whichever of acknowledgement, caller timeout or crash happens
///  first. An envelope without completion is 'detached': nobody waits for it any more, but it
///  is still retransmitted so the receiver's window keeps moving.
#[derive(Debug)]
pub struct Transmission {
    pub retries: u32,
    pub next_retry_at: Instant,
    pub outstanding: FxHashSet<NodeId>,
    pub completion: Option<Completion>,
}

impl Transmission {
    pub fn complete(&mut self, result: NetResult<()>) {
        complete(&mut self.completion, result);
    }

    pub fn is_detached(&self) -> bool {
        self.completion.is_none()
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum InsertOutcome {
    Duplicate,
    Accepted {
        /// fragment sequence numbers that became known as missing with this fragment
        missing: Vec<u16>,
        complete: bool,
    },
}

/// An inbound message whose fragments are being collected. Fragments are kept ordered by
///  sequence number; the leak count is the number of fragments below the highest received
///  sequence number that have not arrived yet.
#[derive(Debug)]
pub struct Reassembly {
    fragments: BTreeMap<u16, Fragment>,
    highest_seq: Option<u16>,
    tail_seq: Option<u16>,
    leak_count: u16,
    pub started_at: Instant,
    pub priority: u16,
}

impl Reassembly {
    pub fn new(started_at: Instant, priority: u16) -> Reassembly {
        Reassembly {
            fragments: Default::default(),
            highest_seq: None,
            tail_seq: None,
            leak_count: 0,
            started_at,
            priority,
        }
    }

    pub fn leak_count(&self) -> u16 {
        self.leak_count
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.tail_seq.is_some() && self.tail_seq == self.highest_seq && self.leak_count == 0
    }

    /// Adds a fragment to the message. Duplicates are released to the pool. An error means the
    ///  fragment contradicts what was received before; the fragment is released in that case
    ///  as well.
    pub fn insert(&mut self, fragment: Fragment, pool: &FragmentPool, max_fragments: u16) -> Result<InsertOutcome, String> {
        let seq = fragment.header.fragment_seq;
        let is_last = !fragment.header.has_more_fragments();

        if let Err(msg) = self.check(seq, is_last, fragment.header.is_first(), max_fragments) {
            pool.release(fragment);
            return Err(msg);
        }
        if self.fragments.contains_key(&seq) {
            pool.release(fragment);
            return Ok(InsertOutcome::Duplicate);
        }

        let missing = match self.highest_seq {
            None => {
                self.leak_count = seq;
                self.highest_seq = Some(seq);
                (0..seq).collect()
            }
            Some(highest) if seq > highest => {
                self.leak_count += seq - highest - 1;
                self.highest_seq = Some(seq);
                (highest+1..seq).collect()
            }
            Some(_) => {
                self.leak_count -= 1;
                vec![]
            }
        };
        if is_last {
            self.tail_seq = Some(seq);
        }
        self.fragments.insert(seq, fragment);

        Ok(InsertOutcome::Accepted {
            missing,
            complete: self.is_complete(),
        })
    }

    fn check(&self, seq: u16, is_last: bool, is_first: bool, max_fragments: u16) -> Result<(), String> {
        if seq >= max_fragments {
            return Err(format!("fragment sequence number {} exceeds the maximum of {} fragments per message", seq, max_fragments));
        }
        if is_first != (seq == 0) {
            return Err(format!("header flag is inconsistent with fragment sequence number {}", seq));
        }
        if let Some(tail) = self.tail_seq {
            if seq > tail || (is_last && seq != tail) {
                return Err(format!("fragment {} contradicts the last fragment {}", seq, tail));
            }
        }
        if is_last {
            if let Some(highest) = self.highest_seq {
                if seq < highest {
                    return Err(format!("last fragment {} is below already received fragment {}", seq, highest));
                }
            }
        }
        Ok(())
    }

    /// Returns the message's bytes and releases its fragments
    pub fn into_bytes(self, pool: &FragmentPool) -> Vec<u8> {
        let result = reassemble(self.fragments.values());
        pool.release_all(self.fragments.into_values());
        result
    }

    pub fn release(self, pool: &FragmentPool) {
        pool.release_all(self.fragments.into_values());
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::fragment::fragment_flags;
    use super::*;

    fn fragment(pool: &FragmentPool, seq: u16, num: u16, payload: &[u8]) -> Fragment {
        let mut result = pool.allocate().unwrap();
        result.set_payload(payload);
        result.header.fragment_seq = seq;
        result.header.flags = fragment_flags(seq as usize, num as usize, false);
        result
    }

    fn accepted(missing: Vec<u16>, complete: bool) -> InsertOutcome {
        InsertOutcome::Accepted { missing, complete }
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2], vec![accepted(vec![], false), accepted(vec![], false), accepted(vec![], true)])]
    #[case::reversed(vec![2, 1, 0], vec![accepted(vec![0, 1], false), accepted(vec![], false), accepted(vec![], true)])]
    #[case::middle_lost(vec![0, 2, 1], vec![accepted(vec![], false), accepted(vec![1], false), accepted(vec![], true)])]
    #[case::duplicate(vec![0, 0, 1, 2], vec![accepted(vec![], false), InsertOutcome::Duplicate, accepted(vec![], false), accepted(vec![], true)])]
    #[case::gap_then_tail(vec![1, 2, 0], vec![accepted(vec![0], false), accepted(vec![], false), accepted(vec![], true)])]
    fn test_insert(#[case] order: Vec<u16>, #[case] expected: Vec<InsertOutcome>) {
        let pool = FragmentPool::new(10, 64, 0);
        let mut reassembly = Reassembly::new(Instant::now(), 0);

        for (seq, expected) in order.into_iter().zip(expected) {
            let payload = [b'a' + seq as u8];
            assert_eq!(reassembly.insert(fragment(&pool, seq, 3, &payload), &pool, 10).unwrap(), expected);
        }

        assert!(reassembly.is_complete());
        assert_eq!(reassembly.leak_count(), 0);
        assert_eq!(reassembly.into_bytes(&pool), b"abc");
        assert_eq!(pool.available(), 10);
    }

    #[test]
    fn test_leak_count() {
        let pool = FragmentPool::new(10, 64, 0);
        let mut reassembly = Reassembly::new(Instant::now(), 0);

        reassembly.insert(fragment(&pool, 0, 5, b"a"), &pool, 10).unwrap();
        reassembly.insert(fragment(&pool, 4, 5, b"e"), &pool, 10).unwrap();
        assert_eq!(reassembly.leak_count(), 3);
        assert!(!reassembly.is_complete());

        reassembly.insert(fragment(&pool, 2, 5, b"c"), &pool, 10).unwrap();
        assert_eq!(reassembly.leak_count(), 2);

        reassembly.release(&pool);
        assert_eq!(pool.available(), 10);
    }

    #[rstest]
    #[case::beyond_tail(vec![(2, 3)], (3, 5))]
    #[case::second_tail(vec![(2, 3)], (1, 2))]
    #[case::tail_below_highest(vec![(3, 5)], (2, 3))]
    #[case::too_many_fragments(vec![], (10, 11))]
    fn test_insert_rejects(#[case] before: Vec<(u16, u16)>, #[case] offending: (u16, u16)) {
        let pool = FragmentPool::new(10, 64, 0);
        let mut reassembly = Reassembly::new(Instant::now(), 0);
        for (seq, num) in before {
            reassembly.insert(fragment(&pool, seq, num, b"x"), &pool, 10).unwrap();
        }

        let (seq, num) = offending;
        assert!(reassembly.insert(fragment(&pool, seq, num, b"x"), &pool, 10).is_err());
        reassembly.release(&pool);
        assert_eq!(pool.available(), 10);
    }

    #[test]
    fn test_insert_rejects_inconsistent_header_flag() {
        let pool = FragmentPool::new(10, 64, 0);
        let mut reassembly = Reassembly::new(Instant::now(), 0);

        let mut f = fragment(&pool, 1, 3, b"x");
        f.header.flags |= crate::wire::FragmentFlags::HEADER;
        assert!(reassembly.insert(f, &pool, 10).is_err());
        assert_eq!(pool.available(), 10);
    }
}
