use std::mem;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::buffers::fragment_pool::FragmentPool;
use crate::channel::{CommChannel, SendWindow};
use crate::error::{NetError, NetResult};
use crate::liveness::{LivenessHooks, LivenessState};
use crate::message_id::MessageId;
use crate::node_id::NodeId;

pub struct Node {
    pub id: NodeId,
    pub state: LivenessState,
    pub incarnation: u64,
    pub inbound_packets: u64,
    pub unicast: CommChannel,
    pub broadcast: CommChannel,
}

impl Node {
    fn new(id: NodeId, state: LivenessState, incarnation: u64, broadcast_next_id: MessageId) -> Node {
        Node {
            id,
            state,
            incarnation,
            inbound_packets: 0,
            unicast: CommChannel::new(MessageId::ZERO, MessageId::ZERO),
            broadcast: CommChannel::new(broadcast_next_id, MessageId::ZERO),
        }
    }
}

/// A snapshot of a node's state for introspection
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub state: LivenessState,
    pub incarnation: u64,
    pub inbound_packets: u64,
    pub unicast_next_send: MessageId,
    pub unicast_in_flight: u16,
    pub unicast_next_expected: MessageId,
    pub broadcast_next_expected: MessageId,
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> Self {
        NodeInfo {
            id: node.id,
            state: node.state,
            incarnation: node.incarnation,
            inbound_packets: node.inbound_packets,
            unicast_next_send: node.unicast.send.next_send(),
            unicast_in_flight: node.unicast.send.in_flight(),
            unicast_next_expected: node.unicast.receive.next_expected(),
            broadcast_next_expected: node.broadcast.receive.next_expected(),
        }
    }
}

/// All known nodes and their channels, plus the synthetic broadcast node whose broadcast
///  channel carries this node's outbound broadcasts. The database is the single source of
///  truth for liveness. Nodes are added when they are first heard from and never removed,
///  only marked as crashed.
///
/// The database is not synchronized itself: the engine keeps it behind a single lock, and
///  all channel and liveness mutation happens while holding that lock.
pub struct NodeDatabase {
    self_id: NodeId,
    capacity: usize,
    nodes: FxHashMap<NodeId, Node>,
    broadcast: Node,
    godfather: Option<NodeId>,
    next_ticket: u64,
}

impl NodeDatabase {
    /// `capacity` includes the broadcast node
    pub fn new(self_id: NodeId, capacity: usize) -> NodeDatabase {
        NodeDatabase {
            self_id,
            capacity,
            nodes: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
            broadcast: Node::new(NodeId::BROADCAST, LivenessState::Operational, 0, MessageId::ZERO),
            godfather: None,
            next_ticket: 0,
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        if id.is_broadcast() {
            Some(&self.broadcast)
        }
        else {
            self.nodes.get(&id)
        }
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        if id.is_broadcast() {
            Some(&mut self.broadcast)
        }
        else {
            self.nodes.get_mut(&id)
        }
    }

    /// the peer with the given id, if it is alive
    pub fn alive_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
            .filter(|n| n.state.is_alive())
    }

    pub fn alive_peers(&self) -> FxHashSet<NodeId> {
        self.nodes.values()
            .filter(|n| n.state.is_alive())
            .map(|n| n.id)
            .collect()
    }

    pub fn peers_mut(&mut self) -> impl Iterator<Item=&mut Node> {
        self.nodes.values_mut()
    }

    /// The send window for messages to `to`: the node's unicast channel, or this node's
    ///  broadcast channel for [NodeId::BROADCAST]. `None` if `to` is not alive.
    pub fn outbound_window_mut(&mut self, to: NodeId) -> Option<&mut SendWindow> {
        if to.is_broadcast() {
            Some(self.broadcast_window_mut())
        }
        else {
            self.alive_mut(to).map(|n| &mut n.unicast.send)
        }
    }

    /// this node's outbound broadcast window
    pub fn broadcast_window_mut(&mut self) -> &mut SendWindow {
        &mut self.broadcast.broadcast.send
    }

    pub fn broadcast_next_id(&self) -> MessageId {
        self.broadcast.broadcast.send.next_send()
    }

    pub fn next_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    pub fn godfather(&self) -> Option<NodeId> {
        self.godfather
    }

    pub fn set_godfather_if_unset(&mut self, id: NodeId) {
        if self.godfather.is_none() {
            info!("node {} is the godfather", id);
            self.godfather = Some(id);
        }
    }

    /// Brings a new or crashed node into BOOT state, with fresh channels: unicast ids start at
    ///  zero in both directions, and broadcasts from the node are expected starting with
    ///  `broadcast_next_id`.
    pub fn boot(&mut self, id: NodeId, incarnation: u64, broadcast_next_id: MessageId, pool: &FragmentPool, hooks: &LivenessHooks) -> NetResult<()> {
        if id == self.self_id || id.is_broadcast() {
            return Err(NetError::invalid_argument(format!("cannot boot node {}", id)));
        }

        match self.nodes.get_mut(&id) {
            Some(node) => {
                if node.state.is_alive() {
                    return Err(NetError::invalid_argument(format!("node {} is alive", id)));
                }
                let unreachable = NetError::Unreachable { node: id };
                node.unicast.send.reset(MessageId::ZERO, unreachable.clone(), pool);
                node.unicast.receive.reset(MessageId::ZERO, pool);
                node.broadcast.send.reset(MessageId::ZERO, unreachable, pool);
                node.broadcast.receive.reset(broadcast_next_id, pool);
                node.state = LivenessState::Boot;
                node.incarnation = incarnation;
                node.inbound_packets = 0;
            }
            None => {
                if self.nodes.len() + 1 >= self.capacity {
                    warn!("node table is full - ignoring node {}", id);
                    return Err(NetError::Exhausted { resource: "node table" });
                }
                self.nodes.insert(id, Node::new(id, LivenessState::Boot, incarnation, broadcast_next_id));
            }
        }

        info!("node {} booted with incarnation {}", id, incarnation);
        hooks.on_booted(id, incarnation);
        Ok(())
    }

    /// BOOT -> NETWORK when a booted node starts exchanging reliable traffic
    pub fn on_reliable_traffic(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.inbound_packets += 1;
            if node.state == LivenessState::Boot {
                debug!("node {} is exchanging reliable traffic", id);
                node.state = LivenessState::Network;
            }
        }
    }

    pub fn mark_operational(&mut self, id: NodeId, hooks: &LivenessHooks) -> NetResult<()> {
        let Some(node) = self.alive_mut(id) else {
            return Err(NetError::Unreachable { node: id });
        };
        if node.state != LivenessState::Operational {
            info!("node {} is operational", id);
            node.state = LivenessState::Operational;
            hooks.on_operational(id);
        }
        Ok(())
    }

    /// Moves an alive node to CRASHED: everything waiting on its unicast channel fails with
    ///  [NetError::Unreachable], partially received messages are discarded, and it is dropped
    ///  from the quorum of pending broadcasts. Returns false if the node was not alive, in
    ///  which case nothing happens and no hook fires.
    pub fn declare_crashed(&mut self, id: NodeId, pool: &FragmentPool, hooks: &LivenessHooks) -> bool {
        let Some(node) = self.alive_mut(id) else {
            return false;
        };

        warn!("node {} crashed", id);
        node.state = LivenessState::Crashed;
        let unreachable = NetError::Unreachable { node: id };
        node.unicast.send.reset(MessageId::ZERO, unreachable.clone(), pool);
        node.unicast.receive.reset(MessageId::ZERO, pool);
        node.broadcast.send.reset(MessageId::ZERO, unreachable, pool);
        node.broadcast.receive.reset(MessageId::ZERO, pool);

        for envelope in self.broadcast.broadcast.send.remove_from_quorum(id) {
            debug!("broadcast {} needs no more acknowledgements after crash of {}", envelope.id, id);
            envelope.finish(Ok(()), pool);
        }

        if self.godfather == Some(id) {
            self.godfather = None;
        }

        hooks.on_crashed(id);
        true
    }

    /// Restarts both unicast windows of an alive node at id zero, failing sends that wait
    ///  for a window slot or an acknowledgement with [NetError::Unreachable]. The node's
    ///  liveness state is unchanged. Returns false if the node is not alive.
    pub fn reset_unicast(&mut self, id: NodeId, pool: &FragmentPool) -> bool {
        let Some(node) = self.alive_mut(id) else {
            return false;
        };

        info!("resetting unicast channels of node {}", id);
        node.unicast.send.reset(MessageId::ZERO, NetError::Unreachable { node: id }, pool);
        node.unicast.receive.reset(MessageId::ZERO, pool);
        true
    }

    /// Stops waiting for the send with the given ticket. A send that is still waiting for a
    ///  window slot is discarded; an admitted one stays in place until it is acknowledged, but
    ///  nobody is notified any more.
    pub fn cancel_send(&mut self, to: NodeId, ticket: u64, pool: &FragmentPool) {
        let Some(window) = self.get_mut(to).map(|n| if to.is_broadcast() { &mut n.broadcast.send } else { &mut n.unicast.send }) else {
            return;
        };

        if let Some(idx) = window.awaiting_window.iter().position(|p| p.ticket == ticket) {
            if let Some(mut pending) = window.awaiting_window.remove(idx) {
                pool.release_all(mem::take(&mut pending.fragments));
            }
            return;
        }
        if let Some(envelope) = window.awaiting_ack.iter_mut().find(|e| e.ticket == ticket) {
            envelope.transmission.completion = None;
        }
    }

    /// Fails sends that have been waiting for a window slot past their caller's deadline
    pub fn expire_window_waiters(&mut self, now: Instant, pool: &FragmentPool) -> usize {
        let mut num_expired = 0;
        let windows = self.nodes.values_mut()
            .map(|n| &mut n.unicast.send)
            .chain(std::iter::once(&mut self.broadcast.broadcast.send));

        for window in windows {
            let (expired, waiting): (Vec<_>, Vec<_>) = mem::take(&mut window.awaiting_window)
                .into_iter()
                .partition(|p| p.is_expired(now));
            window.awaiting_window = waiting.into();

            for mut pending in expired {
                debug!("send {} timed out waiting for a window slot", pending.ticket);
                pending.complete(Err(NetError::Timeout));
                pool.release_all(mem::take(&mut pending.fragments));
                num_expired += 1;
            }
        }
        num_expired
    }

    pub fn info(&self, id: NodeId) -> Option<NodeInfo> {
        self.nodes.get(&id).map(NodeInfo::from)
    }

    pub fn infos(&self) -> Vec<NodeInfo> {
        let mut result = self.nodes.values()
            .map(NodeInfo::from)
            .collect::<Vec<_>>();
        result.sort_by_key(|n| n.id);
        result
    }
}
