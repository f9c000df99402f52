//! The receive path: the adapter hands every received packet to
//!  [NetLayer::on_fragment_arrival], which dispatches it by packet type.

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::channel::{DataOutcome, Delivery};
use crate::error::{NetError, NetResult};
use crate::fragment::parse_packet;
use crate::message_id::MessageId;
use crate::net_layer::NetLayer;
use crate::node_db::NodeDatabase;
use crate::node_id::NodeId;
use crate::service::{ReceivedMessage, ServiceType};
use crate::stats::NetStats;
use crate::wire::{BootstrapKind, BootstrapMessage, FragmentFlags, FragmentHeader, PacketType};

/// Problems with a node's traffic, turned into [NetError::ProtocolViolation] at the top level
type Violation = String;

/// Why a received packet was not processed
enum Rejection {
    Violation(Violation),
    /// no free fragment for buffering received data, the sender retransmits it
    Exhausted(NetError),
}

impl From<Violation> for Rejection {
    fn from(message: Violation) -> Self {
        Rejection::Violation(message)
    }
}

impl NetLayer {
    /// Processes a packet received from `source`. `packet` starts with the fragment header,
    ///  the adapter's own header is already stripped.
    ///
    /// Traffic that breaks the protocol is reported as [NetError::ProtocolViolation], and the
    ///  source node is declared crashed: its state can not be trusted any more. Fragments from
    ///  unknown or crashed nodes are dropped silently, except for bootstrap messages.
    ///
    /// Only data fragments are buffered in the fragment pool. If it is empty, the fragment is
    ///  dropped and [NetError::Exhausted] is returned, but its piggybacked acknowledgement is
    ///  still processed. Control packets never need a pooled fragment.
    pub async fn on_fragment_arrival(&self, source: NodeId, priority: u16, packet: &[u8]) -> NetResult<()> {
        NetStats::inc(&self.stats.fragments_received);
        if source == self.self_id() || source.is_broadcast() {
            trace!("ignoring fragment from {}", source);
            return Ok(());
        }

        let mut db = self.db.lock().await;

        let (header, payload) = match parse_packet(packet) {
            Ok(parsed) => parsed,
            Err(e) => return Err(self.on_violation(&mut db, source, format!("malformed fragment: {}", e))),
        };
        trace!("received {:?} from {} with priority {}", header, source, priority);

        let result = if header.packet_type == PacketType::Bootstrap {
            self.on_bootstrap(&mut db, source, payload).await
                .map_err(Rejection::from)
        }
        else if db.alive_mut(source).is_none() {
            debug!("{:?} from unknown or crashed node {} - dropping", header.packet_type, source);
            NetStats::inc(&self.stats.unknown_source);
            Ok(())
        }
        else {
            db.on_reliable_traffic(source);
            self.on_reliable_packet(&mut db, source, priority, &header, packet).await
        };

        result.map_err(|rejection| match rejection {
            Rejection::Violation(msg) => self.on_violation(&mut db, source, msg),
            Rejection::Exhausted(e) => e,
        })
    }

    fn on_violation(&self, db: &mut NodeDatabase, source: NodeId, message: Violation) -> NetError {
        warn!("protocol violation by node {}: {}", source, message);
        NetStats::inc(&self.stats.protocol_violations);
        db.declare_crashed(source, &self.pool, &self.hooks);
        NetError::violation(source, message)
    }

    async fn on_reliable_packet(&self, db: &mut NodeDatabase, source: NodeId, priority: u16, header: &FragmentHeader, packet: &[u8]) -> Result<(), Rejection> {
        let expects_broadcast_flag = header.packet_type == PacketType::BroadcastData;
        if header.flags.contains(FragmentFlags::BROADCAST) != expects_broadcast_flag {
            return Err(format!("broadcast flag is inconsistent with packet type {:?}", header.packet_type).into());
        }

        match header.packet_type {
            PacketType::Data => self.on_data(db, source, priority, header, packet, false).await,
            PacketType::BroadcastData => self.on_data(db, source, priority, header, packet, true).await,
            PacketType::Ack => self.on_unicast_ack(db, source, header.cumulative_ack).await
                .map_err(Rejection::from),
            PacketType::BroadcastAck => self.on_broadcast_ack(db, source, header.cumulative_ack).await
                .map_err(Rejection::from),
            PacketType::NegativeAck => self.on_nak(db, source, header).await
                .map_err(Rejection::from),
            PacketType::Bootstrap => Err(format!("unexpected packet type {:?}", header.packet_type).into()),
        }
    }

    async fn on_data(&self, db: &mut NodeDatabase, source: NodeId, priority: u16, header: &FragmentHeader, packet: &[u8], is_broadcast: bool) -> Result<(), Rejection> {
        let id = header.packet_id;

        if !is_broadcast {
            self.on_unicast_ack(db, source, header.cumulative_ack).await?;
        }

        let Some(node) = db.alive_mut(source) else {
            return Ok(());
        };

        let mut fragment = match self.pool.allocate() {
            Ok(fragment) => fragment,
            Err(e) => {
                debug!("no free fragment for message {} from {} - dropping it", id, source);
                NetStats::inc(&self.stats.pool_exhausted);
                return Err(Rejection::Exhausted(e));
            }
        };
        if let Err(e) = fragment.decode_from(packet) {
            self.pool.release(fragment);
            return Err(format!("malformed fragment: {}", e).into());
        }

        let window = if is_broadcast { &mut node.broadcast.receive } else { &mut node.unicast.receive };

        match window.on_data(fragment, self.params, &self.pool, Instant::now())? {
            DataOutcome::AlreadyDelivered => {
                debug!("message {} from {} was delivered before - acknowledging again", id, source);
                NetStats::inc(&self.stats.duplicates);
                self.send_ack(source, is_broadcast, window).await;
            }
            DataOutcome::Duplicate => {
                NetStats::inc(&self.stats.duplicates);
            }
            DataOutcome::OutOfWindow => {
                NetStats::inc(&self.stats.out_of_window);
            }
            DataOutcome::Accepted { missing, deliveries } => {
                if !is_broadcast {
                    for seq in missing {
                        debug!("fragment {} of message {} from {} is missing - requesting it", seq, id, source);
                        let nak = FragmentHeader::control(PacketType::NegativeAck, id, window.next_expected(), seq, priority);
                        if self.send_control(source, nak).await.is_ok() {
                            NetStats::inc(&self.stats.naks_sent);
                        }
                    }
                }

                if !deliveries.is_empty() {
                    for delivery in deliveries {
                        window.ack_priority = self.dispatch(source, is_broadcast, delivery);
                    }

                    let delay_ack = if is_broadcast { self.config.piggyback_broadcast_acks } else { self.config.piggyback_unicast_acks };
                    if delay_ack {
                        window.delayed_ack = true;
                    }
                    else {
                        self.send_ack(source, is_broadcast, window).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Hands a complete message to its service, returning the priority for acknowledging it
    fn dispatch(&self, source: NodeId, is_broadcast: bool, delivery: Delivery) -> u16 {
        let Some(service_type) = ServiceType::of_message(&delivery.data) else {
            debug!("message {} from {} is too short for a service type - discarding", delivery.id, source);
            NetStats::inc(&self.stats.messages_undeliverable);
            return delivery.priority;
        };

        let message = ReceivedMessage {
            source,
            is_broadcast,
            service_type,
            priority: delivery.priority,
            data: delivery.data,
        };
        match self.services.dispatch(message) {
            Some(network_priority) => {
                NetStats::inc(&self.stats.messages_delivered);
                network_priority
            }
            None => {
                NetStats::inc(&self.stats.messages_undeliverable);
                delivery.priority
            }
        }
    }

    async fn on_unicast_ack(&self, db: &mut NodeDatabase, source: NodeId, ack: MessageId) -> Result<(), Violation> {
        let Some(node) = db.alive_mut(source) else {
            return Ok(());
        };
        let acknowledged = node.unicast.send.on_ack(ack)?;
        if acknowledged.is_empty() {
            return Ok(());
        }

        for envelope in acknowledged {
            trace!("message {} acknowledged by {}", envelope.id, source);
            envelope.finish(Ok(()), &self.pool);
        }
        self.admit_waiting(db, source).await;
        Ok(())
    }

    async fn on_broadcast_ack(&self, db: &mut NodeDatabase, source: NodeId, ack: MessageId) -> Result<(), Violation> {
        let done = db.broadcast_window_mut().on_broadcast_ack(source, ack)?;
        if done.is_empty() {
            return Ok(());
        }

        for envelope in done {
            trace!("broadcast {} acknowledged by all nodes", envelope.id);
            envelope.finish(Ok(()), &self.pool);
        }
        self.admit_waiting(db, NodeId::BROADCAST).await;
        Ok(())
    }

    /// Retransmits the single fragment a node reports missing
    async fn on_nak(&self, db: &mut NodeDatabase, source: NodeId, header: &FragmentHeader) -> Result<(), Violation> {
        NetStats::inc(&self.stats.naks_received);
        self.on_unicast_ack(db, source, header.cumulative_ack).await?;

        let Some(node) = db.alive_mut(source) else {
            return Ok(());
        };
        let ack = node.unicast.receive.next_expected();
        let Some(envelope) = node.unicast.send.awaiting_ack.iter_mut().find(|e| e.id == header.packet_id) else {
            debug!("NAK from {} for message {} which is not awaiting acknowledgement - ignoring", source, header.packet_id);
            return Ok(());
        };
        let priority = envelope.priority;
        let Some(fragment) = envelope.fragments.iter_mut().find(|f| f.header.fragment_seq == header.fragment_seq) else {
            return Err(format!("NAK for fragment {} of message {} which does not exist", header.fragment_seq, header.packet_id));
        };

        debug!("retransmitting fragment {} of message {} to {}", header.fragment_seq, header.packet_id, source);
        fragment.header.cumulative_ack = ack;
        node.unicast.receive.delayed_ack = false;
        NetStats::inc(&self.stats.retransmissions);
        let _ = self.send_packet(source, fragment.encode(), priority).await;
        Ok(())
    }

    async fn on_bootstrap(&self, db: &mut NodeDatabase, source: NodeId, mut payload: &[u8]) -> Result<(), Violation> {
        let msg = BootstrapMessage::deser(&mut payload)
            .map_err(|e| format!("malformed bootstrap message: {}", e))?;
        debug!("received {:?} from {}", msg, source);

        let known_incarnation = db.get(source)
            .filter(|n| n.state.is_alive())
            .map(|n| n.incarnation);
        let is_known = known_incarnation == Some(msg.incarnation);

        if !is_known {
            if known_incarnation.is_some() {
                debug!("node {} restarted with incarnation {}", source, msg.incarnation);
                db.declare_crashed(source, &self.pool, &self.hooks);
            }
            if let Err(e) = db.boot(source, msg.incarnation, msg.broadcast_next_id, &self.pool, &self.hooks) {
                warn!("could not add node {}: {}", source, e);
                return Ok(());
            }
        }
        else if msg.kind == BootstrapKind::Announce {
            // the announcing node restarted its unicast channels to all nodes it knows
            db.reset_unicast(source, &self.pool);
        }

        match msg.kind {
            BootstrapKind::Announce => {
                let reply = BootstrapMessage {
                    kind: BootstrapKind::Reply,
                    incarnation: self.incarnation(),
                    broadcast_next_id: db.broadcast_next_id(),
                };
                let _ = self.send_bootstrap(source, &reply).await;
            }
            BootstrapKind::Reply => {
                db.set_godfather_if_unset(source);
            }
        }
        Ok(())
    }
}
