use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::bail;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, error, info, trace};

use crate::backoff::RetryBackoff;
use crate::buffers::fragment_pool::FragmentPool;
use crate::channel::{ReceiveWindow, WindowParams};
use crate::config::NetConfig;
use crate::envelope::{OutboundEnvelope, PendingSend};
use crate::error::{NetError, NetResult};
use crate::fragment::fragment_message;
use crate::adapter::InterfaceAdapter;
use crate::liveness::{HookKind, LivenessEvent, LivenessHooks, LivenessState};
use crate::message_id::MessageId;
use crate::node_db::{NodeDatabase, NodeInfo};
use crate::node_id::NodeId;
use crate::safe_converter::PrecheckedCast;
use crate::service::{ServiceHandler, ServiceInfo, ServiceRegistry, ServiceType};
use crate::stats::{NetStats, NetStatsSnapshot};
use crate::wire::{BootstrapKind, BootstrapMessage, FragmentFlags, FragmentHeader, PacketType};

/// The reliable delivery engine of one node.
///
/// All protocol state lives in the [NodeDatabase] behind a single lock. The fragment pool,
///  the service registry and the liveness hooks have their own synchronization and are never
///  held across an `await`.
pub struct NetLayer {
    self_id: NodeId,
    incarnation: u64,
    pub(crate) config: NetConfig,
    pub(crate) params: WindowParams,
    payload_per_fragment: usize,
    pub(crate) backoff: RetryBackoff,
    adapter: Arc<dyn InterfaceAdapter>,
    pub(crate) pool: FragmentPool,
    pub(crate) db: Mutex<NodeDatabase>,
    pub(crate) services: ServiceRegistry,
    pub(crate) hooks: LivenessHooks,
    pub(crate) stats: NetStats,
}

impl NetLayer {
    /// Creates an engine with an incarnation derived from the current time, so that a
    ///  restarted process is distinguishable from its predecessor
    pub fn new(self_id: NodeId, config: NetConfig, adapter: Arc<dyn InterfaceAdapter>) -> anyhow::Result<NetLayer> {
        let incarnation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::with_incarnation(self_id, incarnation, config, adapter)
    }

    pub fn with_incarnation(self_id: NodeId, incarnation: u64, config: NetConfig, adapter: Arc<dyn InterfaceAdapter>) -> anyhow::Result<NetLayer> {
        if self_id.is_broadcast() {
            bail!("{:?} is reserved for broadcast", self_id);
        }
        config.validate()?;
        let (mtu, header_len) = (adapter.mtu(), adapter.header_len());
        config.validate_for_adapter(mtu, header_len)?;

        info!("starting net layer for node {} with incarnation {}, MTU {}, max message length {}",
            self_id, incarnation, mtu, config.max_message_len(mtu, header_len));

        Ok(NetLayer {
            self_id,
            incarnation,
            params: WindowParams::new(&config),
            payload_per_fragment: NetConfig::payload_per_fragment(mtu, header_len),
            backoff: config.retry_backoff(),
            pool: FragmentPool::new(config.fragment_pool_size, mtu, header_len),
            db: Mutex::new(NodeDatabase::new(self_id, config.node_table_capacity)),
            services: ServiceRegistry::new(),
            hooks: LivenessHooks::new(),
            stats: Default::default(),
            adapter,
            config,
        })
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn max_message_len(&self) -> usize {
        self.config.max_fragments_per_message as usize * self.payload_per_fragment
    }

    /// Sends a message to a node and waits until the node acknowledges it. The message's first
    ///  two bytes are the target service type.
    ///
    /// The send fails with [NetError::Timeout] if it is not acknowledged within `timeout`,
    ///  with [NetError::Unreachable] if the node is not alive or crashes before acknowledging,
    ///  and with [NetError::Exhausted] if there are not enough free fragments.
    pub async fn send(&self, to: NodeId, data: &[u8], timeout: Option<Duration>, priority: u16) -> NetResult<()> {
        if to.is_broadcast() {
            return Err(NetError::invalid_argument("broadcast messages are sent with send_broadcast"));
        }
        if to == self.self_id {
            return Err(NetError::invalid_argument("a node cannot send messages to itself"));
        }
        self.do_send(to, data, timeout, priority).await
    }

    /// Sends a message to all alive nodes. The send completes successfully when every node
    ///  that was alive when the message was admitted to the send window has acknowledged it
    ///  or crashed.
    pub async fn send_broadcast(&self, data: &[u8], timeout: Option<Duration>, priority: u16) -> NetResult<()> {
        self.do_send(NodeId::BROADCAST, data, timeout, priority).await
    }

    async fn do_send(&self, to: NodeId, data: &[u8], timeout: Option<Duration>, priority: u16) -> NetResult<()> {
        if ServiceType::of_message(data).is_none() {
            return Err(NetError::invalid_argument("a message must start with its service type"));
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        let fragments = fragment_message(&self.pool, data, self.payload_per_fragment, self.config.max_fragments_per_message, to.is_broadcast(), priority)
            .inspect_err(|e| if let NetError::Exhausted { .. } = e {
                NetStats::inc(&self.stats.pool_exhausted);
            })?;

        let (completion, mut outcome) = oneshot::channel();
        let ticket = {
            let mut db = self.db.lock().await;
            let ticket = db.next_ticket();
            let Some(window) = db.outbound_window_mut(to) else {
                debug!("send to {} which is not alive", to);
                self.pool.release_all(fragments);
                return Err(NetError::Unreachable { node: to });
            };
            trace!("send {}: {} bytes in {} fragments to {}", ticket, data.len(), fragments.len(), to);
            window.awaiting_window.push_back(PendingSend {
                ticket,
                priority,
                fragments,
                deadline,
                completion: Some(completion),
            });
            self.admit_waiting(&mut db, to).await;
            ticket
        };

        let result = match deadline {
            None => outcome.await.ok(),
            Some(deadline) => match timeout_at(deadline, &mut outcome).await {
                Ok(r) => r.ok(),
                Err(_) => {
                    self.db.lock().await
                        .cancel_send(to, ticket, &self.pool);
                    // the outcome may have been decided while we were waiting for the lock
                    match outcome.try_recv() {
                        Ok(r) => Some(r),
                        Err(_) => {
                            debug!("send {} to {} timed out", ticket, to);
                            Some(Err(NetError::Timeout))
                        }
                    }
                }
            }
        };
        result.unwrap_or(Err(NetError::Unreachable { node: to }))
    }

    /// Admits sends waiting for the window of `to` while there are free slots: each gets the
    ///  next message id and is transmitted with the current cumulative acknowledgement of the
    ///  reverse direction piggybacked.
    pub(crate) async fn admit_waiting(&self, db: &mut NodeDatabase, to: NodeId) {
        let quorum = if to.is_broadcast() { db.alive_peers() } else { Default::default() };
        let Some(node) = (if to.is_broadcast() { db.get_mut(to) } else { db.alive_mut(to) }) else {
            return;
        };
        let channel = if to.is_broadcast() { &mut node.broadcast } else { &mut node.unicast };

        while channel.send.has_window_slot(self.params.window) {
            let Some(pending) = channel.send.awaiting_window.pop_front() else {
                break;
            };
            let id = channel.send.assign_id();
            let mut envelope = pending.admit(id, Instant::now() + self.backoff.delay(0), quorum.clone());
            trace!("admitted send {} as message {} to {} ({} bytes)", envelope.ticket, id, to, envelope.len());

            let ack = if to.is_broadcast() {
                MessageId::ZERO
            }
            else {
                // the piggybacked acknowledgement makes a delayed one unnecessary
                channel.receive.delayed_ack = false;
                channel.receive.next_expected()
            };
            if self.transmit(to, &mut envelope, ack).await.is_err() {
                envelope.transmission.complete(Err(NetError::Unreachable { node: to }));
            }

            if to.is_broadcast() && envelope.transmission.outstanding.is_empty() {
                debug!("broadcast {} has no nodes to wait for", id);
                envelope.finish(Ok(()), &self.pool);
                continue;
            }
            channel.send.awaiting_ack.push_back(envelope);
        }
    }

    /// Sends all fragments of an envelope, stamped with `ack` as the cumulative
    ///  acknowledgement
    pub(crate) async fn transmit(&self, to: NodeId, envelope: &mut OutboundEnvelope, ack: MessageId) -> anyhow::Result<()> {
        let id = envelope.id;
        for fragment in envelope.fragments.iter_mut() {
            fragment.header.packet_id = id;
            fragment.header.cumulative_ack = ack;
            self.send_packet(to, fragment.encode(), envelope.priority).await?;
        }
        Ok(())
    }

    pub(crate) async fn send_packet(&self, to: NodeId, packet: &mut [u8], priority: u16) -> anyhow::Result<()> {
        match self.adapter.send_fragment(to, packet, priority).await {
            Ok(()) => {
                NetStats::inc(&self.stats.fragments_sent);
                Ok(())
            }
            Err(e) => {
                error!("error sending fragment to {}: {}", to, e);
                NetStats::inc(&self.stats.adapter_failures);
                Err(e)
            }
        }
    }

    /// Sends a fragment without payload, e.g. an acknowledgement
    pub(crate) async fn send_control(&self, to: NodeId, header: FragmentHeader) -> anyhow::Result<()> {
        let mut packet = vec![0u8; self.adapter.header_len()];
        header.ser(&mut packet);
        self.send_packet(to, &mut packet, header.priority).await
    }

    /// Sends the cumulative acknowledgement of a receive window
    pub(crate) async fn send_ack(&self, to: NodeId, is_broadcast: bool, window: &mut ReceiveWindow) {
        window.delayed_ack = false;
        let packet_type = if is_broadcast { PacketType::BroadcastAck } else { PacketType::Ack };
        let header = FragmentHeader::control(packet_type, MessageId::ZERO, window.next_expected(), 0, window.ack_priority);
        trace!("sending {:?} {} to {}", packet_type, window.next_expected(), to);
        if self.send_control(to, header).await.is_ok() {
            NetStats::inc(&self.stats.acks_sent);
        }
    }

    pub(crate) async fn send_bootstrap(&self, to: NodeId, msg: &BootstrapMessage) -> anyhow::Result<()> {
        let mut payload = Vec::new();
        msg.ser(&mut payload);

        let mut flags = FragmentFlags::HEADER;
        if to.is_broadcast() {
            flags |= FragmentFlags::BROADCAST;
        }
        let header = FragmentHeader {
            packet_id: MessageId::ZERO,
            cumulative_ack: MessageId::ZERO,
            fragment_seq: 0,
            payload_len: payload.len().prechecked_cast(),
            packet_type: PacketType::Bootstrap,
            flags,
            priority: 0,
        };

        let mut packet = vec![0u8; self.adapter.header_len()];
        header.ser(&mut packet);
        packet.extend_from_slice(&payload);
        self.send_packet(to, &mut packet, 0).await
    }

    /// Announces this node to all nodes, which answer with a bootstrap reply. The first node
    ///  to reply becomes the godfather.
    ///
    /// Announcing restarts the unicast channels to all alive nodes, and they restart theirs
    ///  when the announcement arrives. Unicast sends that are still pending fail with
    ///  [NetError::Unreachable].
    pub async fn announce(&self) -> NetResult<()> {
        let mut db = self.db.lock().await;
        for node in db.alive_peers() {
            db.reset_unicast(node, &self.pool);
        }
        let msg = BootstrapMessage {
            kind: BootstrapKind::Announce,
            incarnation: self.incarnation,
            broadcast_next_id: db.broadcast_next_id(),
        };
        info!("announcing node {}", self.self_id);
        self.send_bootstrap(NodeId::BROADCAST, &msg).await
            .map_err(|_| NetError::Unreachable { node: NodeId::BROADCAST })
    }

    /// Registers the handler for a service type. The service starts out down.
    pub fn register_service(&self, service_type: ServiceType, handler: Arc<dyn ServiceHandler>, task_priority: u16, network_priority: u16) -> NetResult<()> {
        self.services.register(service_type, handler, task_priority, network_priority)
    }

    pub fn mark_service_up(&self, service_type: ServiceType) -> NetResult<()> {
        self.services.set_up(service_type, true)
    }

    pub fn mark_service_down(&self, service_type: ServiceType) -> NetResult<()> {
        self.services.set_up(service_type, false)
    }

    pub fn services(&self) -> Vec<ServiceInfo> {
        self.services.services()
    }

    /// Registers a callback for liveness transitions. Callbacks run synchronously while the
    ///  node database is locked: they must return quickly and must not call the engine.
    pub fn register_liveness_hook(&self, kind: HookKind, hook: impl Fn(NodeId) + Send + Sync + 'static) {
        self.hooks.register(kind, Arc::new(hook));
    }

    pub fn subscribe_liveness(&self) -> broadcast::Receiver<LivenessEvent> {
        self.hooks.subscribe()
    }

    /// Called by higher-level synchronization when a node is fully caught up
    pub async fn mark_operational(&self, node: NodeId) -> NetResult<()> {
        self.db.lock().await
            .mark_operational(node, &self.hooks)
    }

    /// Declares a node crashed, failing all sends to it. Returns false if the node was not
    ///  alive.
    pub async fn declare_crashed(&self, node: NodeId) -> bool {
        self.db.lock().await
            .declare_crashed(node, &self.pool, &self.hooks)
    }

    pub async fn node_state(&self, node: NodeId) -> Option<LivenessState> {
        self.db.lock().await
            .get(node)
            .filter(|n| !n.id.is_broadcast())
            .map(|n| n.state)
    }

    pub async fn nodes(&self) -> Vec<NodeInfo> {
        self.db.lock().await.infos()
    }

    pub async fn godfather(&self) -> Option<NodeId> {
        self.db.lock().await.godfather()
    }

    pub fn stats(&self) -> NetStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn pool_available(&self) -> usize {
        self.pool.available()
    }
}
