use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::adapter::InterfaceAdapter;
use crate::config::NetConfig;
use crate::error::NetResult;
use crate::liveness::HookKind;
use crate::net_layer::NetLayer;
use crate::node_id::NodeId;
use crate::service::{ReceivedMessage, ServiceHandler, ServiceType};
use crate::wire::{FragmentHeader, PacketType};

/// MTU of [RecordingAdapter]: with its 4 byte header, this leaves 10 bytes of payload per fragment
pub const TEST_MTU: usize = 28;
pub const TEST_HEADER_LEN: usize = 4;
pub const TEST_PAYLOAD_PER_FRAGMENT: usize = 10;

pub const TEST_SERVICE: ServiceType = ServiceType(7);

/// small ring and short messages, acknowledging every delivery immediately
pub fn test_config() -> NetConfig {
    NetConfig {
        ring_size: 8,
        max_fragments_per_message: 4,
        fragment_pool_size: 64,
        piggyback_unicast_acks: false,
        ..NetConfig::default()
    }
}

/// a message for a service, i.e. the body prefixed with the service type
pub fn message(service: ServiceType, body: &[u8]) -> Vec<u8> {
    let mut result = service.0.to_be_bytes().to_vec();
    result.extend_from_slice(body);
    result
}

#[derive(Clone, Debug)]
pub struct SentPacket {
    pub to: NodeId,
    pub priority: u16,
    pub header: FragmentHeader,
    /// the packet without the adapter's header
    pub packet: Vec<u8>,
}

impl SentPacket {
    pub fn payload(&self) -> &[u8] {
        &self.packet[FragmentHeader::SERIALIZED_LEN..]
    }

    pub fn is_data(&self, fragment_seq: u16) -> bool {
        matches!(self.header.packet_type, PacketType::Data | PacketType::BroadcastData) && self.header.fragment_seq == fragment_seq
    }
}

/// An adapter that records everything it is asked to send, leaving delivery to the test
pub struct RecordingAdapter {
    sent: Mutex<Vec<SentPacket>>,
    is_failing: AtomicBool,
}

impl RecordingAdapter {
    pub fn new() -> RecordingAdapter {
        RecordingAdapter {
            sent: Default::default(),
            is_failing: AtomicBool::new(false),
        }
    }

    /// returns sent packets, clearing the internal buffer
    pub fn take_sent(&self) -> Vec<SentPacket> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn set_failing(&self, is_failing: bool) {
        self.is_failing.store(is_failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl InterfaceAdapter for RecordingAdapter {
    fn mtu(&self) -> usize {
        TEST_MTU
    }

    fn header_len(&self) -> usize {
        TEST_HEADER_LEN
    }

    async fn send_fragment(&self, to: NodeId, packet: &mut [u8], priority: u16) -> anyhow::Result<()> {
        if self.is_failing.load(Ordering::SeqCst) {
            bail!("interface is down");
        }
        assert!(packet.len() <= TEST_MTU, "packet of {} bytes exceeds MTU", packet.len());
        packet[..TEST_HEADER_LEN].copy_from_slice(&[0xAD; TEST_HEADER_LEN]);

        let packet = packet[TEST_HEADER_LEN..].to_vec();
        let header = FragmentHeader::deser(&mut packet.as_slice())?;
        self.sent.lock().unwrap().push(SentPacket {
            to,
            priority,
            header,
            packet,
        });
        Ok(())
    }
}

/// Forwards received messages to a channel
pub struct CollectingHandler {
    messages: mpsc::UnboundedSender<ReceivedMessage>,
}

impl CollectingHandler {
    pub fn new() -> (Arc<CollectingHandler>, mpsc::UnboundedReceiver<ReceivedMessage>) {
        let (messages, rx) = mpsc::unbounded_channel();
        (Arc::new(CollectingHandler { messages }), rx)
    }
}

#[async_trait]
impl ServiceHandler for CollectingHandler {
    async fn on_message(&self, message: ReceivedMessage) {
        let _ = self.messages.send(message);
    }
}

pub struct TestNode {
    pub layer: Arc<NetLayer>,
    pub adapter: Arc<RecordingAdapter>,
    pub received: mpsc::UnboundedReceiver<ReceivedMessage>,
}

impl TestNode {
    pub fn id(&self) -> NodeId {
        self.layer.self_id()
    }

    /// messages that reached the test service so far
    pub async fn received_bodies(&mut self) -> Vec<Vec<u8>> {
        settle().await;
        let mut result = Vec::new();
        while let Ok(msg) = self.received.try_recv() {
            result.push(msg.body().to_vec());
        }
        result
    }
}

/// A set of nodes connected by a network that the test drives explicitly: nothing is
///  delivered until [TestCluster::pump] is called, which allows dropping and reordering packets.
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Nodes 1 to `num_nodes`, each with [TEST_SERVICE] registered and up. The nodes do not know
    ///  each other before [TestCluster::connect] is called.
    pub fn new(num_nodes: u16, config: NetConfig) -> TestCluster {
        let nodes = (1..=num_nodes)
            .map(|n| Self::create_node(NodeId::new(n), 100 + n as u64, config.clone()))
            .collect();
        TestCluster { nodes }
    }

    pub fn create_node(id: NodeId, incarnation: u64, config: NetConfig) -> TestNode {
        let adapter = Arc::new(RecordingAdapter::new());
        let layer = Arc::new(NetLayer::with_incarnation(id, incarnation, config, adapter.clone()).unwrap());
        let (handler, received) = CollectingHandler::new();
        layer.register_service(TEST_SERVICE, handler, 0, 0).unwrap();
        layer.mark_service_up(TEST_SERVICE).unwrap();
        TestNode { layer, adapter, received }
    }

    /// every node announces itself, in order
    pub async fn connect(&self) {
        for node in &self.nodes {
            node.layer.announce().await.unwrap();
            self.pump().await;
        }
    }

    pub fn node(&self, id: u16) -> &TestNode {
        &self.nodes[id as usize - 1]
    }

    pub fn node_mut(&mut self, id: u16) -> &mut TestNode {
        &mut self.nodes[id as usize - 1]
    }

    pub fn layer(&self, id: u16) -> &Arc<NetLayer> {
        &self.node(id).layer
    }

    /// delivers all packets until the network is quiet, returning them as (sender, receiver,
    ///  packet) in the order of delivery
    pub async fn pump(&self) -> Vec<(NodeId, NodeId, SentPacket)> {
        self.pump_filtered(|_, _, _| true).await
    }

    /// like [TestCluster::pump], but only delivers packets for which `filter` returns true.
    ///  Broadcast packets are filtered per receiver.
    pub async fn pump_filtered(&self, mut filter: impl FnMut(NodeId, NodeId, &SentPacket) -> bool) -> Vec<(NodeId, NodeId, SentPacket)> {
        let mut result = Vec::new();
        loop {
            settle().await;
            let mut is_quiet = true;
            for node in &self.nodes {
                for sent in node.adapter.take_sent() {
                    is_quiet = false;
                    for receiver in self.receivers(node.id(), sent.to) {
                        if !filter(node.id(), receiver.id(), &sent) {
                            continue;
                        }
                        let _ = receiver.layer.on_fragment_arrival(node.id(), sent.priority, &sent.packet).await;
                        result.push((node.id(), receiver.id(), sent.clone()));
                    }
                }
            }
            if is_quiet {
                return result;
            }
        }
    }

    fn receivers(&self, from: NodeId, to: NodeId) -> Vec<&TestNode> {
        self.nodes.iter()
            .filter(|n| n.id() != from && (to.is_broadcast() || n.id() == to))
            .collect()
    }
}

/// starts sending a message with [TEST_SERVICE] in the background, using
///  [NetLayer::send_broadcast] for [NodeId::BROADCAST]
pub fn spawn_send(layer: &Arc<NetLayer>, to: NodeId, body: &[u8], timeout: Option<Duration>) -> JoinHandle<NetResult<()>> {
    let layer = layer.clone();
    let data = message(TEST_SERVICE, body);
    tokio::spawn(async move {
        if to.is_broadcast() {
            layer.send_broadcast(&data, timeout, 0).await
        }
        else {
            layer.send(to, &data, timeout, 0).await
        }
    })
}

/// counts how often a liveness hook fires
pub fn hook_counter(layer: &NetLayer, kind: HookKind) -> Arc<AtomicUsize> {
    let result = Arc::new(AtomicUsize::new(0));
    let counter = result.clone();
    layer.register_liveness_hook(kind, move |_| { counter.fetch_add(1, Ordering::SeqCst); });
    result
}

/// gives spawned tasks the chance to run until they wait for something
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
