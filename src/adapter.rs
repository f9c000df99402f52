use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::node_id::NodeId;

/// The physical interface below the engine. The adapter owns the mapping from node ids to
///  network addresses and the raw transport; the engine is transport agnostic.
///
/// Receiving is the other direction of the contract: the adapter calls
///  [crate::net_layer::NetLayer::on_fragment_arrival] for every packet it receives, after
///  stripping its own header.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InterfaceAdapter: Send + Sync + 'static {
    /// Maximum size of a packet on this interface, including the adapter's header
    fn mtu(&self) -> usize;

    /// Number of bytes at the start of every packet that are reserved for the adapter's own
    ///  header, which the adapter fills in place. Retransmissions pass the same buffer again.
    fn header_len(&self) -> usize;

    /// Sends a packet to a node, or to all nodes for [NodeId::BROADCAST]. `packet` starts with
    ///  the reserved header region.
    async fn send_fragment(&self, to: NodeId, packet: &mut [u8], priority: u16) -> anyhow::Result<()>;
}
