use std::fmt::{Debug, Display, Formatter};

/// Identifies a node in the cluster. The adapter owns the mapping from node ids to network
///  addresses; the engine only ever deals with ids.
///
/// [NodeId::BROADCAST] is the synthetic id that stands for 'all alive nodes'.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(u16);

impl NodeId {
    pub const BROADCAST: NodeId = NodeId(u16::MAX);

    pub const fn new(raw: u16) -> NodeId {
        NodeId(raw)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_broadcast() {
            write!(f, "N(*)")
        }
        else {
            write!(f, "N({})", self.0)
        }
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}
