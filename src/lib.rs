//! Reliable, ordered message delivery between the nodes of a cluster, on top of an unreliable
//!  packet interface.
//!
//! Messages are split into fragments that fit the interface's MTU. Each pair of nodes has a
//!  unicast channel with a sliding window of 16 bit message ids and cumulative
//!  acknowledgements; missing fragments are requested selectively. Broadcasts go through a
//!  single channel per node and complete when all nodes that were alive when the broadcast was
//!  sent have acknowledged it. Nodes that stop acknowledging are declared crashed.
//!
//! The engine is [net_layer::NetLayer]. It sends through an [adapter::InterfaceAdapter] and
//!  is fed received packets by it, and it hands complete messages to the
//!  [service::ServiceHandler] registered for their service type.

pub mod adapter;
pub mod backoff;
pub mod buffers;
pub mod channel;
pub mod config;
pub mod envelope;
pub mod error;
pub mod fragment;
pub mod liveness;
pub mod maintenance;
pub mod message_id;
pub mod net_layer;
pub mod node_db;
pub mod node_id;
pub mod receive;
pub mod safe_converter;
pub mod service;
pub mod stats;
pub mod wire;

#[cfg(test)]
mod test_util;
