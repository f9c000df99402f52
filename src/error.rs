use crate::node_id::NodeId;

/// The outcome of a failed engine operation. Resource exhaustion and timeouts are local
///  conditions reported to the immediate caller; unreachability is also visible as a node
///  state change; protocol violations are scoped to the node that sent the offending traffic.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum NetError {
    #[error("timed out")]
    Timeout,

    #[error("node {node} is unreachable")]
    Unreachable {
        node: NodeId,
    },

    #[error("{resource} exhausted")]
    Exhausted {
        resource: &'static str,
    },

    #[error("invalid argument: {message}")]
    InvalidArgument {
        message: String,
    },

    /// Traffic from `node` broke the protocol (malformed header, unknown packet type,
    ///  inconsistent fragment chain, acknowledgement of ids that were never sent). The node's
    ///  state is not trusted afterwards, and it is isolated by declaring it crashed.
    #[error("protocol violation by node {node}: {message}")]
    ProtocolViolation {
        node: NodeId,
        message: String,
    },
}

impl NetError {
    pub(crate) fn violation(node: NodeId, message: impl Into<String>) -> NetError {
        NetError::ProtocolViolation { node, message: message.into() }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> NetError {
        NetError::InvalidArgument { message: message.into() }
    }
}

pub type NetResult<T> = Result<T, NetError>;
