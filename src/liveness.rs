use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::node_id::NodeId;

/// A node's liveness, as seen by this node
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LivenessState {
    /// unreachable or unresponsive - all operations against the node fail until it announces
    ///  itself again
    Crashed,
    /// freshly announced, nothing exchanged over its reliable channels yet
    Boot,
    /// exchanging reliable traffic, but not yet fully synchronized by higher-level services
    Network,
    /// fully caught up and eligible for all services
    Operational,
}

impl LivenessState {
    pub fn is_alive(&self) -> bool {
        *self != LivenessState::Crashed
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LivenessEvent {
    Booted { node: NodeId, incarnation: u64 },
    Operational { node: NodeId },
    Crashed { node: NodeId },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HookKind {
    OnOperational,
    OnCrashed,
}

pub type LivenessHook = Arc<dyn Fn(NodeId) + Send + Sync>;

/// Observers of liveness transitions. Hooks are called synchronously while the node database
///  is locked, so they must return quickly and must not call back into the engine. Observers
///  that need to do real work subscribe to the event stream instead.
pub struct LivenessHooks {
    hooks: RwLock<Vec<(HookKind, LivenessHook)>>,
    events: broadcast::Sender<LivenessEvent>,
}

impl LivenessHooks {
    pub fn new() -> LivenessHooks {
        let (events, _) = broadcast::channel(128);
        LivenessHooks {
            hooks: Default::default(),
            events,
        }
    }

    pub fn register(&self, kind: HookKind, hook: LivenessHook) {
        debug!("registering liveness hook {:?}", kind);
        self.hooks.write().unwrap().push((kind, hook));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LivenessEvent> {
        self.events.subscribe()
    }

    pub fn on_booted(&self, node: NodeId, incarnation: u64) {
        self.send_event(LivenessEvent::Booted { node, incarnation });
    }

    pub fn on_operational(&self, node: NodeId) {
        self.call_hooks(HookKind::OnOperational, node);
        self.send_event(LivenessEvent::Operational { node });
    }

    pub fn on_crashed(&self, node: NodeId) {
        self.call_hooks(HookKind::OnCrashed, node);
        self.send_event(LivenessEvent::Crashed { node });
    }

    fn call_hooks(&self, kind: HookKind, node: NodeId) {
        for (k, hook) in self.hooks.read().unwrap().iter() {
            if *k == kind {
                hook(node);
            }
        }
    }

    fn send_event(&self, event: LivenessEvent) {
        trace!("liveness event: {:?}", event);
        let _ = self.events.send(event);
    }
}
