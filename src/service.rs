use std::fmt::{Display, Formatter};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::error::{NetError, NetResult};
use crate::node_id::NodeId;

/// Identifies the service a message is addressed to. It is transmitted as the first two bytes
///  (BE) of every message.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ServiceType(pub u16);

impl ServiceType {
    pub const HEADER_LEN: usize = size_of::<u16>();

    pub fn of_message(data: &[u8]) -> Option<ServiceType> {
        if data.len() < Self::HEADER_LEN {
            return None;
        }
        Some(ServiceType(u16::from_be_bytes([data[0], data[1]])))
    }
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceivedMessage {
    pub source: NodeId,
    pub is_broadcast: bool,
    pub service_type: ServiceType,
    pub priority: u16,
    /// the complete message, including the service type
    pub data: Vec<u8>,
}

impl ReceivedMessage {
    /// the message without the service type
    pub fn body(&self) -> &[u8] {
        &self.data[ServiceType::HEADER_LEN..]
    }
}

/// A consumer of messages of one service type. Each registered handler is called from a
///  dedicated worker task, one message at a time, in the order of delivery.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    async fn on_message(&self, message: ReceivedMessage);
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceInfo {
    pub service_type: ServiceType,
    /// recorded for higher-level scheduling, not enforced by the engine
    pub task_priority: u16,
    /// priority of acknowledgements for messages delivered to this service
    pub network_priority: u16,
    pub is_up: bool,
}

struct ServiceEntry {
    info: ServiceInfo,
    queue: mpsc::UnboundedSender<ReceivedMessage>,
    worker: JoinHandle<()>,
}

/// Registered services and their private queues. The queues decouple handlers from the
///  protocol: a slow handler does not hold up acknowledgement processing.
pub struct ServiceRegistry {
    services: RwLock<FxHashMap<ServiceType, ServiceEntry>>,
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        if let Ok(services) = self.services.read() {
            for entry in services.values() {
                entry.worker.abort();
            }
        }
    }
}

impl ServiceRegistry {
    pub fn new() -> ServiceRegistry {
        ServiceRegistry {
            services: Default::default(),
        }
    }

    /// Registers a handler and spawns its worker task. The service starts out down: messages
    ///  for it are discarded until it is marked up.
    pub fn register(&self, service_type: ServiceType, handler: Arc<dyn ServiceHandler>, task_priority: u16, network_priority: u16) -> NetResult<()> {
        let mut services = self.services.write().unwrap();
        if services.contains_key(&service_type) {
            return Err(NetError::invalid_argument(format!("service {} is already registered", service_type)));
        }

        let (queue, mut receiver) = mpsc::unbounded_channel::<ReceivedMessage>();
        let worker = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                trace!("service {}: handling message from {}", message.service_type, message.source);
                handler.on_message(message).await;
            }
        });

        info!("registered service {}", service_type);
        services.insert(service_type, ServiceEntry {
            info: ServiceInfo {
                service_type,
                task_priority,
                network_priority,
                is_up: false,
            },
            queue,
            worker,
        });
        Ok(())
    }

    pub fn set_up(&self, service_type: ServiceType, is_up: bool) -> NetResult<()> {
        let mut services = self.services.write().unwrap();
        let Some(entry) = services.get_mut(&service_type) else {
            return Err(NetError::invalid_argument(format!("service {} is not registered", service_type)));
        };
        info!("service {} is {}", service_type, if is_up { "up" } else { "down" });
        entry.info.is_up = is_up;
        Ok(())
    }

    /// Queues a message for its service. Returns the service's network priority if the
    ///  message was queued, or `None` if there is no service to take it.
    pub fn dispatch(&self, message: ReceivedMessage) -> Option<u16> {
        let services = self.services.read().unwrap();
        match services.get(&message.service_type) {
            Some(entry) if entry.info.is_up => {
                let network_priority = entry.info.network_priority;
                match entry.queue.send(message) {
                    Ok(_) => Some(network_priority),
                    Err(_) => None,
                }
            }
            _ => {
                debug!("no service {} is up - discarding message from {}", message.service_type, message.source);
                None
            }
        }
    }

    pub fn services(&self) -> Vec<ServiceInfo> {
        let mut result = self.services.read().unwrap()
            .values()
            .map(|e| e.info.clone())
            .collect::<Vec<_>>();
        result.sort_by_key(|s| s.service_type);
        result
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::runtime::Builder;
    use super::*;

    fn message(service: u16, body: &[u8]) -> ReceivedMessage {
        let mut data = service.to_be_bytes().to_vec();
        data.extend_from_slice(body);
        ReceivedMessage {
            source: NodeId::new(4),
            is_broadcast: false,
            service_type: ServiceType(service),
            priority: 0,
            data,
        }
    }

    #[rstest]
    #[case::empty(vec![], None)]
    #[case::one_byte(vec![1], None)]
    #[case::header_only(vec![1, 2], Some(ServiceType(258)))]
    #[case::with_body(vec![0, 7, 9, 9], Some(ServiceType(7)))]
    fn test_of_message(#[case] data: Vec<u8>, #[case] expected: Option<ServiceType>) {
        assert_eq!(ServiceType::of_message(&data), expected);
    }

    #[test]
    fn test_dispatch_in_order() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut handler = MockServiceHandler::new();
            handler.expect_on_message()
                .times(2)
                .returning(move |m| { tx.send(m).unwrap(); });

            let registry = ServiceRegistry::new();
            registry.register(ServiceType(3), Arc::new(handler), 1, 9).unwrap();

            assert_eq!(registry.dispatch(message(3, b"down")), None);

            registry.set_up(ServiceType(3), true).unwrap();
            assert_eq!(registry.dispatch(message(3, b"a")), Some(9));
            assert_eq!(registry.dispatch(message(3, b"b")), Some(9));
            assert_eq!(registry.dispatch(message(4, b"unknown")), None);

            assert_eq!(rx.recv().await.unwrap().body(), b"a");
            assert_eq!(rx.recv().await.unwrap().body(), b"b");

            registry.set_up(ServiceType(3), false).unwrap();
            assert_eq!(registry.dispatch(message(3, b"down again")), None);
        });
    }

    #[test]
    fn test_register() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build().unwrap();
        rt.block_on(async {
            let registry = ServiceRegistry::new();
            registry.register(ServiceType(3), Arc::new(MockServiceHandler::new()), 1, 2).unwrap();
            registry.register(ServiceType(1), Arc::new(MockServiceHandler::new()), 3, 4).unwrap();
            assert!(matches!(
                registry.register(ServiceType(3), Arc::new(MockServiceHandler::new()), 1, 2),
                Err(NetError::InvalidArgument { .. })));
            assert!(registry.set_up(ServiceType(5), true).is_err());

            assert_eq!(registry.services(), vec![
                ServiceInfo { service_type: ServiceType(1), task_priority: 3, network_priority: 4, is_up: false },
                ServiceInfo { service_type: ServiceType(3), task_priority: 1, network_priority: 2, is_up: false },
            ]);
        });
    }
}
