use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::message_id::MessageId;
use crate::net_layer::NetLayer;
use crate::node_db::NodeDatabase;
use crate::node_id::NodeId;
use crate::stats::NetStats;

impl NetLayer {
    /// Runs the maintenance sweep periodically until the returned task is aborted
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let net_layer = self.clone();
        tokio::spawn(async move {
            net_layer.run_maintenance_loop().await
        })
    }

    pub async fn run_maintenance_loop(&self) {
        let mut ticks = interval(self.config.sweep_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            self.run_maintenance_sweep().await;
        }
    }

    /// One pass over the node database: flushes delayed acknowledgements, times out sends
    ///  waiting for a window slot, retransmits unacknowledged messages (declaring nodes crashed
    ///  when retries are exhausted), and abandons messages stuck in reassembly.
    pub async fn run_maintenance_sweep(&self) {
        let now = Instant::now();
        let mut db = self.db.lock().await;

        self.flush_delayed_acks(&mut db).await;
        db.expire_window_waiters(now, &self.pool);

        let mut to_crash = self.retransmit_overdue(&mut db, now).await;
        to_crash.extend(self.expire_reassembly(&mut db, now));

        for node in to_crash {
            db.declare_crashed(node, &self.pool, &self.hooks);
        }
    }

    async fn flush_delayed_acks(&self, db: &mut NodeDatabase) {
        for node in db.peers_mut().filter(|n| n.state.is_alive()) {
            if node.unicast.receive.delayed_ack {
                self.send_ack(node.id, false, &mut node.unicast.receive).await;
            }
            if node.broadcast.receive.delayed_ack {
                self.send_ack(node.id, true, &mut node.broadcast.receive).await;
            }
        }
    }

    /// returns the nodes that exhausted their retries
    async fn retransmit_overdue(&self, db: &mut NodeDatabase, now: Instant) -> Vec<NodeId> {
        let mut exhausted = Vec::new();

        for node in db.peers_mut().filter(|n| n.state.is_alive()) {
            let ack = node.unicast.receive.next_expected();
            for envelope in node.unicast.send.awaiting_ack.iter_mut() {
                let transmission = &mut envelope.transmission;
                if transmission.next_retry_at > now {
                    continue;
                }
                if transmission.retries >= self.config.max_retries {
                    warn!("message {} to {} is unacknowledged after {} retries - node is unreachable", envelope.id, node.id, transmission.retries);
                    exhausted.push(node.id);
                    break;
                }

                transmission.retries += 1;
                transmission.next_retry_at = now + self.backoff.delay(transmission.retries);
                debug!("retransmitting message {} to {} (retry #{})", envelope.id, node.id, transmission.retries);
                NetStats::inc(&self.stats.retransmissions);
                node.unicast.receive.delayed_ack = false;
                let _ = self.transmit(node.id, envelope, ack).await;
            }
        }

        for envelope in db.broadcast_window_mut().awaiting_ack.iter_mut() {
            let transmission = &mut envelope.transmission;
            if transmission.next_retry_at > now {
                continue;
            }
            if transmission.retries >= self.config.max_retries {
                warn!("broadcast {} is unacknowledged after {} retries by nodes {:?}", envelope.id, transmission.retries, transmission.outstanding);
                exhausted.extend(transmission.outstanding.iter().copied());
                continue;
            }

            transmission.retries += 1;
            transmission.next_retry_at = now + self.backoff.delay(transmission.retries);
            debug!("retransmitting broadcast {} (retry #{})", envelope.id, transmission.retries);
            NetStats::inc(&self.stats.retransmissions);
            let _ = self.transmit(NodeId::BROADCAST, envelope, MessageId::ZERO).await;
        }

        exhausted
    }

    /// returns the nodes that sent messages which did not complete in time
    fn expire_reassembly(&self, db: &mut NodeDatabase, now: Instant) -> Vec<NodeId> {
        let Some(timeout) = self.config.reassembly_timeout else {
            return vec![];
        };

        let mut result = Vec::new();
        for node in db.peers_mut().filter(|n| n.state.is_alive()) {
            let mut expired = node.unicast.receive.expire_reassembly(now, timeout, &self.pool);
            expired.extend(node.broadcast.receive.expire_reassembly(now, timeout, &self.pool));
            if !expired.is_empty() {
                warn!("messages {:?} from {} did not complete within {:?}", expired, node.id, timeout);
                result.push(node.id);
            }
        }
        result
    }
}
