use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of engine activity. They are updated without synchronization beyond the atomics
///  themselves, so a snapshot is not necessarily consistent across counters.
#[derive(Default)]
pub struct NetStats {
    pub fragments_sent: AtomicU64,
    pub fragments_received: AtomicU64,
    pub retransmissions: AtomicU64,
    pub acks_sent: AtomicU64,
    pub naks_sent: AtomicU64,
    pub naks_received: AtomicU64,
    pub duplicates: AtomicU64,
    pub out_of_window: AtomicU64,
    pub unknown_source: AtomicU64,
    pub pool_exhausted: AtomicU64,
    pub adapter_failures: AtomicU64,
    pub protocol_violations: AtomicU64,
    pub messages_delivered: AtomicU64,
    pub messages_undeliverable: AtomicU64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NetStatsSnapshot {
    pub fragments_sent: u64,
    pub fragments_received: u64,
    pub retransmissions: u64,
    pub acks_sent: u64,
    pub naks_sent: u64,
    pub naks_received: u64,
    pub duplicates: u64,
    pub out_of_window: u64,
    pub unknown_source: u64,
    pub pool_exhausted: u64,
    pub adapter_failures: u64,
    pub protocol_violations: u64,
    pub messages_delivered: u64,
    pub messages_undeliverable: u64,
}

impl NetStats {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NetStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        NetStatsSnapshot {
            fragments_sent: get(&self.fragments_sent),
            fragments_received: get(&self.fragments_received),
            retransmissions: get(&self.retransmissions),
            acks_sent: get(&self.acks_sent),
            naks_sent: get(&self.naks_sent),
            naks_received: get(&self.naks_received),
            duplicates: get(&self.duplicates),
            out_of_window: get(&self.out_of_window),
            unknown_source: get(&self.unknown_source),
            pool_exhausted: get(&self.pool_exhausted),
            adapter_failures: get(&self.adapter_failures),
            protocol_violations: get(&self.protocol_violations),
            messages_delivered: get(&self.messages_delivered),
            messages_undeliverable: get(&self.messages_undeliverable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = NetStats::default();
        NetStats::inc(&stats.naks_sent);
        NetStats::inc(&stats.naks_sent);
        NetStats::inc(&stats.duplicates);

        assert_eq!(stats.snapshot(), NetStatsSnapshot {
            naks_sent: 2,
            duplicates: 1,
            ..Default::default()
        });
    }
}
