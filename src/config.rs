use std::time::Duration;
use anyhow::bail;

use crate::backoff::RetryBackoff;
use crate::wire::FragmentHeader;

/// Tunables of the reliable delivery engine. The MTU and the adapter's own header length are
///  properties of the active [crate::adapter::InterfaceAdapter] rather than configuration, so
///  they are passed separately where derived values depend on them.
#[derive(Clone, Debug)]
pub struct NetConfig {
    /// Size of the message id ring per channel. The sliding window is half of it (rounded up),
    ///  which keeps ids in the receiver's 'complete but undelivered' bitfield from aliasing.
    ///
    /// Must be a power of two between 2 and 32768.
    pub ring_size: usize,

    /// Upper bound on the number of fragments a single message may be split into. Together
    ///  with the adapter's MTU, this determines the maximum message length.
    pub max_fragments_per_message: u16,

    /// Number of retransmissions of an unacknowledged message before its destination is
    ///  declared unreachable (and CRASHED)
    pub max_retries: u32,
    /// Delay before the first retransmission
    pub retry_timeout: Duration,
    /// Factor by which the retry delay grows with each retransmission, in eighths: 8 keeps the
    ///  delay constant, 16 doubles it
    pub retry_backoff_factor_eighths: u32,
    pub max_retry_timeout: Duration,

    pub sweep_interval: Duration,

    /// Messages that stay incomplete for longer than this are abandoned, and their sender is
    ///  declared crashed. `None` means reassembly never times out.
    pub reassembly_timeout: Option<Duration>,

    /// Number of fragments in the pool. There is no dynamic growth: an empty pool is reported
    ///  to callers as [crate::error::NetError::Exhausted].
    pub fragment_pool_size: usize,

    /// Capacity of the node table, including the synthetic broadcast node. Power of two.
    pub node_table_capacity: usize,

    /// If true, acknowledgements for unicast messages are delayed so they can ride along with
    ///  the next data fragment to the same node, falling back to a standalone ACK at the next
    ///  maintenance sweep. If false, every delivery is acknowledged immediately.
    pub piggyback_unicast_acks: bool,
    /// Same for broadcast messages. There is no outgoing data stream to piggyback broadcast acks
    ///  on, so delaying them only batches them until the next sweep.
    pub piggyback_broadcast_acks: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            ring_size: 256,
            max_fragments_per_message: 10,
            max_retries: 5,
            retry_timeout: Duration::from_millis(200),
            retry_backoff_factor_eighths: 8,
            max_retry_timeout: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(50),
            reassembly_timeout: None,
            fragment_pool_size: 1024,
            node_table_capacity: 64,
            piggyback_unicast_acks: true,
            piggyback_broadcast_acks: false,
        }
    }
}

impl NetConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.ring_size.is_power_of_two() || self.ring_size < 2 || self.ring_size > 32768 {
            bail!("ring size must be a power of two between 2 and 32768, was {}", self.ring_size);
        }
        if self.max_fragments_per_message == 0 {
            bail!("a message must be allowed at least one fragment");
        }
        if self.fragment_pool_size < self.max_fragments_per_message as usize {
            bail!("fragment pool of {} cannot hold a single maximum-size message of {} fragments", self.fragment_pool_size, self.max_fragments_per_message);
        }
        if !self.node_table_capacity.is_power_of_two() || self.node_table_capacity < 2 {
            bail!("node table capacity must be a power of two >= 2, was {}", self.node_table_capacity);
        }
        if self.retry_backoff_factor_eighths < 8 {
            bail!("retry backoff must not shrink the retry delay");
        }
        if self.retry_timeout.is_zero() || self.sweep_interval.is_zero() {
            bail!("retry timeout and sweep interval must be positive");
        }
        if self.max_retry_timeout < self.retry_timeout {
            bail!("max retry timeout {:?} is below the initial retry timeout {:?}", self.max_retry_timeout, self.retry_timeout);
        }
        Ok(())
    }

    /// Checks that an adapter with the given MTU and header length leaves room for payload
    pub fn validate_for_adapter(&self, mtu: usize, adapter_header_len: usize) -> anyhow::Result<()> {
        if mtu <= adapter_header_len + FragmentHeader::SERIALIZED_LEN {
            bail!("adapter MTU {} leaves no room for payload after {} bytes of adapter header and {} bytes of fragment header", mtu, adapter_header_len, FragmentHeader::SERIALIZED_LEN);
        }
        if mtu - adapter_header_len - FragmentHeader::SERIALIZED_LEN > u16::MAX as usize {
            bail!("adapter MTU {} exceeds the fragment header's 16 bit payload length", mtu);
        }
        Ok(())
    }

    pub fn window_size(&self) -> u16 {
        self.ring_size.div_ceil(2) as u16
    }

    pub fn payload_per_fragment(mtu: usize, adapter_header_len: usize) -> usize {
        mtu - adapter_header_len - FragmentHeader::SERIALIZED_LEN
    }

    pub fn max_message_len(&self, mtu: usize, adapter_header_len: usize) -> usize {
        self.max_fragments_per_message as usize * Self::payload_per_fragment(mtu, adapter_header_len)
    }

    pub fn retry_backoff(&self) -> RetryBackoff {
        RetryBackoff::new(self.retry_timeout, self.retry_backoff_factor_eighths, self.max_retry_timeout)
    }
}
