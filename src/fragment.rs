use anyhow::bail;
use bytes::BufMut;

use crate::buffers::fixed_buffer::FixedBuf;
use crate::buffers::fragment_pool::{FragmentPool, PoolSlot};
use crate::error::{NetError, NetResult};
use crate::message_id::MessageId;
use crate::safe_converter::PrecheckedCast;
use crate::wire::{FragmentFlags, FragmentHeader, PacketType};

/// One wire-sized chunk of a message, backed by a pooled buffer. The buffer holds the
///  adapter's reserved header region, the fragment header and the payload, in that order, so
///  [Fragment::encode] can hand the complete packet to the adapter without copying.
///
/// The header is kept in structured form and serialized into the buffer on encoding.
#[derive(Debug)]
pub struct Fragment {
    slot: PoolSlot,
    pub header: FragmentHeader,
    buf: FixedBuf,
    header_offset: usize,
}

impl Fragment {
    pub(crate) fn from_pool(slot: PoolSlot, mut buf: FixedBuf, header_offset: usize) -> Fragment {
        buf.set_len(header_offset + FragmentHeader::SERIALIZED_LEN);
        Fragment {
            slot,
            header: FragmentHeader {
                packet_id: MessageId::ZERO,
                cumulative_ack: MessageId::ZERO,
                fragment_seq: 0,
                payload_len: 0,
                packet_type: PacketType::Data,
                flags: FragmentFlags::empty(),
                priority: 0,
            },
            buf,
            header_offset,
        }
    }

    pub(crate) fn into_parts(self) -> (PoolSlot, FixedBuf) {
        (self.slot, self.buf)
    }

    pub fn slot(&self) -> PoolSlot {
        self.slot
    }

    fn payload_offset(&self) -> usize {
        self.header_offset + FragmentHeader::SERIALIZED_LEN
    }

    pub fn payload_capacity(&self) -> usize {
        self.buf.capacity() - self.payload_offset()
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf.as_ref()[self.payload_offset()..]
    }

    pub fn set_payload(&mut self, data: &[u8]) {
        assert!(data.len() <= self.payload_capacity());
        self.buf.set_len(self.payload_offset());
        self.buf.put_slice(data);
        self.header.payload_len = data.len().prechecked_cast();
    }

    /// Serializes the header into the buffer and returns the complete packet, starting with
    ///  the region reserved for the adapter's header
    pub fn encode(&mut self) -> &mut [u8] {
        let (start, end) = (self.header_offset, self.payload_offset());
        let mut target = &mut self.buf.as_mut()[start..end];
        self.header.ser(&mut target);
        self.buf.as_mut()
    }

    /// Fills this fragment from a packet received off the wire. `packet` starts with the
    ///  fragment header, i.e. the adapter has already stripped its own header.
    pub fn decode_from(&mut self, packet: &[u8]) -> anyhow::Result<()> {
        if packet.len() > self.buf.capacity() - self.header_offset {
            bail!("packet of {} bytes exceeds the MTU", packet.len());
        }

        let (header, _) = parse_packet(packet)?;

        self.buf.set_len(self.header_offset);
        self.buf.put_slice(packet);
        self.header = header;
        Ok(())
    }
}

/// Splits a received packet into its fragment header and payload, checking the header's
///  payload length against the actual payload
pub fn parse_packet(packet: &[u8]) -> anyhow::Result<(FragmentHeader, &[u8])> {
    let mut payload = packet;
    let header = FragmentHeader::deser(&mut payload)?;
    if header.payload_len as usize != payload.len() {
        bail!("payload length {} in header does not match the actual payload length {}", header.payload_len, payload.len());
    }
    Ok((header, payload))
}

/// number of fragments for a message of `len` bytes
pub fn fragment_count(len: usize, payload_per_fragment: usize) -> usize {
    len.div_ceil(payload_per_fragment)
}

pub fn fragment_flags(fragment_seq: usize, num_fragments: usize, is_broadcast: bool) -> FragmentFlags {
    let mut result = FragmentFlags::empty();
    if fragment_seq == 0 {
        result |= FragmentFlags::HEADER;
    }
    if fragment_seq + 1 < num_fragments {
        result |= FragmentFlags::MORE_FRAGMENTS;
    }
    if is_broadcast {
        result |= FragmentFlags::BROADCAST;
    }
    result
}

/// Splits a message into pooled fragments, with sequence numbers, flags, payload and priority
///  set. Message id and cumulative ack are stamped later when the message is admitted into the
///  send window.
///
/// All or nothing: if the pool runs out, the fragments allocated so far are released again.
pub fn fragment_message(
    pool: &FragmentPool,
    data: &[u8],
    payload_per_fragment: usize,
    max_fragments: u16,
    is_broadcast: bool,
    priority: u16,
) -> NetResult<Vec<Fragment>> {
    let num_fragments = fragment_count(data.len(), payload_per_fragment);
    if num_fragments > max_fragments as usize {
        return Err(NetError::invalid_argument(format!(
            "message of {} bytes needs {} fragments, the maximum is {}", data.len(), num_fragments, max_fragments)));
    }

    let packet_type = if is_broadcast { PacketType::BroadcastData } else { PacketType::Data };

    let mut result = Vec::with_capacity(num_fragments);
    for (seq, chunk) in data.chunks(payload_per_fragment).enumerate() {
        let mut fragment = match pool.allocate() {
            Ok(f) => f,
            Err(e) => {
                pool.release_all(result);
                return Err(e);
            }
        };
        fragment.set_payload(chunk);
        fragment.header.packet_type = packet_type;
        fragment.header.fragment_seq = seq.prechecked_cast();
        fragment.header.flags = fragment_flags(seq, num_fragments, is_broadcast);
        fragment.header.priority = priority;
        result.push(fragment);
    }
    Ok(result)
}

/// Concatenates the payloads of a message's fragments, which must be in sequence order
pub fn reassemble<'a>(fragments: impl IntoIterator<Item=&'a Fragment>) -> Vec<u8> {
    let mut result = Vec::new();
    for f in fragments {
        result.extend_from_slice(f.payload());
    }
    result
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    const PAYLOAD: usize = 50;

    fn pool() -> FragmentPool {
        // 4 bytes adapter header, 14 bytes fragment header, 50 bytes payload
        FragmentPool::new(20, 68, 4)
    }

    #[rstest]
    #[case::empty(0, 0)]
    #[case::one_byte(1, 1)]
    #[case::almost_one(PAYLOAD - 1, 1)]
    #[case::exactly_one(PAYLOAD, 1)]
    #[case::just_above_one(PAYLOAD + 1, 2)]
    #[case::three(3 * PAYLOAD - 7, 3)]
    #[case::max(10 * PAYLOAD, 10)]
    fn test_fragment_reassemble_round_trip(#[case] len: usize, #[case] expected_fragments: usize) {
        let pool = pool();
        let data = (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>();

        let fragments = fragment_message(&pool, &data, PAYLOAD, 10, false, 3).unwrap();
        assert_eq!(fragments.len(), expected_fragments);
        assert_eq!(fragments.len(), fragment_count(len, PAYLOAD));

        for (i, f) in fragments.iter().enumerate() {
            assert_eq!(f.header.fragment_seq as usize, i);
            assert_eq!(f.header.payload_len as usize, f.payload().len());
            assert_eq!(f.header.priority, 3);
            assert_eq!(f.header.packet_type, PacketType::Data);
            assert_eq!(f.header.is_first(), i == 0);
            assert_eq!(f.header.has_more_fragments(), i + 1 < expected_fragments);
        }

        assert_eq!(reassemble(&fragments), data);

        pool.release_all(fragments);
        assert_eq!(pool.available(), 20);
    }

    #[rstest]
    #[case::single(0, 1, false, FragmentFlags::HEADER)]
    #[case::first_of_many(0, 3, false, FragmentFlags::HEADER | FragmentFlags::MORE_FRAGMENTS)]
    #[case::middle(1, 3, false, FragmentFlags::MORE_FRAGMENTS)]
    #[case::last(2, 3, false, FragmentFlags::empty())]
    #[case::broadcast_last(2, 3, true, FragmentFlags::BROADCAST)]
    #[case::broadcast_single(0, 1, true, FragmentFlags::HEADER | FragmentFlags::BROADCAST)]
    fn test_fragment_flags(#[case] seq: usize, #[case] num: usize, #[case] is_broadcast: bool, #[case] expected: FragmentFlags) {
        assert_eq!(fragment_flags(seq, num, is_broadcast), expected);
    }

    #[test]
    fn test_fragment_message_too_long() {
        let pool = pool();
        let data = vec![1u8; 10 * PAYLOAD + 1];
        match fragment_message(&pool, &data, PAYLOAD, 10, false, 0) {
            Err(NetError::InvalidArgument { .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pool.available(), 20);
    }

    #[test]
    fn test_fragment_message_pool_exhausted() {
        let pool = FragmentPool::new(2, 68, 4);
        let data = vec![1u8; 3 * PAYLOAD];
        assert_eq!(fragment_message(&pool, &data, PAYLOAD, 10, true, 0).err(), Some(NetError::Exhausted { resource: "fragment pool" }));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_encode_decode() {
        let pool = pool();
        let mut fragment = pool.allocate().unwrap();
        fragment.set_payload(b"hello");
        fragment.header.packet_id = MessageId::from_raw(7);
        fragment.header.cumulative_ack = MessageId::from_raw(2);
        fragment.header.flags = FragmentFlags::HEADER;

        let packet = fragment.encode().to_vec();
        assert_eq!(packet.len(), 4 + 14 + 5);
        assert_eq!(&packet[..4], &[0, 0, 0, 0]);
        assert_eq!(&packet[4..6], &[0, 7]);
        assert_eq!(&packet[18..], b"hello");

        let (header, payload) = parse_packet(&packet[4..]).unwrap();
        assert_eq!(header, fragment.header);
        assert_eq!(payload, b"hello");

        let mut received = pool.allocate().unwrap();
        received.decode_from(&packet[4..]).unwrap();
        assert_eq!(received.header, fragment.header);
        assert_eq!(received.payload(), b"hello");
    }

    #[rstest]
    #[case::length_mismatch(vec![0,1, 0,0, 0,0, 0,3, 0,1, 0,1, 0,0, 1,2])]
    #[case::truncated_header(vec![0,1, 0,0, 0,0])]
    #[case::too_long(vec![0; 70])]
    fn test_decode_rejects(#[case] packet: Vec<u8>) {
        let pool = pool();
        let mut fragment = pool.allocate().unwrap();
        assert!(fragment.decode_from(&packet).is_err());
    }
}
