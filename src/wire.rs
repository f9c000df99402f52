//! On-wire layout of fragments. All numbers are in network byte order (BE).
//!
//! ```ascii
//!  0: packet id (u16)       - message id within the channel; for NEGATIVE-ACK: the message
//!                              whose fragment is requested
//!  2: cumulative ack (u16)  - the sender's next expected id on the reverse channel, i.e. all
//!                              ids before it are acknowledged
//!  4: fragment seq (u16)    - position of the fragment in its message; for NEGATIVE-ACK: the
//!                              requested fragment
//!  6: payload length (u16)
//!  8: packet type (u16)     - see [PacketType]
//! 10: flags (u16)           - see [FragmentFlags]
//! 12: priority (u16)
//! 14: payload
//! ```
//!
//! Adapters may prepend their own header; the engine reserves room for it in every fragment
//!  buffer but never interprets it.

use anyhow::{anyhow, bail};
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::message_id::MessageId;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum PacketType {
    Data = 1,
    Ack = 2,
    BroadcastData = 3,
    BroadcastAck = 4,
    Bootstrap = 5,
    NegativeAck = 6,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct FragmentFlags: u16 {
        /// first fragment of a message
        const HEADER         = 0b0000_0001;
        /// this is not the last fragment of its message
        const MORE_FRAGMENTS = 0b0000_0010;
        const BROADCAST      = 0b0000_0100;
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FragmentHeader {
    pub packet_id: MessageId,
    pub cumulative_ack: MessageId,
    pub fragment_seq: u16,
    pub payload_len: u16,
    pub packet_type: PacketType,
    pub flags: FragmentFlags,
    pub priority: u16,
}

impl FragmentHeader {
    pub const SERIALIZED_LEN: usize = 7 * size_of::<u16>();

    /// header for a control fragment without payload
    pub fn control(packet_type: PacketType, packet_id: MessageId, cumulative_ack: MessageId, fragment_seq: u16, priority: u16) -> FragmentHeader {
        FragmentHeader {
            packet_id,
            cumulative_ack,
            fragment_seq,
            payload_len: 0,
            packet_type,
            flags: FragmentFlags::empty(),
            priority,
        }
    }

    pub fn is_first(&self) -> bool {
        self.flags.contains(FragmentFlags::HEADER)
    }

    pub fn has_more_fragments(&self) -> bool {
        self.flags.contains(FragmentFlags::MORE_FRAGMENTS)
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags.contains(FragmentFlags::BROADCAST)
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.packet_id.to_raw());
        buf.put_u16(self.cumulative_ack.to_raw());
        buf.put_u16(self.fragment_seq);
        buf.put_u16(self.payload_len);
        buf.put_u16(self.packet_type.into());
        buf.put_u16(self.flags.bits());
        buf.put_u16(self.priority);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FragmentHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("fragment of {} bytes is shorter than the fragment header", buf.remaining());
        }

        let packet_id = MessageId::from_raw(buf.get_u16());
        let cumulative_ack = MessageId::from_raw(buf.get_u16());
        let fragment_seq = buf.get_u16();
        let payload_len = buf.get_u16();
        let raw_type = buf.get_u16();
        let packet_type = PacketType::try_from(raw_type)
            .map_err(|_| anyhow!("unknown packet type {}", raw_type))?;
        let raw_flags = buf.get_u16();
        let flags = FragmentFlags::from_bits(raw_flags)
            .ok_or_else(|| anyhow!("unsupported flags {:04x}", raw_flags))?;
        let priority = buf.get_u16();

        Ok(FragmentHeader {
            packet_id,
            cumulative_ack,
            fragment_seq,
            payload_len,
            packet_type,
            flags,
            priority,
        })
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BootstrapKind {
    /// a node announces itself, typically after (re)starting
    Announce = 0,
    /// answer to an announcement, telling the announcing node about the responder
    Reply = 1,
}

/// Payload of a BOOTSTRAP fragment.
///
/// ```ascii
/// 0: kind (u8)
/// 1: incarnation (varint u64) - changes whenever the sending process restarts
/// *: broadcast next id (u16)  - the id the sender will use for its next broadcast message, so
///                                the receiver can position its broadcast receive window
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootstrapMessage {
    pub kind: BootstrapKind,
    pub incarnation: u64,
    pub broadcast_next_id: MessageId,
}

impl BootstrapMessage {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind.into());
        buf.put_u64_varint(self.incarnation);
        buf.put_u16(self.broadcast_next_id.to_raw());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<BootstrapMessage> {
        if !buf.has_remaining() {
            bail!("empty bootstrap message");
        }
        let raw_kind = buf.get_u8();
        let kind = BootstrapKind::try_from(raw_kind)
            .map_err(|_| anyhow!("unknown bootstrap kind {}", raw_kind))?;
        let incarnation = buf.try_get_u64_varint()
            .map_err(|e| anyhow!("invalid incarnation: {:?}", e))?;
        if buf.remaining() < size_of::<u16>() {
            bail!("bootstrap message is missing the broadcast id");
        }
        let broadcast_next_id = MessageId::from_raw(buf.get_u16());

        Ok(BootstrapMessage {
            kind,
            incarnation,
            broadcast_next_id,
        })
    }
}
