use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign};

/// The id of a logical message within one Communication Channel. Ids are 16 bits on the wire
///  and wrap around, so all ordering is relative to some base id (typically the lower bound of
///  a window) and expressed as a wrapping forward distance.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct MessageId(u16);

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl MessageId {
    pub const ZERO: MessageId = MessageId(0);

    pub fn from_raw(value: u16) -> MessageId {
        MessageId(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> MessageId {
        MessageId(self.0.wrapping_add(1))
    }

    /// number of steps from `base` forward to `self`, with wrap-around
    pub fn distance_from(&self, base: MessageId) -> u16 {
        self.0.wrapping_sub(base.0)
    }

    /// true iff `self` is in `[base, base + window)`
    pub fn is_in_window(&self, base: MessageId, window: u16) -> bool {
        self.distance_from(base) < window
    }

    /// true iff `self` lies at most `window` steps *before* `base`, i.e. it was in some earlier
    ///  position of a window that has since moved past it
    pub fn is_recently_before(&self, base: MessageId, window: u16) -> bool {
        let behind = base.distance_from(*self);
        behind > 0 && behind <= window
    }

    /// index into a bitfield of `ring_size` bits - `ring_size` must be a power of two
    pub fn ring_slot(&self, ring_size: usize) -> usize {
        debug_assert!(ring_size.is_power_of_two());
        self.0 as usize & (ring_size - 1)
    }
}

impl Add<u16> for MessageId {
    type Output = MessageId;

    fn add(self, rhs: u16) -> Self::Output {
        MessageId(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u16> for MessageId {
    fn add_assign(&mut self, rhs: u16) {
        self.0 = self.0.wrapping_add(rhs);
    }
}
