//! Numeric conversions between index and wire types. Fragment sequence numbers and payload
//!  lengths are `u16` on the wire, pool indexes are `u32` in slot handles, and all of them
//!  are `usize` when indexing.

/// Narrowing conversion of a value that the caller has already range checked, e.g. a fragment
///  index below the configured maximum number of fragments. Panics if the check was wrong.
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

macro_rules! prechecked_cast {
    ($from:ty => $($to:ty),+) => {
        $(
            impl PrecheckedCast<$to> for $from {
                fn prechecked_cast(self) -> $to {
                    match <$to>::try_from(self) {
                        Ok(v) => v,
                        Err(_) => panic!("{} does not fit into {} - the range check before the cast is missing", self, stringify!($to)),
                    }
                }
            }
        )+
    }
}

prechecked_cast!(usize => u16, u32);

/// Widening conversion to `usize` for pool indexes
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prechecked_cast() {
        let seq: u16 = 17usize.prechecked_cast();
        assert_eq!(seq, 17);
        let index: u32 = 70_000usize.prechecked_cast();
        let widened: usize = index.safe_cast();
        assert_eq!(widened, 70_000);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_cast_out_of_range() {
        let _: u16 = 70_000usize.prechecked_cast();
    }
}
