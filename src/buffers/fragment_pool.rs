use std::sync::Mutex;

use bit_set::BitSet;
use tracing::{error, trace, warn};

use crate::buffers::fixed_buffer::FixedBuf;
use crate::error::{NetError, NetResult};
use crate::fragment::Fragment;
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// Identifies the pool slot a fragment was allocated from. The generation is bumped on every
///  release, so a stale or foreign slot is detected instead of corrupting the free list.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PoolSlot {
    index: u32,
    generation: u32,
}

/// A fixed number of fixed-size fragment buffers, allocated up front. There is no dynamic
///  growth: when all buffers are in use, allocation fails with [NetError::Exhausted], and
///  callers treat that as backpressure.
///
/// Every buffer has room for one adapter MTU. The first `header_reserve` bytes of each buffer
///  are reserved for the adapter's own header so the adapter can fill it in place.
pub struct FragmentPool {
    buffer_size: usize,
    header_reserve: usize,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    generations: Vec<u32>,
    in_use: BitSet,
    free: Vec<(u32, FixedBuf)>,
}

impl FragmentPool {
    pub fn new(num_buffers: usize, buffer_size: usize, header_reserve: usize) -> FragmentPool {
        assert!(header_reserve < buffer_size);

        let free = (0..num_buffers)
            .rev()
            .map(|i| {
                let index: u32 = i.prechecked_cast();
                (index, FixedBuf::new(buffer_size))
            })
            .collect();

        FragmentPool {
            buffer_size,
            header_reserve,
            inner: Mutex::new(PoolInner {
                generations: vec![0; num_buffers],
                in_use: BitSet::with_capacity(num_buffers),
                free,
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Returns a zeroed fragment, or [NetError::Exhausted] if the pool is empty
    pub fn allocate(&self) -> NetResult<Fragment> {
        let mut inner = self.inner.lock().unwrap();
        let Some((index, buf)) = inner.free.pop() else {
            warn!("fragment pool exhausted");
            return Err(NetError::Exhausted { resource: "fragment pool" });
        };

        let i: usize = index.safe_cast();
        inner.in_use.insert(i);
        let slot = PoolSlot {
            index,
            generation: inner.generations[i],
        };
        trace!("allocated fragment {:?}", slot);
        Ok(Fragment::from_pool(slot, buf, self.header_reserve))
    }

    pub fn release(&self, fragment: Fragment) {
        let (slot, mut buf) = fragment.into_parts();
        buf.reset();

        let mut inner = self.inner.lock().unwrap();
        let index: usize = slot.index.safe_cast();
        if index >= inner.generations.len() || !inner.in_use.contains(index) || inner.generations[index] != slot.generation {
            error!("released fragment {:?} does not belong to this pool - discarding it", slot);
            return;
        }

        inner.generations[index] = inner.generations[index].wrapping_add(1);
        inner.in_use.remove(index);
        inner.free.push((slot.index, buf));
        trace!("released fragment {:?}", slot);
    }

    pub fn release_all(&self, fragments: impl IntoIterator<Item=Fragment>) {
        for f in fragments {
            self.release(f);
        }
    }

    /// number of fragments that can currently be allocated
    pub fn available(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }
}
