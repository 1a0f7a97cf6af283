use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use atomic::Atomic;

use crate::{
    bitmap::SpaceBitmap,
    error::SpaceError,
    forwarding::ForwardingTable,
    slab::{Allocation, ThreadLocalRuns},
    statistics::ObjectBytePair,
    utils::{align_usize, mmap::Protection},
};

/// Every object starts on this boundary.
pub const OBJECT_ALIGNMENT: usize = 8;

pub type ObjectBitmap = SpaceBitmap<OBJECT_ALIGNMENT>;

/// Which collections may reclaim objects of a space.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcRetentionPolicy {
    /// Never reclaimed. Such spaces are immune and only scanned for references.
    NeverCollect,
    /// Collected by every cycle.
    AlwaysCollect,
    /// Only reclaimed by a collection that covers the whole heap. Immune otherwise.
    FullCollect,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SpaceKind {
    BumpPointer,
    Slab,
}

/// Per-worker allocation state used while copying objects in parallel.
pub enum LocalBuffer {
    /// The space is safe to allocate from concurrently as is.
    Shared,
    Runs(Arc<ThreadLocalRuns>),
}

/// Contiguous region of the heap the collector can copy into, scan or sweep.
///
/// All methods take `&self`: collector workers share spaces while copying. Methods changing
/// bitmaps or contents must only be called while the world is stopped and no worker is
/// running.
pub trait Space: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> SpaceKind;
    fn begin(&self) -> *mut u8;
    /// End of the part of the space currently in use.
    fn end(&self) -> *mut u8;
    fn limit(&self) -> *mut u8;

    fn has_address(&self, obj: *const u8) -> bool {
        obj >= self.begin() as *const u8 && obj < self.limit() as *const u8
    }

    fn retention_policy(&self) -> GcRetentionPolicy;
    fn can_move_objects(&self) -> bool;

    fn live_bitmap(&self) -> Option<&ObjectBitmap> {
        None
    }
    fn mark_bitmap(&self) -> Option<&ObjectBitmap> {
        None
    }
    /// Makes the mark bitmap an alias of the live bitmap, so that everything live counts as
    /// marked.
    fn bind_live_to_mark_bitmap(&self) {}
    fn has_bound_bitmaps(&self) -> bool {
        false
    }
    fn unbind_bitmaps(&self) {}
    fn swap_bitmaps(&self) {}
    fn clear_mark_bitmap(&self) {}

    /// Thread safe allocation through a worker's `buffer`.
    fn alloc(&self, buffer: &LocalBuffer, size: usize) -> Option<Allocation>;

    /// # Safety
    ///
    /// No other thread may allocate from this space concurrently.
    unsafe fn alloc_thread_unsafe(&self, size: usize) -> Option<Allocation>;

    fn attach_local_buffer(&self) -> LocalBuffer {
        LocalBuffer::Shared
    }
    /// Returns the free bytes left in `buffer`.
    fn revoke_local_buffer(&self, buffer: LocalBuffer) -> usize {
        let _ = buffer;
        0
    }
    fn revoke_all_thread_local_buffers(&self) -> usize {
        0
    }

    fn bytes_allocated(&self) -> usize;
    fn objects_allocated(&self) -> usize;

    /// Frees everything live but unmarked. With `swap_bitmaps` the roles of the two bitmaps
    /// are exchanged for the walk.
    fn sweep(&self, swap_bitmaps: bool) -> ObjectBytePair {
        let _ = swap_bitmaps;
        ObjectBytePair::default()
    }

    /// Drops every object and returns the memory to the OS.
    fn clear(&self);
    fn protect(&self, protection: Protection);

    /// Side table used when objects are evacuated out of this space.
    fn forwarding_table(&self) -> Option<&ForwardingTable> {
        None
    }
}

#[inline]
pub fn same_space(a: &dyn Space, b: &dyn Space) -> bool {
    a.begin() == b.begin() && a.limit() == b.limit()
}

/// Live and mark bitmap of a space.
///
/// Binding and swapping flip flags instead of moving bitmaps around.
pub struct BitmapPair {
    bitmaps: [ObjectBitmap; 2],
    live: AtomicUsize,
    bound: AtomicBool,
}

impl BitmapPair {
    pub fn create(
        name: &'static str,
        heap_begin: *mut u8,
        heap_capacity: usize,
    ) -> Result<Self, SpaceError> {
        let create = |bitmap_name| {
            ObjectBitmap::create(bitmap_name, heap_begin, heap_capacity)
                .map_err(|source| SpaceError::Bitmap { name, source })
        };
        Ok(Self {
            bitmaps: [create("live bitmap")?, create("mark bitmap")?],
            live: AtomicUsize::new(0),
            bound: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn live(&self) -> &ObjectBitmap {
        &self.bitmaps[self.live.load(Ordering::Relaxed)]
    }

    #[inline]
    pub fn mark(&self) -> &ObjectBitmap {
        if self.is_bound() {
            self.live()
        } else {
            &self.bitmaps[1 - self.live.load(Ordering::Relaxed)]
        }
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Relaxed)
    }

    pub fn bind(&self) {
        self.bound.store(true, Ordering::Relaxed);
    }

    pub fn unbind(&self) {
        self.bound.store(false, Ordering::Relaxed);
    }

    /// The mark bitmap becomes the live bitmap. Does nothing while bound.
    pub fn swap(&self) {
        if !self.is_bound() {
            self.live.fetch_xor(1, Ordering::Relaxed);
        }
    }

    pub fn clear_mark(&self) {
        if !self.is_bound() {
            self.mark().clear_all();
        }
    }

    pub fn clear_all(&self) {
        for bitmap in self.bitmaps.iter() {
            bitmap.clear_all();
        }
    }
}

#[repr(C)]
pub struct ContinuousSpace {
    name: &'static str,
    begin: *mut u8,
    pub(crate) end: Atomic<*mut u8>,
    limit: *mut u8,
}

unsafe impl Send for ContinuousSpace {}
unsafe impl Sync for ContinuousSpace {}

impl ContinuousSpace {
    pub fn new(name: &'static str, begin: *mut u8, end: *mut u8, limit: *mut u8) -> Self {
        Self {
            name,
            begin,
            end: Atomic::new(end),
            limit,
        }
    }

    #[inline]
    pub fn has_address(&self, obj: *const u8) -> bool {
        obj >= self.begin as *const u8 && obj < self.limit as *const u8
    }

    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.end.load(atomic::Ordering::Relaxed)
    }

    #[inline]
    pub fn begin(&self) -> *mut u8 {
        self.begin
    }

    #[inline]
    pub fn limit(&self) -> *mut u8 {
        self.limit
    }

    pub fn size(&self) -> usize {
        self.end() as usize - self.begin() as usize
    }

    pub fn set_end(&self, end: *mut u8) {
        self.end.store(end, atomic::Ordering::Relaxed);
    }

    pub fn capacity(&self) -> usize {
        self.limit() as usize - self.begin() as usize
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Continuous space that tracks its objects in a [`BitmapPair`].
pub struct ContinuousAllocSpace {
    space: ContinuousSpace,
    bitmaps: Option<BitmapPair>,
}

deref_impl!(ContinuousAllocSpace; ContinuousSpace where space);

impl ContinuousAllocSpace {
    pub fn new(space: ContinuousSpace, bitmaps: Option<BitmapPair>) -> Self {
        Self { space, bitmaps }
    }

    pub fn bitmaps(&self) -> Option<&BitmapPair> {
        self.bitmaps.as_ref()
    }

    pub fn live_bitmap(&self) -> Option<&ObjectBitmap> {
        self.bitmaps.as_ref().map(BitmapPair::live)
    }

    pub fn mark_bitmap(&self) -> Option<&ObjectBitmap> {
        self.bitmaps.as_ref().map(BitmapPair::mark)
    }

    /// Walks `begin..end` and hands every garbage object to `free` in batches. `free` returns
    /// the bytes it released.
    pub fn sweep_range(
        &self,
        begin: *mut u8,
        end: *mut u8,
        swap_bitmaps: bool,
        mut free: impl FnMut(&[*mut u8]) -> usize,
    ) -> ObjectBytePair {
        let mut freed = ObjectBytePair::default();
        let bitmaps = match self.bitmaps {
            Some(ref bitmaps) => bitmaps,
            None => return freed,
        };
        // Bound bitmaps mean nothing was marked separately, so nothing can be garbage.
        if bitmaps.is_bound() {
            return freed;
        }
        let (mut live, mut mark) = (bitmaps.live(), bitmaps.mark());
        if swap_bitmaps {
            std::mem::swap(&mut live, &mut mark);
        }
        ObjectBitmap::sweep_walk(live, mark, begin as usize, end as usize, |ptrs| {
            if !swap_bitmaps {
                for &ptr in ptrs {
                    live.clear(ptr);
                }
            }
            freed.objects += ptrs.len() as u64;
            freed.bytes += free(ptrs) as i64;
        });
        freed
    }
}

impl std::fmt::Debug for ContinuousAllocSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {:p}->{:p}(limit {:p})",
            self.name(),
            self.begin(),
            self.end(),
            self.limit()
        )
    }
}

/// Space backed by a general purpose allocator that can grow up to a limit.
pub struct MallocSpace {
    space: ContinuousAllocSpace,
    growth_limit: usize,
    can_move_objects: bool,
    starting_size: usize,
    initial_size: usize,
}

deref_impl!(MallocSpace; ContinuousAllocSpace where space);

impl MallocSpace {
    pub fn new(
        space: ContinuousAllocSpace,
        growth_limit: usize,
        can_move_objects: bool,
        starting_size: usize,
        initial_size: usize,
    ) -> Self {
        Self {
            space,
            growth_limit,
            can_move_objects,
            starting_size,
            initial_size,
        }
    }

    /// Page aligns the sizes and checks `starting_size <= initial_size <= growth_limit <=
    /// capacity`.
    pub fn validate_sizes(
        name: &'static str,
        starting_size: usize,
        initial_size: &mut usize,
        growth_limit: &mut usize,
        capacity: &mut usize,
    ) -> Result<(), SpaceError> {
        let page = crate::slab::brackets::PAGE_SIZE;
        *initial_size = align_usize(*initial_size, page).max(starting_size);
        *growth_limit = align_usize(*growth_limit, page);
        *capacity = align_usize(*capacity, page);
        if *capacity == 0 {
            return Err(SpaceError::EmptyCapacity { name });
        }
        if *initial_size > *growth_limit {
            return Err(SpaceError::InitialSizeTooLarge {
                name,
                initial_size: *initial_size,
                growth_limit: *growth_limit,
            });
        }
        if *growth_limit > *capacity {
            return Err(SpaceError::GrowthLimitTooLarge {
                name,
                growth_limit: *growth_limit,
                capacity: *capacity,
            });
        }
        Ok(())
    }

    /// Upper bound on the footprint while the growth limit is in effect.
    pub fn growth_limit(&self) -> usize {
        self.growth_limit
    }

    pub fn can_move_objects(&self) -> bool {
        self.can_move_objects
    }

    pub fn starting_size(&self) -> usize {
        self.starting_size
    }

    pub fn initial_size(&self) -> usize {
        self.initial_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{KB, MB};

    #[test]
    fn test_bitmap_pair_bind_and_swap() {
        let begin = 0x2000_0000 as *mut u8;
        let pair = BitmapPair::create("pair", begin, MB).unwrap();
        let obj = unsafe { begin.add(64) };
        pair.live().set(obj);
        assert!(!pair.mark().test(obj));

        pair.bind();
        assert!(pair.mark().test(obj));
        pair.swap();
        assert!(pair.live().test(obj));
        pair.unbind();

        pair.mark().set(unsafe { begin.add(128) });
        pair.swap();
        assert!(pair.live().test(unsafe { begin.add(128) }));
        assert!(!pair.live().test(obj));
        assert!(pair.mark().test(obj));
        pair.clear_mark();
        assert!(!pair.mark().test(obj));
    }

    #[test]
    fn test_validate_sizes() {
        let (mut initial, mut growth, mut capacity) = (KB, 4 * MB, 8 * MB);
        MallocSpace::validate_sizes("s", 4 * KB, &mut initial, &mut growth, &mut capacity)
            .unwrap();
        assert_eq!(initial, 4 * KB);

        let (mut initial, mut growth, mut capacity) = (8 * MB, 4 * MB, 8 * MB);
        assert!(matches!(
            MallocSpace::validate_sizes("s", 4 * KB, &mut initial, &mut growth, &mut capacity),
            Err(SpaceError::InitialSizeTooLarge { .. })
        ));
        let (mut initial, mut growth, mut capacity) = (MB, 16 * MB, 8 * MB);
        assert!(matches!(
            MallocSpace::validate_sizes("s", 4 * KB, &mut initial, &mut growth, &mut capacity),
            Err(SpaceError::GrowthLimitTooLarge { .. })
        ));
    }
}
