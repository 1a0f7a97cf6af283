use std::sync::Arc;

use parking_lot::{lock_api::RawMutex, RawMutex as Lock};

use crate::{
    config::{MallocSpaceConfig, SlabConfig},
    error::SpaceError,
    forwarding::ForwardingTable,
    slab::{brackets::PAGE_SIZE, Allocation, SlabAllocator, ThreadLocalRuns},
    space::{
        BitmapPair, ContinuousAllocSpace, ContinuousSpace, GcRetentionPolicy, LocalBuffer,
        MallocSpace, ObjectBitmap, Space, SpaceKind,
    },
    statistics::ObjectBytePair,
    utils::{formatted_size, mmap::Protection},
};

/// Non-moving space managed by a [`SlabAllocator`]. Serves as promotion target and as the
/// fallback when a semi-space fills up during a copy.
pub struct RosAllocSpace {
    space: MallocSpace,
    slab: SlabAllocator,
    retention_policy: GcRetentionPolicy,
    forwarding: Option<ForwardingTable>,
    lock: Lock,
}

deref_impl!(RosAllocSpace; MallocSpace where space);

impl RosAllocSpace {
    pub fn create(
        name: &'static str,
        config: MallocSpaceConfig,
        slab_config: &SlabConfig,
        can_move_objects: bool,
    ) -> Result<Self, SpaceError> {
        let starting_size = PAGE_SIZE;
        let MallocSpaceConfig {
            mut initial_size,
            mut growth_limit,
            mut capacity,
        } = config;
        MallocSpace::validate_sizes(
            name,
            starting_size,
            &mut initial_size,
            &mut growth_limit,
            &mut capacity,
        )?;
        let slab = SlabAllocator::new(starting_size, initial_size, capacity, slab_config)?;
        let begin = slab.begin();
        let bitmaps = BitmapPair::create(name, begin, capacity)?;
        let forwarding = if can_move_objects {
            Some(
                ForwardingTable::create(begin, capacity).map_err(|source| {
                    SpaceError::Reserve {
                        name,
                        size: capacity,
                        source,
                    }
                })?,
            )
        } else {
            None
        };
        log::debug!(
            "{}: {:p}, initial size {}, growth limit {}, capacity {}",
            name,
            begin,
            formatted_size(initial_size),
            formatted_size(growth_limit),
            formatted_size(capacity)
        );
        let end = unsafe { begin.add(starting_size) };
        Ok(Self {
            space: MallocSpace::new(
                ContinuousAllocSpace::new(
                    ContinuousSpace::new(name, begin, end, unsafe { begin.add(capacity) }),
                    Some(bitmaps),
                ),
                growth_limit,
                can_move_objects,
                starting_size,
                initial_size,
            ),
            slab,
            retention_policy: GcRetentionPolicy::AlwaysCollect,
            forwarding,
            lock: Lock::INIT,
        })
    }

    /// Spaces with [`GcRetentionPolicy::NeverCollect`] or [`GcRetentionPolicy::FullCollect`]
    /// are treated as immune by minor collections.
    pub fn with_retention_policy(mut self, policy: GcRetentionPolicy) -> Self {
        self.retention_policy = policy;
        self
    }

    pub fn slab(&self) -> &SlabAllocator {
        &self.slab
    }

    fn bitmaps(&self) -> &BitmapPair {
        match self.space.bitmaps() {
            Some(bitmaps) => bitmaps,
            None => unreachable!("{} has no bitmaps", self.name()),
        }
    }

    /// Allocates `num_bytes`, lifting the footprint limit up to the growth limit if needed.
    /// The object is recorded as live.
    pub fn alloc_with_growth(&self, ctx: &ThreadLocalRuns, num_bytes: usize) -> Option<Allocation> {
        let result;
        self.lock.lock();
        let max_allowed = self.growth_limit();
        self.slab.set_footprint_limit(max_allowed);
        result = self.slab.alloc(ctx, num_bytes);
        let footprint = self.slab.footprint();
        self.slab.set_footprint_limit(footprint);
        unsafe {
            self.lock.unlock();
        }
        if let Some(allocation) = result {
            self.bitmaps().live().atomic_test_and_set(allocation.ptr.as_ptr());
        }
        result
    }

    /// Allocates without lifting the footprint limit. The object is recorded as live.
    pub fn alloc_object(&self, ctx: &ThreadLocalRuns, num_bytes: usize) -> Option<Allocation> {
        let result = self.slab.alloc(ctx, num_bytes)?;
        self.bitmaps().live().atomic_test_and_set(result.ptr.as_ptr());
        Some(result)
    }

    /// Frees `ptr` at once, without waiting for a collection.
    pub fn free(&self, ptr: *mut u8) -> usize {
        self.bitmaps().live().atomic_test_and_clear(ptr);
        self.slab.free(ptr)
    }

    pub fn attach_thread(&self) -> Arc<ThreadLocalRuns> {
        self.slab.attach_thread()
    }

    pub fn detach_thread(&self, ctx: &Arc<ThreadLocalRuns>) -> usize {
        self.slab.detach_thread(ctx)
    }

    /// Gives free pages at the end back to the OS and releases empty pages in between.
    pub fn trim(&self) -> usize {
        self.slab.trim();
        self.slab.release_pages()
    }

    /// Calls `visitor` for every live object.
    pub fn visit_live_objects(&self, visitor: impl FnMut(*mut u8)) {
        self.bitmaps()
            .live()
            .visit_marked_range(self.begin(), self.end(), visitor);
    }

    pub fn verify(&self) {
        self.slab.verify();
    }
}

impl Space for RosAllocSpace {
    fn name(&self) -> &'static str {
        self.space.name()
    }

    fn kind(&self) -> SpaceKind {
        SpaceKind::Slab
    }

    fn begin(&self) -> *mut u8 {
        self.space.begin()
    }

    /// End of the current footprint.
    fn end(&self) -> *mut u8 {
        unsafe { self.begin().add(self.slab.footprint()) }
    }

    fn limit(&self) -> *mut u8 {
        self.space.limit()
    }

    fn retention_policy(&self) -> GcRetentionPolicy {
        self.retention_policy
    }

    fn can_move_objects(&self) -> bool {
        self.space.can_move_objects()
    }

    fn live_bitmap(&self) -> Option<&ObjectBitmap> {
        self.space.live_bitmap()
    }

    fn mark_bitmap(&self) -> Option<&ObjectBitmap> {
        self.space.mark_bitmap()
    }

    fn bind_live_to_mark_bitmap(&self) {
        self.bitmaps().bind();
    }

    fn has_bound_bitmaps(&self) -> bool {
        self.bitmaps().is_bound()
    }

    fn unbind_bitmaps(&self) {
        self.bitmaps().unbind();
    }

    fn swap_bitmaps(&self) {
        self.bitmaps().swap();
    }

    fn clear_mark_bitmap(&self) {
        self.bitmaps().clear_mark();
    }

    fn alloc(&self, buffer: &LocalBuffer, size: usize) -> Option<Allocation> {
        match buffer {
            LocalBuffer::Runs(ctx) => self.slab.alloc(ctx, size),
            LocalBuffer::Shared => unreachable!("{} needs per-thread runs", self.name()),
        }
    }

    unsafe fn alloc_thread_unsafe(&self, size: usize) -> Option<Allocation> {
        self.slab.alloc_thread_unsafe(size)
    }

    fn attach_local_buffer(&self) -> LocalBuffer {
        LocalBuffer::Runs(self.slab.attach_thread())
    }

    fn revoke_local_buffer(&self, buffer: LocalBuffer) -> usize {
        match buffer {
            LocalBuffer::Runs(ctx) => self.slab.detach_thread(&ctx),
            LocalBuffer::Shared => 0,
        }
    }

    fn revoke_all_thread_local_buffers(&self) -> usize {
        self.slab.revoke_all_thread_local_runs()
    }

    fn bytes_allocated(&self) -> usize {
        self.slab.bytes_allocated()
    }

    fn objects_allocated(&self) -> usize {
        self.slab.objects_allocated()
    }

    fn sweep(&self, swap_bitmaps: bool) -> ObjectBytePair {
        let freed = self
            .space
            .sweep_range(self.begin(), self.end(), swap_bitmaps, |ptrs| {
                self.slab.bulk_free(ptrs)
            });
        if freed.objects != 0 {
            log::trace!(
                "{}: swept {} objects ({})",
                self.name(),
                freed.objects,
                formatted_size(freed.bytes as usize)
            );
        }
        freed
    }

    fn clear(&self) {
        if let Some(ref forwarding) = self.forwarding {
            forwarding.clear_range(self.begin(), self.end());
        }
        self.slab.reset();
        self.bitmaps().clear_all();
    }

    fn protect(&self, protection: Protection) {
        self.slab.mem_map().protect(protection);
    }

    fn forwarding_table(&self) -> Option<&ForwardingTable> {
        self.forwarding.as_ref()
    }
}
