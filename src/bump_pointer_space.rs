use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    api::{ObjectModel, ObjectRef},
    error::SpaceError,
    forwarding::ForwardingTable,
    slab::Allocation,
    space::{
        ContinuousAllocSpace, ContinuousSpace, GcRetentionPolicy, LocalBuffer, Space, SpaceKind,
        OBJECT_ALIGNMENT,
    },
    utils::{align_usize, mmap::{Mmap, Protection}},
};

/// Semi-space half: objects are laid out back to back and only ever freed all at once.
pub struct BumpPointerSpace {
    space: ContinuousAllocSpace,
    mem_map: Mmap,
    objects_allocated: AtomicUsize,
    forwarding: ForwardingTable,
}

deref_impl!(BumpPointerSpace; ContinuousAllocSpace where space);

impl BumpPointerSpace {
    pub fn create(name: &'static str, capacity: usize) -> Result<Self, SpaceError> {
        let capacity = align_usize(capacity, crate::slab::brackets::PAGE_SIZE);
        if capacity == 0 {
            return Err(SpaceError::EmptyCapacity { name });
        }
        let mem_map = Mmap::new(capacity).map_err(|source| SpaceError::Reserve {
            name,
            size: capacity,
            source,
        })?;
        let begin = mem_map.start();
        let forwarding =
            ForwardingTable::create(begin, capacity).map_err(|source| SpaceError::Reserve {
                name,
                size: capacity,
                source,
            })?;
        log::debug!("{}: {:p}-{:p}", name, begin, mem_map.end());
        Ok(Self {
            space: ContinuousAllocSpace::new(
                ContinuousSpace::new(name, begin, begin, mem_map.end()),
                None,
            ),
            mem_map,
            objects_allocated: AtomicUsize::new(0),
            forwarding,
        })
    }

    #[inline]
    pub fn bump_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let size = align_usize(size, OBJECT_ALIGNMENT);
        let mut old = self.space.end.load(atomic::Ordering::Relaxed);
        loop {
            let new = (old as usize).checked_add(size)?;
            if new > self.limit() as usize {
                return None;
            }
            match self.space.end.compare_exchange_weak(
                old,
                new as *mut u8,
                atomic::Ordering::SeqCst,
                atomic::Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => old = x,
            }
        }
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        NonNull::new(old)
    }

    /// # Safety
    ///
    /// No other thread may allocate from this space concurrently.
    #[inline]
    pub unsafe fn thread_bump_alloc_unsafe(&self, size: usize) -> Option<NonNull<u8>> {
        let size = align_usize(size, OBJECT_ALIGNMENT);
        let old = self.end();
        let new = (old as usize).checked_add(size)?;
        if new > self.limit() as usize {
            return None;
        }
        self.space.end.store(new as *mut u8, atomic::Ordering::Release);
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        NonNull::new(old)
    }

    /// Calls `visitor` on every object from the beginning of the space up to its end.
    pub fn walk(&self, model: &dyn ObjectModel, mut visitor: impl FnMut(ObjectRef)) {
        let end = self.end() as usize;
        let mut scan = self.begin() as usize;
        while scan < end {
            let obj = scan as ObjectRef;
            let size = align_usize(model.size_of(obj), OBJECT_ALIGNMENT);
            assert!(size != 0, "object {:p} reports a zero size", obj);
            visitor(obj);
            scan += size;
        }
    }

    pub fn mem_map(&self) -> &Mmap {
        &self.mem_map
    }

    fn allocation(ptr: NonNull<u8>, size: usize) -> Allocation {
        let size = align_usize(size, OBJECT_ALIGNMENT);
        Allocation {
            ptr,
            bytes_allocated: size,
            usable_size: size,
            bytes_tl_bulk_allocated: size,
        }
    }
}

impl Space for BumpPointerSpace {
    fn name(&self) -> &'static str {
        self.space.name()
    }

    fn kind(&self) -> SpaceKind {
        SpaceKind::BumpPointer
    }

    fn begin(&self) -> *mut u8 {
        self.space.begin()
    }

    fn end(&self) -> *mut u8 {
        self.space.end()
    }

    fn limit(&self) -> *mut u8 {
        self.space.limit()
    }

    fn retention_policy(&self) -> GcRetentionPolicy {
        GcRetentionPolicy::AlwaysCollect
    }

    fn can_move_objects(&self) -> bool {
        true
    }

    fn alloc(&self, _buffer: &LocalBuffer, size: usize) -> Option<Allocation> {
        self.bump_alloc(size).map(|ptr| Self::allocation(ptr, size))
    }

    unsafe fn alloc_thread_unsafe(&self, size: usize) -> Option<Allocation> {
        self.thread_bump_alloc_unsafe(size)
            .map(|ptr| Self::allocation(ptr, size))
    }

    fn bytes_allocated(&self) -> usize {
        self.space.size()
    }

    fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    fn clear(&self) {
        let used = self.space.size();
        self.forwarding.clear_range(self.begin(), self.end());
        self.mem_map.dontneed(self.begin(), align_usize(used, crate::slab::brackets::PAGE_SIZE));
        self.space.set_end(self.begin());
        self.objects_allocated.store(0, Ordering::Relaxed);
    }

    fn protect(&self, protection: Protection) {
        self.mem_map.protect(protection);
    }

    fn forwarding_table(&self) -> Option<&ForwardingTable> {
        Some(&self.forwarding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::KB;

    #[test]
    fn test_bump_alloc_and_clear() {
        let space = BumpPointerSpace::create("bump", 64 * KB).unwrap();
        let a = space.bump_alloc(20).unwrap();
        let b = space.bump_alloc(8).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 24);
        assert_eq!(space.bytes_allocated(), 32);
        assert_eq!(space.objects_allocated(), 2);
        assert!(space.bump_alloc(64 * KB).is_none());

        unsafe { a.as_ptr().write_bytes(0xAB, 20) };
        space.clear();
        assert_eq!(space.bytes_allocated(), 0);
        assert_eq!(space.objects_allocated(), 0);
        let c = unsafe { space.alloc_thread_unsafe(16) }.unwrap();
        assert_eq!(c.ptr, a);
        assert_eq!(unsafe { *c.ptr.as_ptr() }, 0);
    }

    #[test]
    fn test_concurrent_bump_alloc() {
        let space = BumpPointerSpace::create("bump", 64 * KB).unwrap();
        crossbeam_utils::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|_| {
                    for _ in 0..100 {
                        space.bump_alloc(16).unwrap();
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(space.objects_allocated(), 400);
        assert_eq!(space.bytes_allocated(), 400 * 16);
    }
}
