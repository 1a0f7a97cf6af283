use std::{
    collections::BTreeMap,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    slab::{brackets::PAGE_SIZE, Allocation},
    statistics::ObjectBytePair,
    utils::{align_usize, formatted_size, mmap::Mmap},
};

/// Objects at least this large skip the semi-spaces.
pub const LARGE_OBJECT_THRESHOLD: usize = 3 * PAGE_SIZE;

/// A large object and its own mapping.
pub struct LargeObject {
    mem_map: Mmap,
    live: AtomicBool,
    mark: AtomicBool,
}

impl LargeObject {
    pub fn is_marked(&self) -> bool {
        self.mark.load(Ordering::Relaxed)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    /// Sets the mark and returns whether it was already set.
    pub fn test_and_set_marked(&self) -> bool {
        if self.is_marked() {
            return true;
        }
        self.mark
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
    }

    pub fn size(&self) -> usize {
        self.mem_map.size()
    }
}

/// Large objects, one mapping each. Never moved.
pub struct LargeObjectSpace {
    objects: Mutex<BTreeMap<usize, LargeObject>>,
    bytes_allocated: AtomicUsize,
    objects_allocated: AtomicUsize,
    total_bytes_allocated: AtomicUsize,
}

impl Default for LargeObjectSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl LargeObjectSpace {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            bytes_allocated: AtomicUsize::new(0),
            objects_allocated: AtomicUsize::new(0),
            total_bytes_allocated: AtomicUsize::new(0),
        }
    }

    /// Maps a fresh zeroed region for an object of `size` bytes. The object is live at once.
    pub fn alloc(&self, size: usize) -> Option<Allocation> {
        let allocation_size = align_usize(size, PAGE_SIZE);
        let mem_map = match Mmap::new(allocation_size) {
            Ok(mem_map) => mem_map,
            Err(err) => {
                log::warn!(
                    "large object space: failed to map {}: {}",
                    formatted_size(allocation_size),
                    err
                );
                return None;
            }
        };
        let ptr = NonNull::new(mem_map.start())?;
        self.objects.lock().insert(
            ptr.as_ptr() as usize,
            LargeObject {
                mem_map,
                live: AtomicBool::new(true),
                mark: AtomicBool::new(false),
            },
        );
        self.bytes_allocated
            .fetch_add(allocation_size, Ordering::Relaxed);
        self.total_bytes_allocated
            .fetch_add(allocation_size, Ordering::Relaxed);
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        Some(Allocation {
            ptr,
            bytes_allocated: allocation_size,
            usable_size: allocation_size,
            bytes_tl_bulk_allocated: allocation_size,
        })
    }

    /// Unmaps `ptr` and returns its size.
    pub fn free(&self, ptr: *mut u8) -> usize {
        let object = self
            .objects
            .lock()
            .remove(&(ptr as usize))
            .unwrap_or_else(|| panic!("{:p} is not a large object", ptr));
        let size = object.size();
        self.bytes_allocated.fetch_sub(size, Ordering::Relaxed);
        self.objects_allocated.fetch_sub(1, Ordering::Relaxed);
        size
    }

    fn with_object<R>(&self, obj: *const u8, f: impl FnOnce(&LargeObject) -> R) -> Option<R> {
        let objects = self.objects.lock();
        let (&start, object) = objects.range(..=obj as usize).next_back()?;
        if (obj as usize) < start + object.size() {
            Some(f(object))
        } else {
            None
        }
    }

    /// Whether `obj` points into any large object.
    pub fn has_address(&self, obj: *const u8) -> bool {
        self.with_object(obj, |_| ()).is_some()
    }

    /// Returns whether `obj` was already marked.
    pub fn test_and_set_marked(&self, obj: *const u8) -> bool {
        self.with_object(obj, LargeObject::test_and_set_marked)
            .unwrap_or_else(|| panic!("{:p} is not a large object", obj))
    }

    pub fn is_marked(&self, obj: *const u8) -> bool {
        self.with_object(obj, LargeObject::is_marked)
            .unwrap_or(false)
    }

    pub fn is_live(&self, obj: *const u8) -> bool {
        self.with_object(obj, LargeObject::is_live)
            .unwrap_or(false)
    }

    /// Start addresses of every live object.
    pub fn live_objects(&self) -> Vec<*mut u8> {
        self.objects
            .lock()
            .iter()
            .filter(|(_, object)| object.is_live())
            .map(|(&start, _)| start as *mut u8)
            .collect()
    }

    /// Marks every live object, used when the space is immune for a cycle.
    pub fn copy_live_to_marked(&self) {
        for object in self.objects.lock().values() {
            object.mark.store(object.is_live(), Ordering::Relaxed);
        }
    }

    /// Unmaps every live but unmarked object.
    pub fn sweep(&self, swap_bitmaps: bool) -> ObjectBytePair {
        let mut freed = ObjectBytePair::default();
        let mut objects = self.objects.lock();
        let garbage: Vec<usize> = objects
            .iter()
            .filter(|(_, object)| {
                let (live, mark) = if swap_bitmaps {
                    (object.is_marked(), object.is_live())
                } else {
                    (object.is_live(), object.is_marked())
                };
                live && !mark
            })
            .map(|(&start, _)| start)
            .collect();
        for start in garbage {
            if let Some(object) = objects.remove(&start) {
                freed.objects += 1;
                freed.bytes += object.size() as i64;
                self.bytes_allocated
                    .fetch_sub(object.size(), Ordering::Relaxed);
                self.objects_allocated.fetch_sub(1, Ordering::Relaxed);
            }
        }
        freed
    }

    /// Survivors become the live set.
    pub fn swap_bitmaps(&self) {
        for object in self.objects.lock().values() {
            object.live.store(object.is_marked(), Ordering::Relaxed);
        }
    }

    pub fn clear_mark_bitmap(&self) {
        for object in self.objects.lock().values() {
            object.mark.store(false, Ordering::Relaxed);
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    /// Bytes ever allocated, including objects freed since.
    pub fn total_bytes_allocated(&self) -> usize {
        self.total_bytes_allocated.load(Ordering::Relaxed)
    }
}
