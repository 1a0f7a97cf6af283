use atomic::Atomic;
use atomic::Ordering;
use core::fmt;
use memmap2::MmapMut;
use std::io;
use std::mem::size_of;

use crate::utils::align_usize;

/// Address-indexed bitmap with one bit per `ALIGN` bytes of the covered heap range.
pub struct SpaceBitmap<const ALIGN: usize> {
    // Keeps the bits mapped.
    _mem_map: MmapMut,
    bitmap_begin: *mut Atomic<usize>,
    bitmap_size: usize,
    heap_begin: usize,
    heap_limit: usize,
    name: &'static str,
}

unsafe impl<const ALIGN: usize> Send for SpaceBitmap<ALIGN> {}
unsafe impl<const ALIGN: usize> Sync for SpaceBitmap<ALIGN> {}

const BITS_PER_INTPTR: usize = size_of::<usize>() * 8;
/// Pointers handed to the sweep callback per batch.
const SWEEP_BATCH: usize = 4 * BITS_PER_INTPTR;

impl<const ALIGN: usize> SpaceBitmap<ALIGN> {
    #[inline]
    pub fn has_address(&self, obj: *const u8) -> bool {
        let offset = (obj as usize).wrapping_sub(self.heap_begin);
        let index = Self::offset_to_index(offset);
        index < (self.bitmap_size / size_of::<usize>())
    }
    #[inline]
    pub fn index_to_offset(index: u64) -> u64 {
        index * ALIGN as u64 * BITS_PER_INTPTR as u64
    }
    #[inline]
    pub fn offset_to_index(offset: usize) -> usize {
        offset / ALIGN / BITS_PER_INTPTR
    }
    #[inline]
    pub fn offset_bit_index(offset: usize) -> usize {
        (offset / ALIGN) % BITS_PER_INTPTR
    }
    #[inline]
    pub fn offset_to_mask(offset: usize) -> usize {
        1 << Self::offset_bit_index(offset)
    }
    #[inline]
    fn word(&self, index: usize) -> &Atomic<usize> {
        debug_assert!(
            index < self.bitmap_size / size_of::<usize>(),
            "bitmap_size: {}",
            self.bitmap_size
        );
        unsafe { &*self.bitmap_begin.add(index) }
    }
    /// Sets the bit for `obj` and returns its previous value.
    #[inline]
    pub fn atomic_test_and_set(&self, obj: *const u8) -> bool {
        let addr = obj as usize;
        debug_assert!(self.has_address(obj), "Invalid object address: {:p}", obj);
        let offset = addr.wrapping_sub(self.heap_begin);
        let index = Self::offset_to_index(offset);
        let mask = Self::offset_to_mask(offset);
        let atomic_entry = self.word(index);

        let mut old_word;
        while {
            old_word = atomic_entry.load(Ordering::Relaxed);
            if (old_word & mask) != 0 {
                return true;
            }
            atomic_entry
                .compare_exchange_weak(
                    old_word,
                    old_word | mask,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_err()
        } {}

        false
    }
    /// Clears the bit for `obj` and returns its previous value.
    #[inline]
    pub fn atomic_test_and_clear(&self, obj: *const u8) -> bool {
        let addr = obj as usize;
        debug_assert!(self.has_address(obj), "Invalid object address: {:p}", obj);
        let offset = addr.wrapping_sub(self.heap_begin);
        let mask = Self::offset_to_mask(offset);
        let old_word = self
            .word(Self::offset_to_index(offset))
            .fetch_and(!mask, Ordering::Relaxed);
        (old_word & mask) != 0
    }
    #[inline]
    pub fn test(&self, obj: *const u8) -> bool {
        let addr = obj as usize;
        debug_assert!(self.has_address(obj), "Invalid object address: {:p}", obj);
        let offset = addr.wrapping_sub(self.heap_begin);
        let index = Self::offset_to_index(offset);
        (self.word(index).load(Ordering::Relaxed) & Self::offset_to_mask(offset)) != 0
    }
    #[inline]
    pub fn modify<const SET_BIT: bool>(&self, obj: *const u8) -> bool {
        let addr = obj as usize;
        debug_assert!(self.has_address(obj), "Invalid object address: {:p}", obj);
        let offset = addr.wrapping_sub(self.heap_begin);
        let index = Self::offset_to_index(offset);
        let mask = Self::offset_to_mask(offset);
        let atomic_entry = self.word(index);
        let old_word = atomic_entry.load(Ordering::Relaxed);
        if SET_BIT {
            // Skip the store when the bit is already there so clean bitmap pages stay clean.
            if (old_word & mask) == 0 {
                atomic_entry.store(old_word | mask, Ordering::Relaxed);
            }
        } else {
            atomic_entry.store(old_word & !mask, Ordering::Relaxed);
        }

        debug_assert_eq!(self.test(obj), SET_BIT);
        (old_word & mask) != 0
    }

    #[inline(always)]
    pub fn set(&self, obj: *const u8) -> bool {
        self.modify::<true>(obj)
    }

    #[inline(always)]
    pub fn clear(&self, obj: *const u8) -> bool {
        self.modify::<false>(obj)
    }

    pub fn compute_bitmap_size(capacity: u64) -> usize {
        let bytes_covered_per_word = ALIGN * BITS_PER_INTPTR;
        align_usize(capacity as usize, bytes_covered_per_word) / bytes_covered_per_word
            * size_of::<usize>()
    }

    /// Clears every bit for objects in `begin..end`.
    pub fn clear_range(&self, begin: *const u8, end: *const u8) {
        let mut begin_offset = begin as usize - self.heap_begin as usize;
        let mut end_offset = end as usize - self.heap_begin as usize;
        while begin_offset < end_offset && Self::offset_bit_index(begin_offset) != 0 {
            self.clear((self.heap_begin + begin_offset) as _);
            begin_offset += ALIGN;
        }

        while begin_offset < end_offset && Self::offset_bit_index(end_offset) != 0 {
            end_offset -= ALIGN;
            self.clear((self.heap_begin + end_offset) as _);
        }
        let start_index = Self::offset_to_index(begin_offset);
        let end_index = Self::offset_to_index(end_offset);
        for index in start_index..end_index {
            self.word(index).store(0, Ordering::Relaxed);
        }
    }

    /// Zeroes the whole bitmap.
    pub fn clear_all(&self) {
        unsafe {
            std::ptr::write_bytes(self.bitmap_begin.cast::<u8>(), 0, self.bitmap_size);
        }
    }

    /// Visit marked bits in bitmap.
    ///
    /// Bits may change while visiting: each word is loaded once and then its marked bits
    /// are visited.
    pub fn visit_marked_range(
        &self,
        visit_begin: *const u8,
        visit_end: *const u8,
        mut visitor: impl FnMut(*mut u8),
    ) {
        if visit_end <= visit_begin {
            return;
        }
        let offset_start = visit_begin as usize - self.heap_begin as usize;
        let offset_end = visit_end as usize - self.heap_begin as usize;

        let index_start = Self::offset_to_index(offset_start);
        let index_end = Self::offset_to_index(offset_end);
        let bit_start = (offset_start / ALIGN) % BITS_PER_INTPTR;
        let bit_end = (offset_end / ALIGN) % BITS_PER_INTPTR;
        // Index(begin)  ...    Index(end)
        // [xxxxx???][........][????yyyy]
        //      ^                   ^
        //      |                   #---- Bit of visit_end
        //      #---- Bit of visit_begin
        //
        let mut left_edge = self.word(index_start).load(Ordering::Relaxed);
        left_edge &= !((1 << bit_start) - 1);
        let mut right_edge;
        if index_start < index_end {
            if left_edge != 0 {
                let ptr_base = Self::index_to_offset(index_start as _) as usize + self.heap_begin;
                while {
                    let shift = left_edge.trailing_zeros();
                    visitor((ptr_base + shift as usize * ALIGN) as *mut u8);
                    left_edge ^= 1 << shift as usize;
                    left_edge != 0
                } {}
            }
            for i in index_start + 1..index_end {
                let mut w = self.word(i).load(Ordering::Relaxed);
                if w != 0 {
                    let ptr_base = Self::index_to_offset(i as _) as usize + self.heap_begin;
                    while {
                        let shift = w.trailing_zeros();
                        visitor((ptr_base + shift as usize * ALIGN) as *mut u8);
                        w ^= 1 << shift as usize;
                        w != 0
                    } {}
                }
            }

            // visit_end may start a fresh word, then there is nothing on the right edge.
            if bit_end == 0 {
                right_edge = 0;
            } else {
                right_edge = self.word(index_end).load(Ordering::Relaxed);
            }
        } else {
            right_edge = left_edge;
        }

        right_edge &= (1 << bit_end) - 1;
        if right_edge != 0 {
            let ptr_base = Self::index_to_offset(index_end as _) as usize + self.heap_begin;
            while {
                let shift = right_edge.trailing_zeros();
                visitor((ptr_base + shift as usize * ALIGN) as *mut u8);
                right_edge ^= 1 << shift as usize;
                right_edge != 0
            } {}
        }
    }

    /// Hands every object that is live in `live_bitmap` but unmarked in `mark_bitmap` to `callback`
    /// in batches.
    pub fn sweep_walk(
        live_bitmap: &Self,
        mark_bitmap: &Self,
        sweep_begin: usize,
        sweep_end: usize,
        mut callback: impl FnMut(&[*mut u8]),
    ) {
        assert_eq!(live_bitmap.heap_begin, mark_bitmap.heap_begin);
        assert_eq!(live_bitmap.bitmap_size, mark_bitmap.bitmap_size);
        if sweep_end <= sweep_begin {
            return;
        }
        let mut pointer_buf: Vec<*mut u8> = Vec::with_capacity(SWEEP_BATCH + BITS_PER_INTPTR);
        let start = Self::offset_to_index(sweep_begin - live_bitmap.heap_begin);
        let end = Self::offset_to_index(sweep_end - live_bitmap.heap_begin - 1);

        for i in start..=end {
            let mut garbage = live_bitmap.word(i).load(Ordering::Relaxed)
                & !mark_bitmap.word(i).load(Ordering::Relaxed);
            if garbage != 0 {
                let ptr_base = Self::index_to_offset(i as _) as usize + live_bitmap.heap_begin;
                while garbage != 0 {
                    let shift = garbage.trailing_zeros() as usize;
                    garbage ^= 1 << shift;
                    pointer_buf.push((ptr_base + shift * ALIGN) as *mut u8);
                }
                if pointer_buf.len() >= SWEEP_BATCH {
                    callback(&pointer_buf);
                    pointer_buf.clear();
                }
            }
        }
        if !pointer_buf.is_empty() {
            callback(&pointer_buf);
        }
    }

    pub fn new(
        name: &'static str,
        mem_map: MmapMut,
        bitmap_begin: *mut usize,
        bitmap_size: usize,
        heap_begin: *mut u8,
        heap_capacity: usize,
    ) -> Self {
        Self {
            name,
            _mem_map: mem_map,
            bitmap_size,
            bitmap_begin: bitmap_begin.cast(),
            heap_begin: heap_begin as _,
            heap_limit: heap_begin as usize + heap_capacity,
        }
    }

    pub fn create_from_memmap(
        name: &'static str,
        mut mem_map: MmapMut,
        heap_begin: *mut u8,
        heap_capacity: usize,
    ) -> Self {
        let bitmap_begin = mem_map.as_mut_ptr();
        let bitmap_size = Self::compute_bitmap_size(heap_capacity as _);
        Self::new(
            name,
            mem_map,
            bitmap_begin.cast(),
            bitmap_size,
            heap_begin,
            heap_capacity,
        )
    }

    pub fn create(
        name: &'static str,
        heap_begin: *mut u8,
        heap_capacity: usize,
    ) -> io::Result<Self> {
        let bitmap_size = Self::compute_bitmap_size(heap_capacity as _);

        let mem_map = MmapMut::map_anon(bitmap_size.max(size_of::<usize>()))?;
        Ok(Self::create_from_memmap(
            name,
            mem_map,
            heap_begin,
            heap_capacity,
        ))
    }
}

impl<const ALIGN: usize> fmt::Debug for SpaceBitmap<ALIGN> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[begin={:p},end={:p}]",
            self.name, self.heap_begin as *const (), self.heap_limit as *const ()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAP_BEGIN: usize = 0x1000_0000;

    fn bitmap(capacity: usize) -> SpaceBitmap<8> {
        SpaceBitmap::create("test-bitmap", HEAP_BEGIN as *mut u8, capacity).unwrap()
    }

    #[test]
    fn test_set_and_clear() {
        let bitmap = bitmap(64 * 1024);
        let obj = (HEAP_BEGIN + 128) as *const u8;
        assert!(!bitmap.test(obj));
        assert!(!bitmap.set(obj));
        assert!(bitmap.test(obj));
        assert!(bitmap.atomic_test_and_set(obj));
        assert!(bitmap.clear(obj));
        assert!(!bitmap.test(obj));
        assert!(!bitmap.atomic_test_and_set(obj));
        assert!(bitmap.test(obj));
    }

    #[test]
    fn test_visit_marked_range() {
        let bitmap = bitmap(64 * 1024);
        let offsets = [0usize, 8, 504, 512, 4096, 8192 + 16, 64 * 1024 - 8];
        for off in offsets.iter() {
            bitmap.set((HEAP_BEGIN + off) as *const u8);
        }
        let mut seen = vec![];
        bitmap.visit_marked_range(
            HEAP_BEGIN as *const u8,
            (HEAP_BEGIN + 64 * 1024) as *const u8,
            |obj| seen.push(obj as usize - HEAP_BEGIN),
        );
        assert_eq!(seen, offsets.to_vec());

        let mut partial = vec![];
        bitmap.visit_marked_range(
            (HEAP_BEGIN + 8) as *const u8,
            (HEAP_BEGIN + 4096) as *const u8,
            |obj| partial.push(obj as usize - HEAP_BEGIN),
        );
        assert_eq!(partial, vec![8, 504, 512]);
    }

    #[test]
    fn test_clear_range() {
        let bitmap = bitmap(64 * 1024);
        let mut off = 0;
        while off < 16 * 1024 {
            bitmap.set((HEAP_BEGIN + off) as *const u8);
            off += 8;
        }
        bitmap.clear_range((HEAP_BEGIN + 24) as *const u8, (HEAP_BEGIN + 8192) as *const u8);
        assert!(bitmap.test((HEAP_BEGIN + 16) as *const u8));
        assert!(!bitmap.test((HEAP_BEGIN + 24) as *const u8));
        assert!(!bitmap.test((HEAP_BEGIN + 4096) as *const u8));
        assert!(!bitmap.test((HEAP_BEGIN + 8184) as *const u8));
        assert!(bitmap.test((HEAP_BEGIN + 8192) as *const u8));
    }

    #[test]
    fn test_sweep_walk_reports_unmarked_live_objects() {
        let live = bitmap(64 * 1024);
        let mark = bitmap(64 * 1024);
        for i in 0..300 {
            let obj = (HEAP_BEGIN + i * 16) as *const u8;
            live.set(obj);
            if i % 3 == 0 {
                mark.set(obj);
            }
        }
        let mut garbage = 0;
        SpaceBitmap::<8>::sweep_walk(
            &live,
            &mark,
            HEAP_BEGIN,
            HEAP_BEGIN + 64 * 1024,
            |ptrs| {
                for ptr in ptrs {
                    let index = (*ptr as usize - HEAP_BEGIN) / 16;
                    assert_ne!(index % 3, 0);
                }
                garbage += ptrs.len();
            },
        );
        assert_eq!(garbage, 200);
    }
}
