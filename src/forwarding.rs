//! Forwarding addresses of evacuated objects.
//!
//! Objects carry no header the collector could overwrite, so every object granule of a
//! movable space has a cell in a side table. A cell is empty, claimed by the worker that is
//! copying the object, or holds the address of the copy.

use std::{
    io,
    mem::size_of,
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam_utils::Backoff;
use memmap2::MmapMut;

use crate::space::OBJECT_ALIGNMENT;

const NOT_FORWARDED: usize = 0;
const BUSY: usize = 1;

/// Outcome of [`ForwardingTable::try_claim`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Claim {
    /// The caller owns the object and must copy it, then call
    /// [`ForwardingTable::publish`].
    Won,
    /// Another worker copied the object to this address.
    Forwarded(*mut u8),
}

pub struct ForwardingTable {
    // Keeps the cells mapped.
    _mem_map: MmapMut,
    cells: *const AtomicUsize,
    heap_begin: usize,
    heap_capacity: usize,
}

unsafe impl Send for ForwardingTable {}
unsafe impl Sync for ForwardingTable {}

impl ForwardingTable {
    pub fn create(heap_begin: *mut u8, heap_capacity: usize) -> io::Result<Self> {
        let num_cells = heap_capacity / OBJECT_ALIGNMENT;
        let mut mem_map =
            MmapMut::map_anon((num_cells * size_of::<usize>()).max(size_of::<usize>()))?;
        let cells = mem_map.as_mut_ptr() as *const AtomicUsize;
        Ok(Self {
            _mem_map: mem_map,
            cells,
            heap_begin: heap_begin as usize,
            heap_capacity,
        })
    }

    #[inline]
    fn cell(&self, obj: *const u8) -> &AtomicUsize {
        let offset = (obj as usize).wrapping_sub(self.heap_begin);
        assert!(
            offset < self.heap_capacity,
            "{:p} has no forwarding cell",
            obj
        );
        unsafe { &*self.cells.add(offset / OBJECT_ALIGNMENT) }
    }

    /// Address of the copy of `obj`, `None` if it has not been claimed. Waits while another
    /// worker is still copying it.
    #[inline]
    pub fn forwarding_address(&self, obj: *const u8) -> Option<*mut u8> {
        let cell = self.cell(obj);
        match cell.load(Ordering::Acquire) {
            NOT_FORWARDED => None,
            BUSY => Some(Self::wait_published(cell)),
            addr => Some(addr as *mut u8),
        }
    }

    /// Races for the right to copy `obj`. Exactly one caller wins; every other caller gets
    /// the winner's copy once it is published.
    #[inline]
    pub fn try_claim(&self, obj: *const u8) -> Claim {
        let cell = self.cell(obj);
        match cell.compare_exchange(NOT_FORWARDED, BUSY, Ordering::Acquire, Ordering::Acquire) {
            Ok(_) => Claim::Won,
            Err(BUSY) => Claim::Forwarded(Self::wait_published(cell)),
            Err(addr) => Claim::Forwarded(addr as *mut u8),
        }
    }

    /// Makes `to` the forwarding address of a claimed `obj`. The copy must be complete.
    #[inline]
    pub fn publish(&self, obj: *const u8, to: *mut u8) {
        debug_assert!(to as usize > BUSY);
        let previous = self.cell(obj).swap(to as usize, Ordering::Release);
        debug_assert_eq!(previous, BUSY, "{:p} was not claimed", obj);
    }

    fn wait_published(cell: &AtomicUsize) -> *mut u8 {
        let backoff = Backoff::new();
        loop {
            let addr = cell.load(Ordering::Acquire);
            if addr != BUSY {
                return addr as *mut u8;
            }
            backoff.snooze();
        }
    }

    /// Empties the cells of `begin..end`. No worker may be using the table.
    pub fn clear_range(&self, begin: *const u8, end: *const u8) {
        if end <= begin {
            return;
        }
        let first = (begin as usize - self.heap_begin) / OBJECT_ALIGNMENT;
        let last = (end as usize - self.heap_begin + OBJECT_ALIGNMENT - 1) / OBJECT_ALIGNMENT;
        assert!(last * OBJECT_ALIGNMENT <= self.heap_capacity);
        unsafe {
            std::ptr::write_bytes(self.cells.add(first) as *mut AtomicUsize, 0, last - first);
        }
    }
}
