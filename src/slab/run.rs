use std::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
};

use super::{
    brackets::{BracketTable, RUN_HEADER_SIZE, RUN_MAGIC},
    free_list::{SlotFreeList, NIL},
};

static NEXT_THREAD_TOKEN: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static THREAD_TOKEN: usize = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Non-zero identifier of the calling thread, never reused.
#[inline]
pub fn current_thread_token() -> usize {
    THREAD_TOKEN.with(|token| *token)
}

/// Metadata of one run of slots.
///
/// The slots themselves live in the pages starting at `begin`; everything else is kept
/// off-page. The first bytes of the run pages carry a small header (magic and bracket index)
/// so a dump of the space still shows where runs start.
///
/// Free lists are only touched under the bracket lock, except `free_list` of a thread-local
/// run, which belongs to the owning thread: it allocates from it and frees into it.
pub struct Run {
    begin: *mut u8,
    idx: usize,
    bracket_size: usize,
    num_slots: usize,
    first_slot: *mut u8,
    is_thread_local: AtomicBool,
    /// Token of the thread allocating from the run while it is thread-local, zero otherwise.
    owner: AtomicUsize,
    to_be_bulk_freed: AtomicBool,
    links: Box<[AtomicU32]>,
    free_list: UnsafeCell<SlotFreeList<false>>,
    bulk_free_list: UnsafeCell<SlotFreeList<true>>,
    thread_local_free_list: UnsafeCell<SlotFreeList<true>>,
}

unsafe impl Send for Run {}
unsafe impl Sync for Run {}

/// Pointer to side-allocated run metadata. Runs are created and destroyed by the owning
/// allocator under its global lock.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RunPtr(NonNull<Run>);

unsafe impl Send for RunPtr {}
unsafe impl Sync for RunPtr {}

impl RunPtr {
    pub fn allocate(run: Run) -> Self {
        Self(unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(run))) })
    }

    /// Frees the metadata. The pointer must not be used afterwards.
    pub unsafe fn destroy(self) {
        drop(Box::from_raw(self.0.as_ptr()));
    }
}

impl std::ops::Deref for RunPtr {
    type Target = Run;
    #[inline(always)]
    fn deref(&self) -> &Run {
        unsafe { &*self.0.as_ptr() }
    }
}

impl Run {
    /// Creates the metadata for a run carved at `begin` and links every slot into the
    /// free list.
    pub unsafe fn new(table: &BracketTable, begin: *mut u8, idx: usize) -> Self {
        let num_slots = table.num_slots(idx);
        let links = (0..num_slots)
            .map(|_| AtomicU32::new(NIL))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let this = Self {
            begin,
            idx,
            bracket_size: table.bracket_size(idx),
            num_slots,
            first_slot: begin.add(table.header_size(idx)),
            is_thread_local: AtomicBool::new(false),
            owner: AtomicUsize::new(0),
            to_be_bulk_freed: AtomicBool::new(false),
            links,
            free_list: UnsafeCell::new(SlotFreeList::new()),
            bulk_free_list: UnsafeCell::new(SlotFreeList::new()),
            thread_local_free_list: UnsafeCell::new(SlotFreeList::new()),
        };
        begin.write(RUN_MAGIC);
        begin.add(1).write(idx as u8);
        this.init_free_list();
        this
    }

    unsafe fn init_free_list(&self) {
        let list = &mut *self.free_list.get();
        // Added backwards so the lowest slot is handed out first.
        for slot in (0..self.num_slots as u32).rev() {
            list.add(&self.links, slot);
        }
    }

    #[inline]
    pub fn begin(&self) -> *mut u8 {
        self.begin
    }
    #[inline]
    pub fn bracket_index(&self) -> usize {
        self.idx
    }
    #[inline]
    pub fn bracket_size(&self) -> usize {
        self.bracket_size
    }
    #[inline]
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }
    #[inline]
    pub fn first_slot(&self) -> *mut u8 {
        self.first_slot
    }
    #[inline]
    pub fn end_of_slots(&self) -> *mut u8 {
        unsafe { self.first_slot.add(self.num_slots * self.bracket_size) }
    }

    #[inline]
    pub fn is_thread_local(&self) -> bool {
        self.is_thread_local.load(Ordering::Relaxed)
    }
    #[inline]
    pub fn set_is_thread_local(&self, value: bool) {
        let owner = if value { current_thread_token() } else { 0 };
        self.owner.store(owner, Ordering::Relaxed);
        self.is_thread_local.store(value, Ordering::Relaxed);
    }
    /// Makes the calling thread the owner of a thread-local run. A context handed to
    /// another thread moves its runs along on the next allocation.
    #[inline]
    pub fn claim_for_current_thread(&self) {
        let token = current_thread_token();
        if self.owner.load(Ordering::Relaxed) != token {
            self.owner.store(token, Ordering::Relaxed);
        }
    }
    #[inline]
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.is_thread_local() && self.owner.load(Ordering::Relaxed) == current_thread_token()
    }
    #[inline]
    pub fn is_to_be_bulk_freed(&self) -> bool {
        self.to_be_bulk_freed.load(Ordering::Relaxed)
    }
    #[inline]
    pub fn set_to_be_bulk_freed(&self, value: bool) {
        self.to_be_bulk_freed.store(value, Ordering::Relaxed);
    }

    #[inline]
    fn free_list(&self) -> &mut SlotFreeList<false> {
        unsafe { &mut *self.free_list.get() }
    }
    #[inline]
    fn bulk_free_list(&self) -> &mut SlotFreeList<true> {
        unsafe { &mut *self.bulk_free_list.get() }
    }
    #[inline]
    fn thread_local_free_list(&self) -> &mut SlotFreeList<true> {
        unsafe { &mut *self.thread_local_free_list.get() }
    }

    #[inline]
    pub fn slot_index(&self, ptr: *const u8) -> u32 {
        let offset = ptr as usize - self.first_slot as usize;
        debug_assert_eq!(
            offset % self.bracket_size,
            0,
            "{:p} is not a slot of run {:p}",
            ptr,
            self.begin
        );
        let idx = offset / self.bracket_size;
        assert!(idx < self.num_slots, "{:p} is past the slots of run {:p}", ptr, self.begin);
        idx as u32
    }

    #[inline]
    pub fn slot_addr(&self, slot: u32) -> *mut u8 {
        unsafe { self.first_slot.add(slot as usize * self.bracket_size) }
    }

    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        ptr >= self.first_slot as *const u8 && ptr < self.end_of_slots() as *const u8
    }

    /// Pops a slot from the free list, null when the run is full.
    #[inline]
    pub fn alloc_slot(&self) -> *mut u8 {
        match self.free_list().remove(&self.links) {
            Some(slot) => self.slot_addr(slot),
            None => std::ptr::null_mut(),
        }
    }

    #[inline]
    unsafe fn zero_slot(&self, ptr: *mut u8) {
        std::ptr::write_bytes(ptr, 0, self.bracket_size);
    }

    /// Returns a slot to the free list. Used by non-bulk frees of shared runs and by the
    /// owner of a thread-local run.
    pub fn free_slot(&self, ptr: *mut u8) {
        let slot = self.slot_index(ptr);
        unsafe {
            self.zero_slot(ptr);
        }
        self.free_list().add(&self.links, slot);
    }

    /// Returns the bracket size.
    pub fn add_to_bulk_free_list(&self, ptr: *mut u8) -> usize {
        let slot = self.slot_index(ptr);
        unsafe {
            self.zero_slot(ptr);
        }
        self.bulk_free_list().add(&self.links, slot);
        self.bracket_size
    }

    pub fn add_to_thread_local_free_list(&self, ptr: *mut u8) {
        let slot = self.slot_index(ptr);
        unsafe {
            self.zero_slot(ptr);
        }
        self.thread_local_free_list().add(&self.links, slot);
    }

    /// Moves the thread-local free list into the free list. Returns true if at least one
    /// slot became available, together with whether the run is now entirely free.
    pub fn merge_thread_local_free_list_to_free_list(&self) -> (bool, bool) {
        let size_before = self.free_list().size();
        self.free_list()
            .merge(&self.links, self.thread_local_free_list());
        let size_after = self.free_list().size();
        debug_assert!(size_before <= size_after);
        (size_before < size_after, size_after == self.num_slots)
    }

    pub fn merge_bulk_free_list_to_free_list(&self) {
        self.free_list().merge(&self.links, self.bulk_free_list());
    }

    pub fn merge_bulk_free_list_to_thread_local_free_list(&self) {
        self.thread_local_free_list()
            .merge(&self.links, self.bulk_free_list());
    }

    #[inline]
    pub fn is_all_free(&self) -> bool {
        self.free_list().size() == self.num_slots
    }
    #[inline]
    pub fn is_full(&self) -> bool {
        self.free_list().is_empty()
    }
    #[inline]
    pub fn number_of_free_slots(&self) -> usize {
        self.free_list().size()
    }
    #[inline]
    pub fn is_bulk_free_list_empty(&self) -> bool {
        self.bulk_free_list().is_empty()
    }

    /// Clears the in-run header. Slots are zeroed when freed, so afterwards the whole run
    /// reads as zero.
    pub unsafe fn zero_header(&self) {
        std::ptr::write_bytes(self.begin, 0, RUN_HEADER_SIZE);
    }

    /// Calls `handler(start, end, used_bytes)` for every slot, `used_bytes` being zero for
    /// slots sitting on any of the free lists.
    pub fn inspect_all_slots(&self, mut handler: impl FnMut(*mut u8, *mut u8, usize)) {
        let mut is_free = vec![false; self.num_slots];
        self.free_list()
            .for_each(&self.links, |slot| is_free[slot as usize] = true);
        self.bulk_free_list()
            .for_each(&self.links, |slot| is_free[slot as usize] = true);
        self.thread_local_free_list()
            .for_each(&self.links, |slot| is_free[slot as usize] = true);
        for (slot, free) in is_free.into_iter().enumerate() {
            let start = self.slot_addr(slot as u32);
            let end = unsafe { start.add(self.bracket_size) };
            handler(start, end, if free { 0 } else { self.bracket_size });
        }
    }

    /// Checks the header and that the free lists are well formed and disjoint.
    pub fn verify(&self) {
        unsafe {
            assert_eq!(
                self.begin.read(),
                RUN_MAGIC,
                "bad magic in run {:p}",
                self.begin
            );
            assert_eq!(self.begin.add(1).read() as usize, self.idx);
        }
        self.free_list().verify(&self.links);
        self.bulk_free_list().verify(&self.links);
        self.thread_local_free_list().verify(&self.links);
        let mut seen = vec![false; self.num_slots];
        let mut check = |slot: u32| {
            assert!(!seen[slot as usize], "slot {} is on two free lists", slot);
            seen[slot as usize] = true;
        };
        self.free_list().for_each(&self.links, &mut check);
        self.bulk_free_list().for_each(&self.links, &mut check);
        self.thread_local_free_list().for_each(&self.links, &mut check);
    }

    pub fn dump(&self) -> String {
        format!(
            "Run{{begin={:p} idx={} bracket={} slots={} free={} bulk={} tl={} thread_local={}}}",
            self.begin,
            self.idx,
            self.bracket_size,
            self.num_slots,
            self.free_list().size(),
            self.bulk_free_list().size(),
            self.thread_local_free_list().size(),
            self.is_thread_local()
        )
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.dump())
    }
}
