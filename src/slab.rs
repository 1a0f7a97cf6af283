//! Runs-of-slots allocator.
//!
//! Memory is managed in pages. Small requests are rounded up to a bracket and served from a
//! run: a few pages carved into equally sized slots. Requests above
//! [`LARGE_SIZE_THRESHOLD`](brackets::LARGE_SIZE_THRESHOLD) get whole pages.
//!
//! Lock order is bulk free lock, then bracket lock, then the global page lock.
pub mod brackets;
pub mod free_list;
pub mod run;

use std::{
    cell::UnsafeCell,
    collections::{BTreeMap, BTreeSet},
    fmt::Write,
    ptr::{null_mut, NonNull},
    sync::Arc,
};

use crossbeam_utils::CachePadded;
use hashbrown::HashSet;
use parking_lot::{lock_api::RawMutex, Mutex, RawMutex as Lock, RwLock};

use crate::{
    config::SlabConfig,
    error::SpaceError,
    utils::{align_usize, formatted_size, is_aligned, mmap::Mmap, MB},
};
use brackets::{BracketTable, LARGE_SIZE_THRESHOLD, NUM_BRACKETS, PAGE_SIZE};
use run::{Run, RunPtr};

/// When free page runs give their memory back to the OS.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageReleaseMode {
    /// Never.
    None,
    /// Only free page runs at the end of the footprint.
    End,
    /// Free page runs at least as large as the threshold.
    Size,
    /// Free page runs at the end of the footprint that are also at least as large as the
    /// threshold.
    SizeAndEnd,
    /// Every free page run.
    All,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum PageMapKind {
    /// Zero and released back to the OS.
    Released,
    /// Zero but possibly dirty.
    Empty,
    Run,
    RunPart,
    LargeObject,
    LargeObjectPart,
}

/// Result of a successful allocation.
#[derive(Clone, Copy, Debug)]
pub struct Allocation {
    pub ptr: NonNull<u8>,
    pub bytes_allocated: usize,
    pub usable_size: usize,
    /// Bytes accounted up front: the free slots of a freshly acquired thread-local run, the
    /// bracket size for shared runs, zero for a plain thread-local hit.
    pub bytes_tl_bulk_allocated: usize,
}

/// Thread-local runs of one thread, one per thread-local bracket.
///
/// A context must only be used for allocation by a single thread at a time. The allocator
/// keeps a handle to every attached context so that it can revoke them all while mutators
/// are stopped.
pub struct ThreadLocalRuns {
    runs: Box<[UnsafeCell<Option<RunPtr>>]>,
}

unsafe impl Send for ThreadLocalRuns {}
unsafe impl Sync for ThreadLocalRuns {}

impl ThreadLocalRuns {
    fn new(count: usize) -> Self {
        Self {
            runs: (0..count).map(|_| UnsafeCell::new(None)).collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    #[inline]
    fn get(&self, idx: usize) -> Option<RunPtr> {
        unsafe { *self.runs[idx].get() }
    }

    #[inline]
    fn set(&self, idx: usize, run: Option<RunPtr>) {
        unsafe {
            *self.runs[idx].get() = run;
        }
    }
}

/// State guarded by the global lock.
struct PageState {
    page_map: Vec<PageMapKind>,
    /// Number of pages inside the footprint.
    page_map_size: usize,
    /// Start pages of free page runs, ordered by address.
    free_page_runs: BTreeSet<usize>,
    /// Byte size of each free page run, indexed by its start page.
    free_page_run_size: Vec<usize>,
    /// Run metadata, indexed by the start page of the run.
    run_table: Vec<Option<RunPtr>>,
    footprint: usize,
    /// Maximum footprint.
    capacity: usize,
}

/// State guarded by a bracket lock.
#[derive(Default)]
struct BracketState {
    current_run: Option<RunPtr>,
    /// Non-full shared runs keyed by address; refills take the lowest one.
    non_full_runs: BTreeMap<usize, RunPtr>,
    full_runs: HashSet<RunPtr>,
}

struct Bracket {
    lock: Lock,
    state: UnsafeCell<BracketState>,
}

enum Owner {
    LargeObject,
    Run(RunPtr),
}

pub struct SlabAllocator {
    mem_map: Mmap,
    base: *mut u8,
    starting_size: usize,
    max_capacity: usize,
    table: BracketTable,
    num_thread_local_brackets: usize,
    page_release_mode: PageReleaseMode,
    page_release_size_threshold: usize,
    lock: Lock,
    pages: UnsafeCell<PageState>,
    brackets: Box<[CachePadded<Bracket>]>,
    bulk_free_lock: RwLock<()>,
    threads: Mutex<Vec<Arc<ThreadLocalRuns>>>,
}

unsafe impl Send for SlabAllocator {}
unsafe impl Sync for SlabAllocator {}

impl SlabAllocator {
    /// Reserves `max_capacity` bytes. The footprint starts at `starting_size` and may grow up
    /// to `footprint_limit` until the limit is raised.
    pub fn new(
        starting_size: usize,
        footprint_limit: usize,
        max_capacity: usize,
        config: &SlabConfig,
    ) -> Result<Self, SpaceError> {
        let starting_size = align_usize(starting_size, PAGE_SIZE);
        let footprint_limit = align_usize(footprint_limit, PAGE_SIZE);
        let max_capacity = align_usize(max_capacity, PAGE_SIZE);
        if max_capacity == 0 {
            return Err(SpaceError::EmptyCapacity { name: "slab" });
        }
        if starting_size > footprint_limit {
            return Err(SpaceError::InitialSizeTooLarge {
                name: "slab",
                initial_size: starting_size,
                growth_limit: footprint_limit,
            });
        }
        if footprint_limit > max_capacity {
            return Err(SpaceError::GrowthLimitTooLarge {
                name: "slab",
                growth_limit: footprint_limit,
                capacity: max_capacity,
            });
        }
        assert!(config.num_thread_local_brackets <= NUM_BRACKETS);

        let mem_map = Mmap::new(max_capacity).map_err(|source| SpaceError::Reserve {
            name: "slab",
            size: max_capacity,
            source,
        })?;
        let base = mem_map.start();
        let max_pages = max_capacity / PAGE_SIZE;
        let mut pages = PageState {
            page_map: vec![PageMapKind::Released; max_pages],
            page_map_size: starting_size / PAGE_SIZE,
            free_page_runs: BTreeSet::new(),
            free_page_run_size: vec![0; max_pages],
            run_table: vec![None; max_pages],
            footprint: starting_size,
            capacity: footprint_limit,
        };
        if starting_size != 0 {
            pages.free_page_runs.insert(0);
            pages.free_page_run_size[0] = starting_size;
        }

        let brackets = (0..NUM_BRACKETS)
            .map(|_| {
                CachePadded::new(Bracket {
                    lock: Lock::INIT,
                    state: UnsafeCell::new(BracketState::default()),
                })
            })
            .collect();

        log::trace!(
            "slab: reserved {} at {:p}, footprint {} limit {}",
            formatted_size(max_capacity),
            base,
            formatted_size(starting_size),
            formatted_size(footprint_limit)
        );

        Ok(Self {
            mem_map,
            base,
            starting_size,
            max_capacity,
            table: BracketTable::new(),
            num_thread_local_brackets: config.num_thread_local_brackets,
            page_release_mode: config.page_release_mode,
            page_release_size_threshold: config.page_release_size_threshold,
            lock: Lock::INIT,
            pages: UnsafeCell::new(pages),
            brackets,
            bulk_free_lock: RwLock::new(()),
            threads: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    fn with_pages<R>(&self, f: impl FnOnce(&mut PageState) -> R) -> R {
        self.lock.lock();
        let result = f(unsafe { &mut *self.pages.get() });
        unsafe {
            self.lock.unlock();
        }
        result
    }

    #[inline]
    fn with_bracket<R>(&self, idx: usize, f: impl FnOnce(&mut BracketState) -> R) -> R {
        let bracket = &self.brackets[idx];
        bracket.lock.lock();
        let result = f(unsafe { &mut *bracket.state.get() });
        unsafe {
            bracket.lock.unlock();
        }
        result
    }

    /// Bracket state without taking the lock; mutators must be stopped.
    #[inline]
    unsafe fn bracket_unlocked(&self, idx: usize) -> &mut BracketState {
        &mut *self.brackets[idx].state.get()
    }

    #[inline]
    pub fn begin(&self) -> *mut u8 {
        self.base
    }

    /// End of the reserved region.
    #[inline]
    pub fn limit(&self) -> *mut u8 {
        unsafe { self.base.add(self.max_capacity) }
    }

    #[inline]
    pub fn mem_map(&self) -> &Mmap {
        &self.mem_map
    }

    #[inline]
    pub fn brackets(&self) -> &BracketTable {
        &self.table
    }

    #[inline]
    pub fn page_release_mode(&self) -> PageReleaseMode {
        self.page_release_mode
    }

    #[inline]
    pub fn does_release_all_pages(&self) -> bool {
        self.page_release_mode == PageReleaseMode::All
    }

    #[inline]
    pub fn num_thread_local_brackets(&self) -> usize {
        self.num_thread_local_brackets
    }

    #[inline]
    pub fn is_size_for_thread_local(&self, size: usize) -> bool {
        size <= LARGE_SIZE_THRESHOLD
            && BracketTable::size_to_index(size) < self.num_thread_local_brackets
    }

    #[inline]
    fn page_addr(&self, pm_idx: usize) -> *mut u8 {
        unsafe { self.base.add(pm_idx * PAGE_SIZE) }
    }

    #[inline]
    fn to_page_map_index(&self, ptr: *const u8) -> usize {
        let offset = (ptr as usize).wrapping_sub(self.base as usize);
        assert!(
            offset < self.max_capacity,
            "{:p} is outside of the slab {:p}-{:p}",
            ptr,
            self.base,
            self.limit()
        );
        offset / PAGE_SIZE
    }

    /// Registers a new thread context.
    pub fn attach_thread(&self) -> Arc<ThreadLocalRuns> {
        let ctx = Arc::new(ThreadLocalRuns::new(self.num_thread_local_brackets));
        self.threads.lock().push(ctx.clone());
        ctx
    }

    /// Revokes the runs of `ctx` and forgets it. Returns the free bytes that were left in
    /// its runs.
    pub fn detach_thread(&self, ctx: &Arc<ThreadLocalRuns>) -> usize {
        let free_bytes = self.revoke_thread_local_runs(ctx);
        self.threads.lock().retain(|other| !Arc::ptr_eq(other, ctx));
        free_bytes
    }

    /// Allocates `size` bytes. `None` means the footprint limit has been reached.
    #[inline]
    pub fn alloc(&self, ctx: &ThreadLocalRuns, size: usize) -> Option<Allocation> {
        if size > LARGE_SIZE_THRESHOLD {
            return self.alloc_large_object(size);
        }
        self.alloc_from_run(ctx, size)
    }

    /// Allocates from the shared runs without taking bracket locks.
    ///
    /// # Safety
    ///
    /// No other thread may use the allocator concurrently.
    pub unsafe fn alloc_thread_unsafe(&self, size: usize) -> Option<Allocation> {
        if size > LARGE_SIZE_THRESHOLD {
            return self.alloc_large_object(size);
        }
        let (idx, bracket_size) = self.table.size_to_index_and_bracket_size(size);
        let slot = self.alloc_from_current_run_unlocked(self.bracket_unlocked(idx), idx);
        NonNull::new(slot).map(|ptr| Allocation {
            ptr,
            bytes_allocated: bracket_size,
            usable_size: bracket_size,
            bytes_tl_bulk_allocated: bracket_size,
        })
    }

    fn alloc_large_object(&self, size: usize) -> Option<Allocation> {
        let num_pages = align_usize(size, PAGE_SIZE) / PAGE_SIZE;
        let begin =
            self.with_pages(|state| self.alloc_pages(state, num_pages, PageMapKind::LargeObject))?;
        let total_bytes = num_pages * PAGE_SIZE;
        log::trace!(
            "slab: large object {:p}-{:p} ({})",
            begin,
            unsafe { begin.add(total_bytes) },
            formatted_size(total_bytes)
        );
        Some(Allocation {
            ptr: unsafe { NonNull::new_unchecked(begin) },
            bytes_allocated: total_bytes,
            usable_size: total_bytes,
            bytes_tl_bulk_allocated: total_bytes,
        })
    }

    fn alloc_from_run(&self, ctx: &ThreadLocalRuns, size: usize) -> Option<Allocation> {
        let (idx, bracket_size) = self.table.size_to_index_and_bracket_size(size);
        let slot;
        let mut bytes_tl_bulk_allocated = 0;
        if idx < self.num_thread_local_brackets {
            let thread_local_run = ctx.get(idx);
            let mut slot_addr = thread_local_run.map_or(null_mut(), |run| {
                run.claim_for_current_thread();
                run.alloc_slot()
            });
            if slot_addr.is_null() {
                // The run is full. Take back slots other threads freed into it, or refill.
                let run = self.with_bracket(idx, |state| {
                    if let Some(run) = thread_local_run {
                        let (added, _) = run.merge_thread_local_free_list_to_free_list();
                        if added {
                            return Some(run);
                        }
                        run.set_is_thread_local(false);
                        state.full_runs.insert(run);
                    }
                    let run = self.refill_run(state, idx)?;
                    run.set_is_thread_local(true);
                    Some(run)
                });
                ctx.set(idx, run);
                let run = run?;
                bytes_tl_bulk_allocated = run.number_of_free_slots() * bracket_size;
                slot_addr = run.alloc_slot();
            }
            slot = slot_addr;
        } else {
            slot = self.with_bracket(idx, |state| self.alloc_from_current_run_unlocked(state, idx));
            if slot.is_null() {
                return None;
            }
            bytes_tl_bulk_allocated = bracket_size;
        }
        debug_assert!(!slot.is_null());
        Some(Allocation {
            ptr: unsafe { NonNull::new_unchecked(slot) },
            bytes_allocated: bracket_size,
            usable_size: bracket_size,
            bytes_tl_bulk_allocated,
        })
    }

    fn alloc_from_current_run_unlocked(&self, state: &mut BracketState, idx: usize) -> *mut u8 {
        let mut slot = state
            .current_run
            .map_or(null_mut(), |run| run.alloc_slot());
        if slot.is_null() {
            if let Some(run) = state.current_run.take() {
                state.full_runs.insert(run);
            }
            let run = match self.refill_run(state, idx) {
                Some(run) => run,
                None => return null_mut(),
            };
            run.set_is_thread_local(false);
            state.current_run = Some(run);
            slot = run.alloc_slot();
        }
        slot
    }

    /// Takes the lowest non-full run of the bracket, or carves a new one.
    fn refill_run(&self, state: &mut BracketState, idx: usize) -> Option<RunPtr> {
        let lowest = state.non_full_runs.keys().next().copied();
        if let Some(key) = lowest {
            return state.non_full_runs.remove(&key);
        }
        self.alloc_run(idx)
    }

    fn alloc_run(&self, idx: usize) -> Option<RunPtr> {
        let num_pages = self.table.num_pages(idx);
        self.with_pages(|state| {
            let begin = self.alloc_pages(state, num_pages, PageMapKind::Run)?;
            let run = RunPtr::allocate(unsafe { Run::new(&self.table, begin, idx) });
            state.run_table[self.to_page_map_index(begin)] = Some(run);
            log::trace!(
                "slab: new run {:p} for bracket {} ({} slots of {})",
                begin,
                idx,
                run.num_slots(),
                run.bracket_size()
            );
            Some(run)
        })
    }

    fn morecore(&self, offset: usize, increment: isize) {
        unsafe {
            let start = self.base.add(offset);
            if increment > 0 {
                self.mem_map.commit(start, increment as usize);
            } else if increment < 0 {
                let size = (-increment) as usize;
                self.mem_map.decommit(start.sub(size), size);
            }
        }
    }

    /// Removes the free page run at `pm_idx`, splitting off anything past `byte_size`.
    fn take_free_page_run(
        &self,
        state: &mut PageState,
        pm_idx: usize,
        byte_size: usize,
    ) -> *mut u8 {
        let fpr_size = state.free_page_run_size[pm_idx];
        debug_assert!(byte_size <= fpr_size);
        state.free_page_runs.remove(&pm_idx);
        state.free_page_run_size[pm_idx] = 0;
        if byte_size < fpr_size {
            let remainder = pm_idx + byte_size / PAGE_SIZE;
            state.free_page_run_size[remainder] = fpr_size - byte_size;
            state.free_page_runs.insert(remainder);
        }
        self.page_addr(pm_idx)
    }

    /// Free page run that ends exactly at the footprint, if any.
    fn last_free_page_run(&self, state: &PageState) -> Option<usize> {
        state
            .free_page_runs
            .iter()
            .next_back()
            .copied()
            .filter(|&last| last * PAGE_SIZE + state.free_page_run_size[last] == state.footprint)
    }

    fn alloc_pages(
        &self,
        state: &mut PageState,
        num_pages: usize,
        kind: PageMapKind,
    ) -> Option<*mut u8> {
        let req_byte_size = num_pages * PAGE_SIZE;
        // Lowest address free page run that is large enough.
        let mut res = state
            .free_page_runs
            .iter()
            .copied()
            .find(|&pm_idx| state.free_page_run_size[pm_idx] >= req_byte_size)
            .map(|pm_idx| self.take_free_page_run(state, pm_idx, req_byte_size));

        if res.is_none() && state.capacity > state.footprint {
            let last = self.last_free_page_run(state);
            let last_size = last.map_or(0, |last| state.free_page_run_size[last]);
            if state.capacity - state.footprint + last_size >= req_byte_size {
                let increment = (2 * MB)
                    .max(req_byte_size - last_size)
                    .min(state.capacity - state.footprint);
                debug_assert!(is_aligned(increment, PAGE_SIZE));
                let new_footprint = state.footprint + increment;
                self.morecore(state.footprint, increment as isize);
                let grown = match last {
                    Some(last) => {
                        state.free_page_run_size[last] += increment;
                        last
                    }
                    None => {
                        let pm_idx = state.footprint / PAGE_SIZE;
                        state.free_page_run_size[pm_idx] = increment;
                        state.free_page_runs.insert(pm_idx);
                        pm_idx
                    }
                };
                state.footprint = new_footprint;
                state.page_map_size = new_footprint / PAGE_SIZE;
                log::trace!("slab: footprint grew to {}", formatted_size(new_footprint));
                if state.free_page_run_size[grown] >= req_byte_size {
                    res = Some(self.take_free_page_run(state, grown, req_byte_size));
                }
            }
        }

        let begin = res?;
        let pm_idx = self.to_page_map_index(begin);
        let part = match kind {
            PageMapKind::Run => PageMapKind::RunPart,
            PageMapKind::LargeObject => PageMapKind::LargeObjectPart,
            _ => unreachable!("pages can not be allocated as {:?}", kind),
        };
        state.page_map[pm_idx] = kind;
        for i in 1..num_pages {
            state.page_map[pm_idx + i] = part;
        }
        Some(begin)
    }

    fn should_release_pages(&self, state: &PageState, fpr: usize) -> bool {
        let byte_size = state.free_page_run_size[fpr];
        let at_end = fpr * PAGE_SIZE + byte_size == state.footprint;
        let large = byte_size >= self.page_release_size_threshold;
        match self.page_release_mode {
            PageReleaseMode::None => false,
            PageReleaseMode::End => at_end,
            PageReleaseMode::Size => large,
            PageReleaseMode::SizeAndEnd => large && at_end,
            PageReleaseMode::All => true,
        }
    }

    fn release_page_range(&self, state: &mut PageState, start: usize, end: usize) -> usize {
        self.mem_map
            .dontneed(self.page_addr(start), (end - start) * PAGE_SIZE);
        let mut reclaimed_bytes = 0;
        for kind in state.page_map[start..end].iter_mut() {
            if *kind == PageMapKind::Empty {
                *kind = PageMapKind::Released;
                reclaimed_bytes += PAGE_SIZE;
            }
        }
        if reclaimed_bytes != 0 {
            log::trace!(
                "slab: released {} at {:p}",
                formatted_size(reclaimed_bytes),
                self.page_addr(start)
            );
        }
        reclaimed_bytes
    }

    /// Frees the run or large object starting at `ptr` and returns its byte size.
    fn free_pages(&self, state: &mut PageState, ptr: *mut u8, already_zero: bool) -> usize {
        let pm_idx = self.to_page_map_index(ptr);
        let kind = state.page_map[pm_idx];
        let part = match kind {
            PageMapKind::Run => PageMapKind::RunPart,
            PageMapKind::LargeObject => PageMapKind::LargeObjectPart,
            _ => unreachable!("page {} of kind {:?} can not be freed", pm_idx, kind),
        };
        let mut num_pages = 1;
        state.page_map[pm_idx] = PageMapKind::Empty;
        let mut idx = pm_idx + 1;
        while idx < state.page_map_size && state.page_map[idx] == part {
            state.page_map[idx] = PageMapKind::Empty;
            num_pages += 1;
            idx += 1;
        }
        if kind == PageMapKind::Run {
            if let Some(run) = state.run_table[pm_idx].take() {
                unsafe { run.destroy() };
            }
        }
        let byte_size = num_pages * PAGE_SIZE;
        if !already_zero && !self.does_release_all_pages() {
            unsafe {
                std::ptr::write_bytes(ptr, 0, byte_size);
            }
        }

        let mut fpr = pm_idx;
        let mut fpr_size = byte_size;
        // Coalesce with the following free page runs.
        loop {
            let next = fpr + fpr_size / PAGE_SIZE;
            if !state.free_page_runs.remove(&next) {
                break;
            }
            fpr_size += state.free_page_run_size[next];
            state.free_page_run_size[next] = 0;
        }
        // And with the preceding ones.
        loop {
            let prev = match state.free_page_runs.range(..fpr).next_back() {
                Some(&prev) if prev + state.free_page_run_size[prev] / PAGE_SIZE == fpr => prev,
                _ => break,
            };
            state.free_page_runs.remove(&prev);
            fpr_size += state.free_page_run_size[prev];
            state.free_page_run_size[fpr] = 0;
            fpr = prev;
        }
        state.free_page_run_size[fpr] = fpr_size;
        if self.should_release_pages(state, fpr) {
            self.release_page_range(state, fpr, fpr + fpr_size / PAGE_SIZE);
        }
        state.free_page_runs.insert(fpr);
        byte_size
    }

    fn owner_of(&self, state: &PageState, ptr: *mut u8) -> Owner {
        let mut pm_idx = self.to_page_map_index(ptr);
        match state.page_map[pm_idx] {
            PageMapKind::LargeObject => {
                assert!(
                    is_aligned(ptr as usize, PAGE_SIZE),
                    "{:p} is not the start of a large object",
                    ptr
                );
                return Owner::LargeObject;
            }
            PageMapKind::RunPart => {
                while state.page_map[pm_idx] != PageMapKind::Run {
                    pm_idx -= 1;
                }
            }
            PageMapKind::Run => {}
            kind => unreachable!("{:p} points into a page of kind {:?}", ptr, kind),
        }
        match state.run_table[pm_idx] {
            Some(run) => Owner::Run(run),
            None => unreachable!("page {} has no run", pm_idx),
        }
    }

    /// Frees `ptr` and returns the number of bytes released.
    pub fn free(&self, ptr: *mut u8) -> usize {
        let _bulk = self.bulk_free_lock.read();
        let owner = self.with_pages(|state| match self.owner_of(state, ptr) {
            Owner::LargeObject => Err(self.free_pages(state, ptr, false)),
            Owner::Run(run) => Ok(run),
        });
        match owner {
            Ok(run) => self.free_from_run(ptr, run),
            Err(freed) => freed,
        }
    }

    fn free_from_run(&self, ptr: *mut u8, run: RunPtr) -> usize {
        let idx = run.bracket_index();
        let bracket_size = run.bracket_size();
        self.with_bracket(idx, |state| {
            if run.is_owned_by_current_thread() {
                run.free_slot(ptr);
                return;
            }
            if run.is_thread_local() {
                // The owner picks these up once its free list runs dry.
                run.add_to_thread_local_free_list(ptr);
                return;
            }
            let run_was_full = run.is_full();
            run.free_slot(ptr);
            let key = run.begin() as usize;
            if run.is_all_free() {
                state.non_full_runs.remove(&key);
                if run_was_full {
                    state.full_runs.remove(&run);
                }
                if state.current_run == Some(run) {
                    state.current_run = None;
                }
                unsafe { run.zero_header() };
                self.with_pages(|pages| self.free_pages(pages, run.begin(), true));
            } else if state.current_run != Some(run) && !state.non_full_runs.contains_key(&key) {
                if run_was_full {
                    state.full_runs.remove(&run);
                }
                state.non_full_runs.insert(key, run);
            }
        });
        bracket_size
    }

    /// Frees a batch of objects, taking each affected bracket lock once per run. Returns the
    /// number of bytes freed.
    pub fn bulk_free(&self, ptrs: &[*mut u8]) -> usize {
        let _bulk = self.bulk_free_lock.write();
        let mut freed_bytes = 0;
        let mut runs = Vec::new();
        self.with_pages(|state| {
            for &ptr in ptrs {
                match self.owner_of(state, ptr) {
                    Owner::LargeObject => freed_bytes += self.free_pages(state, ptr, false),
                    Owner::Run(run) => {
                        freed_bytes += run.add_to_bulk_free_list(ptr);
                        if !run.is_to_be_bulk_freed() {
                            run.set_to_be_bulk_freed(true);
                            runs.push(run);
                        }
                    }
                }
            }
        });

        for run in runs {
            let idx = run.bracket_index();
            self.with_bracket(idx, |state| {
                run.set_to_be_bulk_freed(false);
                if run.is_thread_local() {
                    run.merge_bulk_free_list_to_thread_local_free_list();
                    return;
                }
                let run_was_full = run.is_full();
                run.merge_bulk_free_list_to_free_list();
                let run_was_current = state.current_run == Some(run);
                let key = run.begin() as usize;
                if run.is_all_free() {
                    if !run_was_current {
                        if run_was_full {
                            state.full_runs.remove(&run);
                        } else {
                            state.non_full_runs.remove(&key);
                        }
                        unsafe { run.zero_header() };
                        self.with_pages(|pages| self.free_pages(pages, run.begin(), true));
                    }
                } else if run_was_full && !run_was_current {
                    state.full_runs.remove(&run);
                    state.non_full_runs.insert(key, run);
                }
            });
        }
        freed_bytes
    }

    /// Hands a run that is no longer current or thread-local back to the bracket.
    fn revoke_run(&self, state: &mut BracketState, run: RunPtr) {
        if run.is_full() {
            state.full_runs.insert(run);
        } else if run.is_all_free() {
            unsafe { run.zero_header() };
            self.with_pages(|pages| self.free_pages(pages, run.begin(), true));
        } else {
            state.non_full_runs.insert(run.begin() as usize, run);
        }
    }

    /// Returns the runs of `ctx` to the shared pool. Returns the bytes of the free slots left
    /// in them, which were counted as allocated when the runs were handed out.
    pub fn revoke_thread_local_runs(&self, ctx: &ThreadLocalRuns) -> usize {
        let mut free_bytes = 0;
        for idx in 0..ctx.len() {
            self.with_bracket(idx, |state| {
                if let Some(run) = ctx.get(idx) {
                    ctx.set(idx, None);
                    debug_assert!(run.is_thread_local());
                    free_bytes += run.number_of_free_slots() * run.bracket_size();
                    // Slots freed by other threads; bulk frees were already merged into the
                    // thread-local list under this lock.
                    run.merge_thread_local_free_list_to_free_list();
                    run.set_is_thread_local(false);
                    debug_assert!(!state.non_full_runs.contains_key(&(run.begin() as usize)));
                    debug_assert!(!state.full_runs.contains(&run));
                    self.revoke_run(state, run);
                }
            });
        }
        free_bytes
    }

    /// Revokes the shared current runs of the thread-local brackets, which only thread-unsafe
    /// allocation fills.
    pub fn revoke_thread_unsafe_current_runs(&self) {
        for idx in 0..self.num_thread_local_brackets {
            self.with_bracket(idx, |state| {
                if let Some(run) = state.current_run.take() {
                    self.revoke_run(state, run);
                }
            });
        }
    }

    /// Revokes the runs of every attached thread. Threads must not allocate meanwhile.
    pub fn revoke_all_thread_local_runs(&self) -> usize {
        let free_bytes = self
            .threads
            .lock()
            .iter()
            .map(|ctx| self.revoke_thread_local_runs(ctx))
            .sum();
        self.revoke_thread_unsafe_current_runs();
        free_bytes
    }

    pub fn assert_thread_local_runs_are_revoked(&self, ctx: &ThreadLocalRuns) {
        for idx in 0..ctx.len() {
            self.with_bracket(idx, |_| {
                assert!(
                    ctx.get(idx).is_none(),
                    "thread-local run of bracket {} was not revoked",
                    idx
                );
            });
        }
    }

    pub fn assert_all_thread_local_runs_are_revoked(&self) {
        for ctx in self.threads.lock().iter() {
            self.assert_thread_local_runs_are_revoked(ctx);
        }
        for idx in 0..self.num_thread_local_brackets {
            self.with_bracket(idx, |state| {
                assert!(
                    state.current_run.is_none(),
                    "current run of thread-local bracket {} was not revoked",
                    idx
                );
            });
        }
    }

    pub fn can_alloc_from_thread_local_run(&self, ctx: &ThreadLocalRuns, size: usize) -> bool {
        if !self.is_size_for_thread_local(size) {
            return false;
        }
        ctx.get(BracketTable::size_to_index(size))
            .map_or(false, |run| !run.is_full())
    }

    /// Allocates from the thread's current run only, never refilling it.
    pub fn alloc_from_thread_local_run(
        &self,
        ctx: &ThreadLocalRuns,
        size: usize,
    ) -> Option<Allocation> {
        if !self.is_size_for_thread_local(size) {
            return None;
        }
        let (idx, bracket_size) = self.table.size_to_index_and_bracket_size(size);
        let run = ctx.get(idx)?;
        NonNull::new(run.alloc_slot()).map(|ptr| Allocation {
            ptr,
            bytes_allocated: bracket_size,
            usable_size: bracket_size,
            bytes_tl_bulk_allocated: 0,
        })
    }

    /// Gives a slot that was just taken from the thread's own run back to it. Returns false
    /// when `ptr` does not belong to that run.
    pub fn free_from_thread_local_run(
        &self,
        ctx: &ThreadLocalRuns,
        size: usize,
        ptr: *mut u8,
    ) -> bool {
        if !self.is_size_for_thread_local(size) {
            return false;
        }
        match ctx.get(BracketTable::size_to_index(size)) {
            Some(run) if run.contains(ptr) => {
                run.free_slot(ptr);
                true
            }
            _ => false,
        }
    }

    /// Upper bound of `bytes_tl_bulk_allocated` for a request of `size` bytes.
    pub fn max_bytes_bulk_allocated_for(&self, size: usize) -> usize {
        if size > LARGE_SIZE_THRESHOLD {
            return self.usable_size_for(size);
        }
        let (idx, bracket_size) = self.table.size_to_index_and_bracket_size(size);
        if idx < self.num_thread_local_brackets {
            self.table.num_slots(idx) * bracket_size
        } else {
            bracket_size
        }
    }

    pub fn usable_size_for(&self, bytes: usize) -> usize {
        if bytes > LARGE_SIZE_THRESHOLD {
            align_usize(bytes, PAGE_SIZE)
        } else {
            self.table.round_to_bracket_size(bytes)
        }
    }

    /// Usable size of the allocation at `ptr`.
    pub fn usable_size(&self, ptr: *const u8) -> usize {
        self.with_pages(|state| {
            let mut pm_idx = self.to_page_map_index(ptr);
            match state.page_map[pm_idx] {
                PageMapKind::LargeObject => {
                    let mut num_pages = 1;
                    let mut idx = pm_idx + 1;
                    while idx < state.page_map_size
                        && state.page_map[idx] == PageMapKind::LargeObjectPart
                    {
                        num_pages += 1;
                        idx += 1;
                    }
                    num_pages * PAGE_SIZE
                }
                PageMapKind::Run | PageMapKind::RunPart => {
                    while state.page_map[pm_idx] != PageMapKind::Run {
                        pm_idx -= 1;
                    }
                    match state.run_table[pm_idx] {
                        Some(run) => {
                            debug_assert_eq!(
                                (ptr as usize - run.first_slot() as usize) % run.bracket_size(),
                                0
                            );
                            run.bracket_size()
                        }
                        None => unreachable!("page {} has no run", pm_idx),
                    }
                }
                kind => unreachable!("{:p} points into a page of kind {:?}", ptr, kind),
            }
        })
    }

    pub fn footprint(&self) -> usize {
        self.with_pages(|state| state.footprint)
    }

    pub fn footprint_limit(&self) -> usize {
        self.with_pages(|state| state.capacity)
    }

    /// Sets the footprint limit. It never drops below the current footprint.
    pub fn set_footprint_limit(&self, bytes: usize) {
        let bytes = align_usize(bytes, PAGE_SIZE);
        assert!(bytes <= self.max_capacity);
        self.with_pages(|state| {
            state.capacity = bytes.max(state.footprint);
            log::trace!("slab: footprint limit {}", formatted_size(state.capacity));
        });
    }

    /// Shrinks the footprint by the free page run at its end. Returns true if anything was
    /// given back.
    pub fn trim(&self) -> bool {
        self.with_pages(|state| {
            let last = match self.last_free_page_run(state) {
                Some(last) => last,
                None => return false,
            };
            state.free_page_runs.remove(&last);
            let decrement = state.free_page_run_size[last];
            state.free_page_run_size[last] = 0;
            for kind in state.page_map[last..last + decrement / PAGE_SIZE].iter_mut() {
                *kind = PageMapKind::Released;
            }
            let old_footprint = state.footprint;
            self.morecore(old_footprint, -(decrement as isize));
            state.footprint = old_footprint - decrement;
            state.page_map_size = state.footprint / PAGE_SIZE;
            log::trace!(
                "slab: trimmed {}, footprint {}",
                formatted_size(decrement),
                formatted_size(state.footprint)
            );
            true
        })
    }

    /// Releases every empty page to the OS. Returns the number of bytes released.
    pub fn release_pages(&self) -> usize {
        self.with_pages(|state| {
            let mut reclaimed_bytes = 0;
            let mut i = 0;
            while i < state.page_map_size {
                match state.page_map[i] {
                    PageMapKind::Released | PageMapKind::Empty => {
                        assert!(
                            state.free_page_runs.contains(&i),
                            "free page {} does not start a free page run",
                            i
                        );
                        let fpr_pages = state.free_page_run_size[i] / PAGE_SIZE;
                        reclaimed_bytes += self.release_page_range(state, i, i + fpr_pages);
                        i += fpr_pages;
                    }
                    _ => i += 1,
                }
            }
            reclaimed_bytes
        })
    }

    /// Calls `handler(start, end, used_bytes)` for every slot, large object and free page
    /// run. Threads must not allocate meanwhile.
    pub fn inspect_all(&self, mut handler: impl FnMut(*mut u8, *mut u8, usize)) {
        self.with_pages(|state| {
            let mut i = 0;
            while i < state.page_map_size {
                match state.page_map[i] {
                    PageMapKind::Released | PageMapKind::Empty => {
                        let fpr_size = state.free_page_run_size[i];
                        assert!(fpr_size != 0, "free page {} does not start a free page run", i);
                        let start = self.page_addr(i);
                        handler(start, unsafe { start.add(fpr_size) }, 0);
                        i += fpr_size / PAGE_SIZE;
                    }
                    PageMapKind::LargeObject => {
                        let mut num_pages = 1;
                        while i + num_pages < state.page_map_size
                            && state.page_map[i + num_pages] == PageMapKind::LargeObjectPart
                        {
                            num_pages += 1;
                        }
                        let start = self.page_addr(i);
                        let used_bytes = num_pages * PAGE_SIZE;
                        handler(start, unsafe { start.add(used_bytes) }, used_bytes);
                        i += num_pages;
                    }
                    PageMapKind::Run => {
                        let run = match state.run_table[i] {
                            Some(run) => run,
                            None => unreachable!("page {} has no run", i),
                        };
                        run.inspect_all_slots(&mut handler);
                        i += self.table.num_pages(run.bracket_index());
                    }
                    kind => unreachable!("page {} of kind {:?} starts nothing", i, kind),
                }
            }
        });
    }

    pub fn bytes_allocated(&self) -> usize {
        let mut bytes = 0;
        self.inspect_all(|_, _, used_bytes| bytes += used_bytes);
        bytes
    }

    pub fn objects_allocated(&self) -> usize {
        let mut objects = 0;
        self.inspect_all(|_, _, used_bytes| {
            if used_bytes != 0 {
                objects += 1;
            }
        });
        objects
    }

    /// Checks the page map, the free page runs and every run against each other. Threads must
    /// not allocate meanwhile.
    pub fn verify(&self) {
        let mut runs = Vec::new();
        self.with_pages(|state| {
            for &fpr in state.free_page_runs.iter() {
                let fpr_size = state.free_page_run_size[fpr];
                assert!(
                    fpr_size != 0 && is_aligned(fpr_size, PAGE_SIZE),
                    "free page run {} has bad size {}",
                    fpr,
                    fpr_size
                );
                let end = fpr + fpr_size / PAGE_SIZE;
                assert!(end <= state.page_map_size, "free page run {} is past the footprint", fpr);
                for i in fpr..end {
                    assert!(
                        matches!(state.page_map[i], PageMapKind::Released | PageMapKind::Empty),
                        "page {} of free page run {} is {:?}",
                        i,
                        fpr,
                        state.page_map[i]
                    );
                }
            }
            let mut i = 0;
            while i < state.page_map_size {
                match state.page_map[i] {
                    PageMapKind::Released | PageMapKind::Empty => {
                        assert!(
                            state.free_page_runs.contains(&i),
                            "free page {} does not start a free page run",
                            i
                        );
                        i += state.free_page_run_size[i] / PAGE_SIZE;
                    }
                    PageMapKind::LargeObject => {
                        i += 1;
                        while i < state.page_map_size
                            && state.page_map[i] == PageMapKind::LargeObjectPart
                        {
                            i += 1;
                        }
                    }
                    PageMapKind::Run => {
                        let run = match state.run_table[i] {
                            Some(run) => run,
                            None => panic!("page {} starts a run without metadata", i),
                        };
                        assert_eq!(run.begin(), self.page_addr(i));
                        let num_pages = self.table.num_pages(run.bracket_index());
                        for j in 1..num_pages {
                            assert_eq!(state.page_map[i + j], PageMapKind::RunPart);
                        }
                        runs.push(run);
                        i += num_pages;
                    }
                    kind => panic!("page {} of kind {:?} starts nothing", i, kind),
                }
            }
            for i in state.page_map_size..state.page_map.len() {
                assert_eq!(state.page_map[i], PageMapKind::Released);
            }
        });

        let threads = self.threads.lock();
        for run in runs {
            let idx = run.bracket_index();
            self.with_bracket(idx, |state| {
                run.verify();
                let in_non_full = state.non_full_runs.contains_key(&(run.begin() as usize));
                let in_full = state.full_runs.contains(&run);
                let is_current = state.current_run == Some(run);
                if run.is_thread_local() {
                    assert!(!in_non_full && !in_full && !is_current, "{:?}", run);
                    assert!(
                        threads.iter().any(|ctx| idx < ctx.len() && ctx.get(idx) == Some(run)),
                        "thread-local {:?} has no owner",
                        run
                    );
                } else {
                    assert_eq!(
                        in_non_full as u8 + in_full as u8 + is_current as u8,
                        1,
                        "{:?} must be in exactly one place",
                        run
                    );
                    assert!(!in_full || run.is_full(), "{:?} is in the full set", run);
                    assert!(!in_non_full || !run.is_full(), "{:?} is in the non-full set", run);
                }
            });
        }
    }

    pub fn dump_page_map(&self) -> String {
        self.with_pages(|state| {
            let mut out = String::new();
            for i in 0..state.page_map_size {
                let kind = state.page_map[i];
                let _ = match kind {
                    PageMapKind::Released | PageMapKind::Empty
                        if state.free_page_runs.contains(&i) =>
                    {
                        writeln!(
                            out,
                            "[{}]={:?} (FPR start, fpr_size={})",
                            i, kind, state.free_page_run_size[i]
                        )
                    }
                    PageMapKind::Released | PageMapKind::Empty => {
                        writeln!(out, "[{}]={:?} (FPR part)", i, kind)
                    }
                    PageMapKind::Run => match state.run_table[i] {
                        Some(run) => writeln!(
                            out,
                            "[{}]=Run (start, idx={}, bracket_size={})",
                            i,
                            run.bracket_index(),
                            run.bracket_size()
                        ),
                        None => writeln!(out, "[{}]=Run (no metadata)", i),
                    },
                    _ => writeln!(out, "[{}]={:?}", i, kind),
                };
            }
            out
        })
    }

    /// Drops every run and large object and returns the footprint to its starting size.
    pub fn reset(&self) {
        self.revoke_all_thread_local_runs();
        let _bulk = self.bulk_free_lock.write();
        for idx in 0..NUM_BRACKETS {
            self.with_bracket(idx, |state| {
                state.current_run = None;
                state.non_full_runs.clear();
                state.full_runs.clear();
            });
        }
        self.with_pages(|state| {
            for run in state.run_table.iter_mut() {
                if let Some(run) = run.take() {
                    unsafe { run.destroy() };
                }
            }
            self.mem_map.dontneed(self.base, state.footprint);
            for kind in state.page_map.iter_mut() {
                *kind = PageMapKind::Released;
            }
            for size in state.free_page_run_size.iter_mut() {
                *size = 0;
            }
            state.free_page_runs.clear();
            state.footprint = self.starting_size;
            state.page_map_size = self.starting_size / PAGE_SIZE;
            if self.starting_size != 0 {
                state.free_page_runs.insert(0);
                state.free_page_run_size[0] = self.starting_size;
            }
        });
    }
}

impl Drop for SlabAllocator {
    fn drop(&mut self) {
        for run in self.pages.get_mut().run_table.iter_mut() {
            if let Some(run) = run.take() {
                unsafe { run.destroy() };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::DEFAULT_PAGE_RELEASE_SIZE_THRESHOLD, utils::KB};

    fn slab(limit: usize) -> SlabAllocator {
        SlabAllocator::new(PAGE_SIZE, limit, limit, &SlabConfig::default()).unwrap()
    }

    #[test]
    fn test_alloc_40_reuses_freed_slot() {
        let slab = slab(4 * MB);
        let ctx = slab.attach_thread();
        let a = slab.alloc(&ctx, 40).unwrap();
        assert_eq!(a.bytes_allocated, 48);
        assert_eq!(a.usable_size, 48);
        assert_eq!(slab.usable_size(a.ptr.as_ptr()), 48);
        let b = slab.alloc(&ctx, 40).unwrap();
        assert_eq!(b.ptr.as_ptr() as usize - a.ptr.as_ptr() as usize, 48);

        assert_eq!(slab.free(a.ptr.as_ptr()), 48);
        let c = slab.alloc(&ctx, 40).unwrap();
        assert_eq!(c.ptr, a.ptr);
        assert_eq!(c.bytes_tl_bulk_allocated, 0);

        slab.free(b.ptr.as_ptr());
        slab.free(c.ptr.as_ptr());
        let d = slab.alloc(&ctx, 40).unwrap();
        assert_eq!(d.ptr, c.ptr);
        slab.free(d.ptr.as_ptr());
        slab.detach_thread(&ctx);
        slab.verify();
    }

    #[test]
    fn test_free_from_other_thread_is_deferred_to_owner() {
        let slab = slab(4 * MB);
        let ctx = slab.attach_thread();
        let a = slab.alloc(&ctx, 40).unwrap();
        let b = slab.alloc(&ctx, 40).unwrap();
        let addr = a.ptr.as_ptr() as usize;
        crossbeam_utils::thread::scope(|scope| {
            scope.spawn(|_| slab.free(addr as *mut u8));
        })
        .unwrap();
        // Parked on the thread-local free list until the owner's run runs dry.
        let c = slab.alloc(&ctx, 40).unwrap();
        assert_ne!(c.ptr, a.ptr);
        assert_eq!(c.ptr.as_ptr() as usize - b.ptr.as_ptr() as usize, 48);
        slab.free(b.ptr.as_ptr());
        slab.free(c.ptr.as_ptr());
        slab.detach_thread(&ctx);
        slab.verify();
        assert_eq!(slab.bytes_allocated(), 0);
    }

    #[test]
    fn test_shared_bracket_lifo_reuse() {
        let slab = slab(4 * MB);
        let ctx = slab.attach_thread();
        // 400 bytes is above the thread-local brackets and goes through the current run.
        let a = slab.alloc(&ctx, 400).unwrap();
        assert_eq!(a.bytes_tl_bulk_allocated, 400);
        slab.alloc(&ctx, 400).unwrap();
        slab.free(a.ptr.as_ptr());
        let again = slab.alloc(&ctx, 400).unwrap();
        assert_eq!(again.ptr, a.ptr);
        slab.verify();
    }

    #[test]
    fn test_free_list_accounting() {
        let slab = slab(4 * MB);
        let ctx = slab.attach_thread();
        let idx = BracketTable::size_to_index(256);
        let slots = slab.brackets().num_slots(idx);
        let mut live = vec![];
        for i in 0..3 * slots {
            live.push(slab.alloc(&ctx, 256).unwrap().ptr.as_ptr());
            if i % 5 == 4 {
                slab.free(live.swap_remove(i % live.len()));
            }
            assert_eq!(slab.objects_allocated(), live.len());
        }
        for ptr in live.drain(..) {
            slab.free(ptr);
        }
        assert_eq!(slab.bytes_allocated(), 0);
        slab.verify();
    }

    #[test]
    fn test_thread_local_runs() {
        let slab = slab(4 * MB);
        let ctx = slab.attach_thread();
        assert!(!slab.can_alloc_from_thread_local_run(&ctx, 16));
        let first = slab.alloc(&ctx, 16).unwrap();
        let slots = slab.brackets().num_slots(0);
        assert_eq!(first.bytes_tl_bulk_allocated, slots * 16);
        assert_eq!(slab.max_bytes_bulk_allocated_for(16), slots * 16);
        assert!(slab.can_alloc_from_thread_local_run(&ctx, 16));

        let second = slab.alloc_from_thread_local_run(&ctx, 16).unwrap();
        assert_eq!(second.bytes_tl_bulk_allocated, 0);
        assert!(slab.free_from_thread_local_run(&ctx, 16, second.ptr.as_ptr()));
        assert!(!slab.free_from_thread_local_run(&ctx, 32, second.ptr.as_ptr()));
        slab.verify();

        let free_bytes = slab.revoke_all_thread_local_runs();
        assert_eq!(free_bytes, (slots - 1) * 16);
        slab.assert_all_thread_local_runs_are_revoked();
        slab.verify();
        assert_eq!(slab.bytes_allocated(), 16);
        slab.free(first.ptr.as_ptr());
        assert_eq!(slab.bytes_allocated(), 0);
        slab.verify();
    }

    #[test]
    fn test_free_into_foreign_thread_local_run() {
        let slab = slab(4 * MB);
        let owner = slab.attach_thread();
        let slots = slab.brackets().num_slots(1);
        let objects = (0..slots)
            .map(|_| slab.alloc(&owner, 32).unwrap().ptr.as_ptr())
            .collect::<Vec<_>>();
        assert!(!slab.can_alloc_from_thread_local_run(&owner, 32));
        let victim = objects[3] as usize;
        crossbeam_utils::thread::scope(|scope| {
            scope.spawn(|_| slab.free(victim as *mut u8));
        })
        .unwrap();
        assert!(!slab.can_alloc_from_thread_local_run(&owner, 32));
        // The slot went to the thread-local free list and is merged back on the next miss.
        let next = slab.alloc(&owner, 32).unwrap();
        assert_eq!(next.ptr.as_ptr(), objects[3]);
        assert_eq!(next.bytes_tl_bulk_allocated, 32);
        slab.verify();
    }

    #[test]
    fn test_bulk_free() {
        let slab = slab(8 * MB);
        let ctx = slab.attach_thread();
        let mut ptrs = vec![];
        for i in 0..1000 {
            let size = [24, 64, 200, 700, 1500, 5000][i % 6];
            ptrs.push(slab.alloc(&ctx, size).unwrap().ptr.as_ptr());
        }
        let before = slab.bytes_allocated();
        slab.revoke_all_thread_local_runs();
        let freed = slab.bulk_free(&ptrs);
        assert_eq!(freed, before);
        assert_eq!(slab.bytes_allocated(), 0);
        assert_eq!(slab.objects_allocated(), 0);
        slab.verify();
    }

    #[test]
    fn test_bulk_free_into_thread_local_run() {
        let slab = slab(4 * MB);
        let ctx = slab.attach_thread();
        let a = slab.alloc(&ctx, 64).unwrap().ptr.as_ptr();
        let b = slab.alloc(&ctx, 64).unwrap().ptr.as_ptr();
        assert_eq!(slab.bulk_free(&[a]), 64);
        slab.verify();
        slab.revoke_thread_local_runs(&ctx);
        assert_eq!(slab.objects_allocated(), 1);
        slab.free(b);
        slab.verify();
    }

    #[test]
    fn test_freed_memory_is_zeroed() {
        let slab = slab(4 * MB);
        let ctx = slab.attach_thread();
        let a = slab.alloc(&ctx, 100).unwrap();
        unsafe {
            std::ptr::write_bytes(a.ptr.as_ptr(), 0xff, a.usable_size);
        }
        slab.free(a.ptr.as_ptr());
        let b = slab.alloc(&ctx, 100).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(b.ptr.as_ptr(), b.usable_size) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_large_objects_and_coalescing() {
        let slab = slab(16 * MB);
        let ctx = slab.attach_thread();
        let a = slab.alloc(&ctx, 5000).unwrap();
        assert_eq!(a.bytes_allocated, 2 * PAGE_SIZE);
        assert_eq!(slab.usable_size(a.ptr.as_ptr()), 2 * PAGE_SIZE);
        assert_eq!(slab.usable_size_for(5000), 2 * PAGE_SIZE);
        let b = slab.alloc(&ctx, 64 * KB).unwrap();
        let c = slab.alloc(&ctx, PAGE_SIZE).unwrap();
        assert!(slab.dump_page_map().contains("LargeObjectPart"));
        slab.free(b.ptr.as_ptr());
        slab.verify();
        slab.free(a.ptr.as_ptr());
        slab.verify();
        slab.free(c.ptr.as_ptr());
        slab.verify();
        assert_eq!(slab.bytes_allocated(), 0);
        let mut free_runs = 0;
        slab.inspect_all(|_, _, used| {
            assert_eq!(used, 0);
            free_runs += 1;
        });
        assert_eq!(free_runs, 1);
    }

    #[test]
    fn test_footprint_growth_limit_and_trim() {
        let slab = SlabAllocator::new(PAGE_SIZE, 4 * MB, 16 * MB, &SlabConfig::default()).unwrap();
        let ctx = slab.attach_thread();
        assert_eq!(slab.footprint(), PAGE_SIZE);
        let a = slab.alloc(&ctx, MB).unwrap();
        assert_eq!(slab.footprint(), PAGE_SIZE + 2 * MB);
        assert!(slab.alloc(&ctx, 4 * MB).is_none());
        slab.set_footprint_limit(2 * MB);
        assert_eq!(slab.footprint_limit(), slab.footprint());
        assert!(slab.alloc(&ctx, 2 * MB).is_none());
        slab.set_footprint_limit(16 * MB);
        let b = slab.alloc(&ctx, 4 * MB).unwrap();
        slab.free(b.ptr.as_ptr());
        slab.free(a.ptr.as_ptr());
        assert!(slab.trim());
        assert_eq!(slab.footprint(), 0);
        assert!(!slab.trim());
        slab.verify();
        assert!(slab.alloc(&ctx, 64).is_some());
        slab.verify();
    }

    fn release_slab(mode: PageReleaseMode, threshold: usize) -> SlabAllocator {
        let config = SlabConfig {
            page_release_mode: mode,
            page_release_size_threshold: threshold,
            ..Default::default()
        };
        SlabAllocator::new(PAGE_SIZE, 4 * MB, 4 * MB, &config).unwrap()
    }

    fn first_page_released(slab: &SlabAllocator) -> bool {
        let dump = slab.dump_page_map();
        assert!(dump.starts_with("[0]="), "{}", dump);
        dump.starts_with("[0]=Released (FPR start")
    }

    /// Frees a 5 page object in front of a 3 page one, then the 3 page one, which merges
    /// everything into the free pages at the end of the footprint.
    fn free_middle_then_end(slab: &SlabAllocator) -> (bool, bool) {
        let ctx = slab.attach_thread();
        let a = slab.alloc(&ctx, 5 * PAGE_SIZE).unwrap();
        let b = slab.alloc(&ctx, 3 * PAGE_SIZE).unwrap();
        assert_eq!(a.ptr.as_ptr(), slab.begin());
        assert_eq!(b.ptr.as_ptr() as usize, slab.begin() as usize + 5 * PAGE_SIZE);
        slab.free(a.ptr.as_ptr());
        let middle = first_page_released(slab);
        slab.free(b.ptr.as_ptr());
        let end = first_page_released(slab);
        slab.detach_thread(&ctx);
        slab.verify();
        (middle, end)
    }

    #[test]
    fn test_page_release_end_mode() {
        let slab = release_slab(PageReleaseMode::End, 4 * PAGE_SIZE);
        assert_eq!(free_middle_then_end(&slab), (false, true));
    }

    #[test]
    fn test_page_release_size_mode() {
        let slab = release_slab(PageReleaseMode::Size, 4 * PAGE_SIZE);
        assert_eq!(free_middle_then_end(&slab), (true, true));

        // Below the threshold nothing is released, even in the middle.
        let slab = release_slab(PageReleaseMode::Size, 8 * PAGE_SIZE);
        let ctx = slab.attach_thread();
        let a = slab.alloc(&ctx, 5 * PAGE_SIZE).unwrap();
        let b = slab.alloc(&ctx, 3 * PAGE_SIZE).unwrap();
        slab.free(a.ptr.as_ptr());
        assert!(!first_page_released(&slab));
        slab.free(b.ptr.as_ptr());
        slab.detach_thread(&ctx);
    }

    #[test]
    fn test_page_release_size_and_end_mode() {
        let slab = release_slab(PageReleaseMode::SizeAndEnd, 4 * PAGE_SIZE);
        assert_eq!(free_middle_then_end(&slab), (false, true));

        // The default threshold is larger than the whole footprint.
        let slab = release_slab(PageReleaseMode::SizeAndEnd, DEFAULT_PAGE_RELEASE_SIZE_THRESHOLD);
        assert_eq!(free_middle_then_end(&slab), (false, false));
    }

    #[test]
    fn test_page_release_all_and_none_modes() {
        let slab = release_slab(PageReleaseMode::All, DEFAULT_PAGE_RELEASE_SIZE_THRESHOLD);
        assert_eq!(free_middle_then_end(&slab), (true, true));
        let slab = release_slab(PageReleaseMode::None, 0);
        assert_eq!(free_middle_then_end(&slab), (false, false));
    }

    #[test]
    fn test_release_pages_releases_empty_pages() {
        let slab = release_slab(PageReleaseMode::None, 0);
        let ctx = slab.attach_thread();
        let a = slab.alloc(&ctx, 3 * PAGE_SIZE).unwrap();
        slab.free(a.ptr.as_ptr());
        assert!(!first_page_released(&slab));
        assert!(slab.release_pages() >= 3 * PAGE_SIZE);
        assert!(first_page_released(&slab));
        slab.detach_thread(&ctx);
        slab.verify();
    }

    #[test]
    fn test_reset() {
        let slab = slab(4 * MB);
        let ctx = slab.attach_thread();
        for size in [16, 100, 600, 3000].iter() {
            slab.alloc(&ctx, *size).unwrap();
        }
        slab.reset();
        slab.assert_thread_local_runs_are_revoked(&ctx);
        assert_eq!(slab.footprint(), PAGE_SIZE);
        assert_eq!(slab.bytes_allocated(), 0);
        slab.verify();
        assert!(slab.alloc(&ctx, 16).is_some());
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(matches!(
            SlabAllocator::new(2 * MB, MB, 4 * MB, &SlabConfig::default()),
            Err(SpaceError::InitialSizeTooLarge { .. })
        ));
        assert!(matches!(
            SlabAllocator::new(PAGE_SIZE, 8 * MB, 4 * MB, &SlabConfig::default()),
            Err(SpaceError::GrowthLimitTooLarge { .. })
        ));
    }

    #[test]
    fn test_concurrent_alloc_free() {
        let slab = Arc::new(slab(256 * MB));
        let handles = (0..4)
            .map(|t| {
                let slab = slab.clone();
                std::thread::spawn(move || {
                    let ctx = slab.attach_thread();
                    let mut live = Vec::new();
                    for i in 0..10_000usize {
                        let size = 8 + (i * 7 + t * 13) % 1200;
                        let alloc = slab.alloc(&ctx, size).unwrap();
                        live.push(alloc.ptr.as_ptr() as usize);
                        if i % 3 == 0 {
                            let victim = live.swap_remove((i / 3) % live.len());
                            slab.free(victim as *mut u8);
                        }
                    }
                    (ctx, live)
                })
            })
            .collect::<Vec<_>>();
        let mut all = Vec::new();
        for handle in handles {
            let (ctx, live) = handle.join().unwrap();
            all.extend(live);
            slab.revoke_thread_local_runs(&ctx);
        }
        slab.verify();
        assert_eq!(slab.objects_allocated(), all.len());
        let ptrs = all.iter().map(|p| *p as *mut u8).collect::<Vec<_>>();
        slab.bulk_free(&ptrs);
        assert_eq!(slab.objects_allocated(), 0);
        slab.verify();
    }
}
