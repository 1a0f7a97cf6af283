//! Generational copying collector.
//!
//! Reachable objects are evacuated out of the from-space. Objects that already survived the
//! previous cycle are promoted into the main free-list space; younger ones go to the
//! to-space, and the non-moving space catches what does not fit. Most cycles only evacuate
//! the bump pointer spaces and treat every other space as a root. A cycle covering the whole
//! heap follows when promotion or the large object space grew too much since the last one.
//!
//! A cycle runs four phases while the world is stopped: initialize, mark (which also copies),
//! reclaim, finish.
pub mod immune;
mod parallel;

use std::{collections::VecDeque, sync::Arc, time::Instant};

use scoped_threadpool::Pool;

use crate::{
    api::{MarkCallbacks, ObjectModel, ObjectRef, ReferenceProcessor, RootSet, Visitor},
    config::CollectorConfig,
    forwarding::{Claim, ForwardingTable},
    large_space::LargeObjectSpace,
    slab::Allocation,
    space::{same_space, GcRetentionPolicy, LocalBuffer, Space, SpaceKind},
    statistics::{CumulativeStatistics, CycleStatistics, GcCause, ObjectBytePair},
    utils::{formatted_size, mmap::Protection, prefetch, MB},
};
use immune::ImmuneRegion;
use parallel::ParallelTotals;

/// Promoted bytes after which the next cycle covers the whole heap.
pub const BYTES_PROMOTED_THRESHOLD: usize = 4 * MB;
/// Large object space growth after which the next cycle covers the whole heap.
pub const LARGE_OBJECT_BYTES_ALLOCATED_THRESHOLD: usize = 16 * MB;
/// Smaller mark stacks are always drained on the calling thread.
pub const MIN_PARALLEL_MARK_STACK_SIZE: usize = 256;
const PREFETCH_FIFO_SIZE: usize = 4;

/// The heap as seen by one cycle.
pub struct CollectorHeap<'a> {
    pub model: &'a dyn ObjectModel,
    /// Every continuous space, the semi-spaces included.
    pub spaces: Vec<Arc<dyn Space>>,
    pub large_object_space: Option<&'a LargeObjectSpace>,
    /// Promotion destination.
    pub main_space: Option<Arc<dyn Space>>,
    /// Destination of last resort while copying.
    pub non_moving_space: Arc<dyn Space>,
}

impl<'a> CollectorHeap<'a> {
    fn find_continuous_space(&self, obj: *const u8) -> Option<&dyn Space> {
        self.spaces
            .iter()
            .map(|space| &**space)
            .find(|space| space.has_address(obj))
    }

    /// Sets the mark of an object outside the moving spaces. Returns the previous mark.
    fn test_and_set_mark(&self, obj: ObjectRef) -> bool {
        if let Some(space) = self.find_continuous_space(obj) {
            return match space.mark_bitmap() {
                Some(bitmap) => bitmap.atomic_test_and_set(obj),
                None => panic!("{:p} lies in {} which has no mark bitmap", obj, space.name()),
            };
        }
        match self.large_object_space {
            Some(los) if los.has_address(obj) => los.test_and_set_marked(obj),
            _ => panic!("{:p} does not belong to any space", obj),
        }
    }

    fn is_marked(&self, obj: ObjectRef) -> bool {
        if let Some(space) = self.find_continuous_space(obj) {
            return space
                .mark_bitmap()
                .map_or(false, |bitmap| bitmap.test(obj));
        }
        self.large_object_space
            .map_or(false, |los| los.is_marked(obj))
    }
}

/// Counters kept privately by whoever copies objects.
#[derive(Clone, Copy, Default, Debug)]
pub struct CopyCounters {
    pub objects_copied: usize,
    pub bytes_copied: usize,
    pub objects_promoted: usize,
    pub bytes_promoted: usize,
    pub bytes_wasted_promoted: usize,
    pub objects_fallback: usize,
    pub bytes_fallback: usize,
    /// Slots rewritten to point to an object copied earlier.
    pub objects_updated: usize,
    /// Slots left alone because their referent needs no marking this cycle.
    pub objects_skipped: usize,
}

impl CopyCounters {
    fn add(&mut self, other: &CopyCounters) {
        self.objects_copied += other.objects_copied;
        self.bytes_copied += other.bytes_copied;
        self.objects_promoted += other.objects_promoted;
        self.bytes_promoted += other.bytes_promoted;
        self.bytes_wasted_promoted += other.bytes_wasted_promoted;
        self.objects_fallback += other.objects_fallback;
        self.bytes_fallback += other.bytes_fallback;
        self.objects_updated += other.objects_updated;
        self.objects_skipped += other.objects_skipped;
    }
}

/// Allocation state of one parallel worker.
pub(crate) struct CopyBuffers {
    to: LocalBuffer,
    promo: Option<LocalBuffer>,
    fallback: LocalBuffer,
}

impl CopyBuffers {
    fn attach(ctx: &CycleContext<'_>) -> Self {
        Self {
            to: ctx.to_space.attach_local_buffer(),
            promo: ctx
                .promo_dest_space
                .map(|space| space.attach_local_buffer()),
            fallback: ctx.fallback_space.attach_local_buffer(),
        }
    }

    /// Returns the free bytes that were left in the buffers.
    fn revoke(self, ctx: &CycleContext<'_>) -> usize {
        let mut wasted = ctx.to_space.revoke_local_buffer(self.to);
        if let (Some(space), Some(buffer)) = (ctx.promo_dest_space, self.promo) {
            wasted += space.revoke_local_buffer(buffer);
        }
        wasted + ctx.fallback_space.revoke_local_buffer(self.fallback)
    }
}

/// How copies get their memory.
#[derive(Clone, Copy)]
enum Destination<'b> {
    /// Only one thread is copying.
    ThreadUnsafe,
    Buffers(&'b CopyBuffers),
}

impl<'b> Destination<'b> {
    fn alloc(
        self,
        space: &dyn Space,
        pick: fn(&CopyBuffers) -> Option<&LocalBuffer>,
        size: usize,
    ) -> Option<Allocation> {
        match self {
            Destination::ThreadUnsafe => unsafe { space.alloc_thread_unsafe(size) },
            Destination::Buffers(buffers) => {
                pick(buffers).and_then(|buffer| space.alloc(buffer, size))
            }
        }
    }
}

/// State of a running cycle that stays fixed while objects are copied. Shared by every
/// worker.
pub(crate) struct CycleContext<'a> {
    heap: &'a CollectorHeap<'a>,
    from_space: &'a dyn Space,
    forwarding: &'a ForwardingTable,
    to_space: &'a dyn Space,
    promo_dest_space: Option<&'a dyn Space>,
    fallback_space: &'a dyn Space,
    immune_region: &'a ImmuneRegion,
    collect_from_space_only: bool,
    generational: bool,
    last_gc_to_space_end: usize,
}

impl<'a> CycleContext<'a> {
    /// Copies a from-space object that nobody copied yet.
    fn copy_object(
        &self,
        obj: ObjectRef,
        dest: Destination<'_>,
        counters: &mut CopyCounters,
    ) -> ObjectRef {
        let object_size = self.heap.model.size_of(obj);
        let mut allocation = None;
        if self.generational && (obj as usize) < self.last_gc_to_space_end {
            // Survived the previous cycle.
            if let Some(promo) = self.promo_dest_space {
                allocation = dest.alloc(promo, |buffers| buffers.promo.as_ref(), object_size);
                if let Some(ref promoted) = allocation {
                    counters.objects_promoted += 1;
                    counters.bytes_promoted += promoted.bytes_allocated;
                    counters.bytes_wasted_promoted +=
                        promoted.bytes_allocated.saturating_sub(object_size);
                    // Bitmaps are bound when only the bump pointer spaces are collected. The
                    // live bit is then set once the object is popped off the mark stack, so
                    // the scan of the promotion space does not pick it up half done.
                    if !self.collect_from_space_only {
                        let ptr = promoted.ptr.as_ptr();
                        if let Some(live) = promo.live_bitmap() {
                            live.atomic_test_and_set(ptr);
                        }
                        if let Some(mark) = promo.mark_bitmap() {
                            mark.atomic_test_and_set(ptr);
                        }
                    }
                }
            }
        }
        if allocation.is_none() {
            allocation = dest.alloc(self.to_space, |buffers| Some(&buffers.to), object_size);
            if let (Some(copy), Some(live)) = (allocation.as_ref(), self.to_space.live_bitmap()) {
                live.atomic_test_and_set(copy.ptr.as_ptr());
            }
        }
        let allocation = match allocation {
            Some(allocation) => allocation,
            None => {
                let fallback = self.fallback_space;
                let allocation = dest
                    .alloc(fallback, |buffers| Some(&buffers.fallback), object_size)
                    .unwrap_or_else(|| promotion_oom(object_size, obj));
                counters.objects_fallback += 1;
                counters.bytes_fallback += allocation.bytes_allocated;
                let ptr = allocation.ptr.as_ptr();
                if let Some(live) = fallback.live_bitmap() {
                    live.atomic_test_and_set(ptr);
                }
                if !self.collect_from_space_only {
                    if let Some(mark) = fallback.mark_bitmap() {
                        mark.atomic_test_and_set(ptr);
                    }
                }
                allocation
            }
        };
        counters.objects_copied += 1;
        counters.bytes_copied += allocation.bytes_allocated;
        let forward_address = allocation.ptr.as_ptr();
        unsafe {
            std::ptr::copy_nonoverlapping(obj as *const u8, forward_address, object_size);
        }
        forward_address
    }

    /// Marks the referent of `slot`, copying it out of from-space and rewriting the slot if
    /// needed. Returns the object to push on the mark stack, if any.
    #[inline]
    fn mark_slot(
        &self,
        slot: &mut ObjectRef,
        dest: Destination<'_>,
        counters: &mut CopyCounters,
    ) -> Option<ObjectRef> {
        let obj = *slot;
        if obj.is_null() {
            return None;
        }
        if self.from_space.has_address(obj) {
            match self.forwarding.try_claim(obj) {
                Claim::Forwarded(forward_address) => {
                    counters.objects_updated += 1;
                    *slot = forward_address;
                    None
                }
                Claim::Won => {
                    let forward_address = self.copy_object(obj, dest, counters);
                    self.forwarding.publish(obj, forward_address);
                    *slot = forward_address;
                    Some(forward_address)
                }
            }
        } else if !self.collect_from_space_only
            && !self.immune_region.contains_object(obj)
            && !self.to_space.has_address(obj)
        {
            if self.heap.test_and_set_mark(obj) {
                None
            } else {
                Some(obj)
            }
        } else {
            counters.objects_skipped += 1;
            None
        }
    }

    /// Called when `obj` comes off a mark stack, right before it is scanned.
    #[inline]
    fn on_pop(&self, obj: ObjectRef) {
        if !self.collect_from_space_only {
            return;
        }
        if let Some(promo) = self.promo_dest_space {
            if promo.has_address(obj) {
                // Promoted this cycle, see `copy_object`.
                if let Some(live) = promo.live_bitmap() {
                    let was_live = live.atomic_test_and_set(obj);
                    debug_assert!(!was_live, "{:p} was promoted twice", obj);
                }
            }
        }
    }

    /// New address of `obj` if it survives the cycle.
    pub(crate) fn get_marked_forward_address(&self, obj: ObjectRef) -> Option<ObjectRef> {
        if obj.is_null() {
            return None;
        }
        if self.from_space.has_address(obj) {
            return self.forwarding.forwarding_address(obj);
        }
        if self.collect_from_space_only
            || self.immune_region.contains_object(obj)
            || self.to_space.has_address(obj)
        {
            return Some(obj);
        }
        if self.heap.is_marked(obj) {
            Some(obj)
        } else {
            None
        }
    }
}

/// Mark stack and counters of the copying threads.
struct MarkState {
    mark_stack: Vec<ObjectRef>,
    delayed_references: Vec<ObjectRef>,
    counters: CopyCounters,
    parallel: ParallelTotals,
    parallel_drains: usize,
    pool: Option<Pool>,
    first_iter_copy_size: usize,
}

impl MarkState {
    fn thread_count(&self) -> usize {
        self.pool
            .as_ref()
            .map_or(1, |pool| pool.thread_count() as usize + 1)
    }

    fn mark_object(&mut self, ctx: &CycleContext<'_>, slot: &mut ObjectRef) {
        if let Some(gray) = ctx.mark_slot(slot, Destination::ThreadUnsafe, &mut self.counters) {
            self.mark_stack.push(gray);
        }
    }

    fn scan_object(&mut self, ctx: &CycleContext<'_>, obj: ObjectRef) {
        let mut visitor = SerialVisitor { state: self, ctx };
        ctx.heap.model.visit_references(obj, &mut visitor);
    }

    fn process_mark_stack(&mut self, ctx: &CycleContext<'_>) {
        let thread_count = self.thread_count();
        if thread_count > 1 && self.mark_stack.len() >= MIN_PARALLEL_MARK_STACK_SIZE {
            self.parallel_drains += 1;
            parallel::process_mark_stack_parallel(self, ctx);
        } else {
            self.process_mark_stack_serial(ctx);
        }
    }

    fn process_mark_stack_serial(&mut self, ctx: &CycleContext<'_>) {
        let mut fifo = VecDeque::with_capacity(PREFETCH_FIFO_SIZE);
        loop {
            while fifo.len() < PREFETCH_FIFO_SIZE {
                match self.mark_stack.pop() {
                    Some(obj) => {
                        prefetch(obj);
                        fifo.push_back(obj);
                    }
                    None => break,
                }
            }
            let obj = match fifo.pop_front() {
                Some(obj) => obj,
                None => break,
            };
            ctx.on_pop(obj);
            self.scan_object(ctx, obj);
        }
    }

    /// Serial and parallel counters together.
    fn total_counters(&self) -> CopyCounters {
        let mut total = self.counters;
        total.add(&self.parallel.load());
        total
    }
}

struct SerialVisitor<'s, 'c> {
    state: &'s mut MarkState,
    ctx: &'s CycleContext<'c>,
}

impl Visitor for SerialVisitor<'_, '_> {
    fn mark_object(&mut self, slot: &mut ObjectRef) {
        self.state.mark_object(self.ctx, slot);
    }

    fn delay_reference_referent(&mut self, reference: ObjectRef) {
        self.state.delayed_references.push(reference);
    }
}

/// What reference processing may ask of a running cycle.
struct CycleCallbacks<'s, 'c> {
    state: &'s mut MarkState,
    ctx: &'s CycleContext<'c>,
}

impl MarkCallbacks for CycleCallbacks<'_, '_> {
    fn get_marked_forward_address(&self, obj: ObjectRef) -> Option<ObjectRef> {
        self.ctx.get_marked_forward_address(obj)
    }

    fn mark_object(&mut self, obj: ObjectRef) -> ObjectRef {
        let mut slot = obj;
        self.state.mark_object(self.ctx, &mut slot);
        slot
    }

    fn process_mark_stack(&mut self) {
        self.state.process_mark_stack(self.ctx);
    }
}

#[cold]
fn promotion_oom(size: usize, object: *const u8) -> ! {
    log::error!(
        "out of memory in the fallback space: tried to copy {} at {:p}",
        formatted_size(size),
        object
    );
    eprintln!(
        "Out of memory on evacuation: tried to copy {} at {:p}",
        formatted_size(size),
        object
    );
    std::process::abort()
}

/// Panics if any reference slot of `obj` still points into `from_space`.
pub fn verify_no_from_space_references(
    model: &dyn ObjectModel,
    from_space: &dyn Space,
    obj: ObjectRef,
) {
    struct FromSpaceChecker<'a> {
        from_space: &'a dyn Space,
        holder: ObjectRef,
    }

    impl Visitor for FromSpaceChecker<'_> {
        fn mark_object(&mut self, slot: &mut ObjectRef) {
            let referent = *slot;
            if !referent.is_null() && self.from_space.has_address(referent) {
                panic!(
                    "{:p} still references {:p} in {}",
                    self.holder,
                    referent,
                    self.from_space.name()
                );
            }
        }
    }

    model.visit_references(
        obj,
        &mut FromSpaceChecker {
            from_space,
            holder: obj,
        },
    );
}

pub struct SemiSpace {
    config: CollectorConfig,
    from_space: Option<Arc<dyn Space>>,
    to_space: Option<Arc<dyn Space>>,
    promo_dest_space: Option<Arc<dyn Space>>,
    fallback_space: Option<Arc<dyn Space>>,
    immune_region: ImmuneRegion,
    is_large_object_space_immune: bool,
    /// Only the bump pointer spaces are evacuated when set; everything else is a root.
    collect_from_space_only: bool,
    /// End of the to-space after the previous cycle. Objects below it survived once.
    last_gc_to_space_end: usize,
    bytes_promoted_since_last_whole_heap_collection: usize,
    large_object_bytes_allocated_at_last_whole_heap_collection: usize,
    marker: MarkState,
    current: CycleStatistics,
    cumulative: CumulativeStatistics,
}

impl SemiSpace {
    pub fn new(config: CollectorConfig) -> Self {
        let pool = if config.parallel_gc_threads > 0 {
            Some(Pool::new(config.parallel_gc_threads as u32))
        } else {
            None
        };
        Self {
            collect_from_space_only: config.generational,
            marker: MarkState {
                mark_stack: Vec::new(),
                delayed_references: Vec::new(),
                counters: CopyCounters::default(),
                parallel: ParallelTotals::default(),
                parallel_drains: 0,
                pool,
                first_iter_copy_size: config.first_iter_copy_size.max(1),
            },
            config,
            from_space: None,
            to_space: None,
            promo_dest_space: None,
            fallback_space: None,
            immune_region: ImmuneRegion::default(),
            is_large_object_space_immune: false,
            last_gc_to_space_end: 0,
            bytes_promoted_since_last_whole_heap_collection: 0,
            large_object_bytes_allocated_at_last_whole_heap_collection: 0,
            current: CycleStatistics::default(),
            cumulative: CumulativeStatistics::default(),
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Space evacuated by the next cycle.
    pub fn set_from_space(&mut self, space: Arc<dyn Space>) {
        assert!(
            space.can_move_objects() && space.forwarding_table().is_some(),
            "{} cannot be evacuated",
            space.name()
        );
        self.from_space = Some(space);
    }

    /// Space receiving young survivors of the next cycle.
    pub fn set_to_space(&mut self, space: Arc<dyn Space>) {
        self.to_space = Some(space);
    }

    /// Whether the next cycle only evacuates the bump pointer spaces.
    pub fn collect_from_space_only(&self) -> bool {
        self.collect_from_space_only
    }

    pub fn last_gc_to_space_end(&self) -> *mut u8 {
        self.last_gc_to_space_end as *mut u8
    }

    pub fn bytes_promoted_since_last_whole_heap_collection(&self) -> usize {
        self.bytes_promoted_since_last_whole_heap_collection
    }

    /// Statistics of the last cycle.
    pub fn last_cycle(&self) -> &CycleStatistics {
        &self.current
    }

    pub fn cumulative(&self) -> &CumulativeStatistics {
        &self.cumulative
    }

    pub fn thread_count(&self) -> usize {
        self.marker.thread_count()
    }

    /// Runs a whole cycle. The from-space and to-space must have been set, and no mutator
    /// may run until it returns.
    pub fn run(
        &mut self,
        heap: &CollectorHeap<'_>,
        roots: &mut dyn RootSet,
        references: &mut dyn ReferenceProcessor,
        cause: GcCause,
        clear_soft_references: bool,
    ) -> &CycleStatistics {
        let start = Instant::now();
        let (from_space, to_space) = match (self.from_space.clone(), self.to_space.clone()) {
            (Some(from_space), Some(to_space)) => (from_space, to_space),
            _ => panic!("from-space and to-space must be set before a collection"),
        };
        assert!(
            !same_space(&*from_space, &*to_space),
            "from-space and to-space are the same"
        );
        self.initialize_phase(heap, &*from_space, cause);
        self.marking_phase(
            heap,
            &*from_space,
            &*to_space,
            roots,
            references,
            cause,
            clear_soft_references,
        );
        self.reclaim_phase(heap, &*from_space, &*to_space);
        self.finish_phase(heap, &*from_space);
        self.current.pause_time = start.elapsed();
        self.cumulative.record(&self.current);
        logln_if!(self.config.verbose, "[gc] {}", self.current);
        &self.current
    }

    fn initialize_phase(
        &mut self,
        heap: &CollectorHeap<'_>,
        from_space: &dyn Space,
        cause: GcCause,
    ) {
        self.current = CycleStatistics {
            cause: Some(cause),
            ..Default::default()
        };
        assert!(self.marker.mark_stack.is_empty(), "mark stack is not empty");
        self.marker.delayed_references.clear();
        self.marker.counters = CopyCounters::default();
        self.marker.parallel.reset();
        self.marker.parallel_drains = 0;
        self.immune_region.reset();
        self.is_large_object_space_immune = false;
        // Evacuating the main space itself leaves nowhere to promote to.
        self.promo_dest_space = if self.config.generational {
            heap.main_space
                .clone()
                .filter(|space| !same_space(&**space, from_space))
        } else {
            None
        };
        assert!(
            !same_space(&*heap.non_moving_space, from_space),
            "the fallback space cannot be evacuated"
        );
        self.fallback_space = Some(heap.non_moving_space.clone());
    }

    fn revoke_all_thread_local_buffers(&self, heap: &CollectorHeap<'_>) {
        for space in heap.spaces.iter() {
            space.revoke_all_thread_local_buffers();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn marking_phase(
        &mut self,
        heap: &CollectorHeap<'_>,
        from_space: &dyn Space,
        to_space: &dyn Space,
        roots: &mut dyn RootSet,
        references: &mut dyn ReferenceProcessor,
        cause: GcCause,
        mut clear_soft_references: bool,
    ) {
        self.revoke_all_thread_local_buffers(heap);
        if self.config.generational
            && (matches!(cause, GcCause::Explicit | GcCause::NativeAlloc) || clear_soft_references)
        {
            self.collect_from_space_only = false;
        }
        if !self.collect_from_space_only {
            clear_soft_references = true;
        }
        self.current.whole_heap = !self.collect_from_space_only;
        self.current.clear_soft_references = clear_soft_references;

        if self.config.generational {
            // Points outside the from-space on the very first cycle, or when the roles of
            // the semi-spaces changed.
            if !from_space.has_address(self.last_gc_to_space_end as *const u8) {
                self.last_gc_to_space_end = from_space.begin() as usize;
            }
        }
        log::debug!(
            "semispace: {} cycle ({:?}), evacuating {} into {}",
            if self.collect_from_space_only { "bump pointer" } else { "whole heap" },
            cause,
            from_space.name(),
            to_space.name()
        );

        self.bind_bitmaps(heap, from_space, to_space);

        let forwarding = match from_space.forwarding_table() {
            Some(forwarding) => forwarding,
            None => panic!("{} cannot be evacuated", from_space.name()),
        };
        let promo_dest_space = self.promo_dest_space.clone();
        let fallback_space = heap.non_moving_space.clone();
        let immune_region = self.immune_region.clone();
        let ctx = CycleContext {
            heap,
            from_space,
            forwarding,
            to_space,
            promo_dest_space: promo_dest_space.as_deref(),
            fallback_space: &*fallback_space,
            immune_region: &immune_region,
            collect_from_space_only: self.collect_from_space_only,
            generational: self.config.generational,
            last_gc_to_space_end: self.last_gc_to_space_end,
        };

        roots.visit_roots(&mut SerialVisitor {
            state: &mut self.marker,
            ctx: &ctx,
        });
        self.mark_reachable_objects(&ctx);
        self.process_references(&ctx, references, clear_soft_references);
        references.sweep_system_weaks(&CycleCallbacks {
            state: &mut self.marker,
            ctx: &ctx,
        });

        // Copies only show up in the counters once the buffers are back.
        self.revoke_all_thread_local_buffers(heap);

        let counters = self.marker.total_counters();
        let from_bytes = from_space.bytes_allocated() as i64;
        let from_objects = from_space.objects_allocated() as u64;
        let to_objects = counters.objects_copied as u64;
        assert!(
            to_objects <= from_objects,
            "moved {} objects out of {} holding {}",
            to_objects,
            from_space.name(),
            from_objects
        );
        self.current.freed.add(ObjectBytePair::new(
            from_objects - to_objects,
            from_bytes - counters.bytes_copied as i64,
        ));
        self.record_counters(&counters);

        from_space.clear();
        if self.config.protect_from_space {
            // A slab backed space stays readable until the end of the cycle.
            if from_space.kind() == SpaceKind::Slab {
                from_space.protect(Protection::Read);
            } else {
                from_space.protect(Protection::None);
            }
        }
    }

    fn record_counters(&mut self, counters: &CopyCounters) {
        self.current.objects_moved = counters.objects_copied;
        self.current.bytes_moved = counters.bytes_copied;
        self.current.objects_promoted = counters.objects_promoted;
        self.current.bytes_promoted = counters.bytes_promoted;
        self.current.bytes_wasted_promoted = counters.bytes_wasted_promoted;
        self.current.objects_fallback = counters.objects_fallback;
        self.current.bytes_fallback = counters.bytes_fallback;
        self.current.bytes_wasted_parallel = self.marker.parallel.bytes_wasted_buffers();
        self.current.parallel = self.marker.parallel_drains != 0;
        log::trace!(
            "semispace: {} slots updated, {} skipped, {} parallel drains",
            counters.objects_updated,
            counters.objects_skipped,
            self.marker.parallel_drains
        );
    }

    fn bind_bitmaps(
        &mut self,
        heap: &CollectorHeap<'_>,
        from_space: &dyn Space,
        to_space: &dyn Space,
    ) {
        for space in heap.spaces.iter() {
            let space = &**space;
            if same_space(space, from_space) {
                continue;
            }
            match space.retention_policy() {
                GcRetentionPolicy::NeverCollect | GcRetentionPolicy::FullCollect => {
                    self.immune_region.add_space(space);
                }
                GcRetentionPolicy::AlwaysCollect => {
                    if space.live_bitmap().is_some()
                        && (same_space(space, to_space) || self.collect_from_space_only)
                    {
                        space.bind_live_to_mark_bitmap();
                    }
                }
            }
        }
        if self.collect_from_space_only && heap.large_object_space.is_some() {
            self.is_large_object_space_immune = true;
        }
    }

    fn mark_reachable_objects(&mut self, ctx: &CycleContext<'_>) {
        let heap = ctx.heap;
        for space in heap.spaces.iter() {
            let space = &**space;
            if same_space(space, ctx.from_space) || same_space(space, ctx.to_space) {
                continue;
            }
            // Immune spaces are always scanned. With only the bump pointer spaces evacuated,
            // every other space is a root as well.
            if !self.immune_region.contains_space(space) && !self.collect_from_space_only {
                continue;
            }
            if let Some(live) = space.live_bitmap() {
                let marker = &mut self.marker;
                live.visit_marked_range(space.begin(), space.end(), |obj| {
                    marker.scan_object(ctx, obj);
                });
            }
        }
        if self.is_large_object_space_immune {
            if let Some(los) = heap.large_object_space {
                los.copy_live_to_marked();
                for obj in los.live_objects() {
                    self.marker.scan_object(ctx, obj);
                }
            }
        }
        self.marker.process_mark_stack(ctx);
    }

    fn process_references(
        &mut self,
        ctx: &CycleContext<'_>,
        references: &mut dyn ReferenceProcessor,
        clear_soft_references: bool,
    ) {
        loop {
            let delayed = std::mem::take(&mut self.marker.delayed_references);
            if delayed.is_empty() {
                break;
            }
            log::trace!("semispace: processing {} references", delayed.len());
            let mut callbacks = CycleCallbacks {
                state: &mut self.marker,
                ctx,
            };
            references.process_references(&delayed, clear_soft_references, &mut callbacks);
            // Referents kept alive above may hold references of their own.
            self.marker.process_mark_stack(ctx);
        }
    }

    fn reclaim_phase(
        &mut self,
        heap: &CollectorHeap<'_>,
        from_space: &dyn Space,
        to_space: &dyn Space,
    ) {
        self.sweep(heap, from_space, to_space, false);
        self.swap_bitmaps(heap);
        for space in heap.spaces.iter() {
            space.unbind_bitmaps();
        }
        if self.config.generational {
            self.last_gc_to_space_end = to_space.end() as usize;
        }
    }

    fn sweep(
        &mut self,
        heap: &CollectorHeap<'_>,
        from_space: &dyn Space,
        to_space: &dyn Space,
        swap_bitmaps: bool,
    ) {
        for space in heap.spaces.iter() {
            let space = &**space;
            if same_space(space, from_space)
                || same_space(space, to_space)
                || self.immune_region.contains_space(space)
                || space.live_bitmap().is_none()
            {
                continue;
            }
            let freed = space.sweep(swap_bitmaps);
            self.current.freed.add(freed);
        }
        if !self.is_large_object_space_immune {
            if let Some(los) = heap.large_object_space {
                let freed = los.sweep(swap_bitmaps);
                self.current.freed_los.add(freed);
            }
        }
    }

    fn swap_bitmaps(&self, heap: &CollectorHeap<'_>) {
        for space in heap.spaces.iter() {
            if space.retention_policy() == GcRetentionPolicy::AlwaysCollect {
                space.swap_bitmaps();
            }
        }
        if let Some(los) = heap.large_object_space {
            los.swap_bitmaps();
        }
    }

    fn finish_phase(&mut self, heap: &CollectorHeap<'_>, from_space: &dyn Space) {
        if self.config.protect_from_space && from_space.kind() == SpaceKind::Slab {
            from_space.protect(Protection::None);
        }
        self.from_space = None;
        self.to_space = None;
        assert!(self.marker.mark_stack.is_empty(), "mark stack is not empty");

        if self.config.generational {
            let los_bytes = heap
                .large_object_space
                .map_or(0, |los| los.bytes_allocated());
            if self.collect_from_space_only {
                self.bytes_promoted_since_last_whole_heap_collection +=
                    self.current.bytes_promoted;
                let bytes_promoted_threshold_exceeded = self
                    .bytes_promoted_since_last_whole_heap_collection
                    >= BYTES_PROMOTED_THRESHOLD;
                let large_object_bytes_threshold_exceeded = los_bytes
                    >= self.large_object_bytes_allocated_at_last_whole_heap_collection
                        + LARGE_OBJECT_BYTES_ALLOCATED_THRESHOLD;
                if bytes_promoted_threshold_exceeded || large_object_bytes_threshold_exceeded {
                    log::debug!(
                        "semispace: next cycle covers the whole heap ({} promoted, {} in large objects)",
                        formatted_size(self.bytes_promoted_since_last_whole_heap_collection),
                        formatted_size(los_bytes)
                    );
                    self.collect_from_space_only = false;
                }
            } else {
                self.bytes_promoted_since_last_whole_heap_collection = self.current.bytes_promoted;
                self.large_object_bytes_allocated_at_last_whole_heap_collection = los_bytes;
                self.collect_from_space_only = true;
            }
        }

        for space in heap.spaces.iter() {
            space.clear_mark_bitmap();
        }
        if let Some(los) = heap.large_object_space {
            los.clear_mark_bitmap();
        }
        self.promo_dest_space = None;
        self.fallback_space = None;
    }
}
