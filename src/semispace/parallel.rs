//! Parallel mark stack draining.
//!
//! The mark stack is cut into chunks pushed to a shared injector. Every worker owns a LIFO
//! deque, copies the objects of its chunks with its own allocation buffers and pushes the
//! objects it greys onto the chunk it is working on. Chunks that grow too large are split
//! and the halves left in the worker's deque for others to steal. Workers stop once every
//! chunk pushed so far has been drained.
use std::{
    iter,
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;

use super::{CopyBuffers, CopyCounters, CycleContext, Destination, MarkState};
use crate::api::{ObjectRef, Visitor};

/// Chunks never grow past this many entries.
pub const MAX_TASK_SIZE: usize = 4096;

/// Part of the mark stack handed to one worker at a time.
pub(crate) struct MarkStackChunk(Vec<ObjectRef>);

// Objects are only touched while the world is stopped. Claiming through the forwarding
// table keeps two workers from copying the same object.
unsafe impl Send for MarkStackChunk {}

impl MarkStackChunk {
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Cuts `stack` into chunks for `workers` threads. A few small chunks come first so that
/// every worker gets going right away, the rest is split evenly.
pub(crate) fn split_mark_stack(
    mut stack: Vec<ObjectRef>,
    workers: usize,
    first_iter_copy_size: usize,
) -> Vec<MarkStackChunk> {
    let workers = workers.max(1);
    let first_iter = (first_iter_copy_size * workers * 2).min(stack.len());
    let task_size = (stack.len() - first_iter) / workers + 1;
    let chunk_size = task_size.min(MAX_TASK_SIZE);
    let first_piece = (first_iter / workers / 2).max(1);

    let mut chunks = Vec::new();
    let mut first = stack.split_off(stack.len() - first_iter);
    while !first.is_empty() {
        let at = first.len().saturating_sub(first_piece);
        chunks.push(MarkStackChunk(first.split_off(at)));
    }
    while !stack.is_empty() {
        let at = stack.len().saturating_sub(chunk_size);
        chunks.push(MarkStackChunk(stack.split_off(at)));
    }
    chunks
}

/// Copy counters summed over every worker of a cycle.
#[derive(Default)]
pub(crate) struct ParallelTotals {
    objects_copied: AtomicUsize,
    bytes_copied: AtomicUsize,
    objects_promoted: AtomicUsize,
    bytes_promoted: AtomicUsize,
    bytes_wasted_promoted: AtomicUsize,
    objects_fallback: AtomicUsize,
    bytes_fallback: AtomicUsize,
    objects_updated: AtomicUsize,
    objects_skipped: AtomicUsize,
    bytes_wasted_buffers: AtomicUsize,
}

impl ParallelTotals {
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
        self.bytes_wasted_buffers.store(0, Ordering::Relaxed);
    }

    fn counters(&self) -> [&AtomicUsize; 9] {
        [
            &self.objects_copied,
            &self.bytes_copied,
            &self.objects_promoted,
            &self.bytes_promoted,
            &self.bytes_wasted_promoted,
            &self.objects_fallback,
            &self.bytes_fallback,
            &self.objects_updated,
            &self.objects_skipped,
        ]
    }

    pub fn add(&self, counters: &CopyCounters) {
        let values = [
            counters.objects_copied,
            counters.bytes_copied,
            counters.objects_promoted,
            counters.bytes_promoted,
            counters.bytes_wasted_promoted,
            counters.objects_fallback,
            counters.bytes_fallback,
            counters.objects_updated,
            counters.objects_skipped,
        ];
        for (counter, value) in self.counters().iter().zip(values) {
            counter.fetch_add(value, Ordering::Relaxed);
        }
    }

    pub fn load(&self) -> CopyCounters {
        let load = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        CopyCounters {
            objects_copied: load(&self.objects_copied),
            bytes_copied: load(&self.bytes_copied),
            objects_promoted: load(&self.objects_promoted),
            bytes_promoted: load(&self.bytes_promoted),
            bytes_wasted_promoted: load(&self.bytes_wasted_promoted),
            objects_fallback: load(&self.objects_fallback),
            bytes_fallback: load(&self.bytes_fallback),
            objects_updated: load(&self.objects_updated),
            objects_skipped: load(&self.objects_skipped),
        }
    }

    /// Free bytes left in worker buffers when they were revoked.
    pub fn bytes_wasted_buffers(&self) -> usize {
        self.bytes_wasted_buffers.load(Ordering::Relaxed)
    }
}

/// Number of chunks pushed and not yet drained. A chunk is split before it is finished, so
/// the count only drops to zero once the whole object graph is copied.
pub(crate) struct PendingChunks(AtomicUsize);

impl PendingChunks {
    pub fn new(chunks: usize) -> Self {
        Self(AtomicUsize::new(chunks))
    }

    pub fn pushed(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    pub fn drained(&self) {
        let before = self.0.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before != 0, "more chunks drained than pushed");
    }

    pub fn is_empty(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }
}

/// Drains `state.mark_stack` with every thread of the pool plus the calling thread.
pub(super) fn process_mark_stack_parallel(state: &mut MarkState, ctx: &CycleContext<'_>) {
    let mut pool = match state.pool.take() {
        Some(pool) => pool,
        None => return state.process_mark_stack_serial(ctx),
    };
    let n_threads = pool.thread_count() as usize + 1;
    let stack = std::mem::take(&mut state.mark_stack);
    let n_objects = stack.len();

    let injector = Injector::new();
    let chunks = split_mark_stack(stack, n_threads, state.first_iter_copy_size);
    let pending = PendingChunks::new(chunks.len());
    for chunk in chunks {
        injector.push(chunk);
    }
    let mut workers = Vec::with_capacity(n_threads);
    let mut stealers = Vec::with_capacity(n_threads);
    for _ in 0..n_threads {
        let w = Worker::new_lifo();
        stealers.push(w.stealer());
        workers.push(w);
    }
    let delayed_references = Mutex::new(Vec::<usize>::new());
    let totals = &state.parallel;

    log::trace!(
        "semispace: draining {} objects on {} threads",
        n_objects,
        n_threads
    );
    pool.scoped(|scoped| {
        let mut workers = workers.into_iter().enumerate();
        let own = workers.next();
        for (task_id, worker) in workers {
            let injector = &injector;
            let stealers = &stealers;
            let pending = &pending;
            let delayed_references = &delayed_references;
            scoped.execute(move || {
                CopyWorker {
                    task_id,
                    worker,
                    injector,
                    stealers,
                    victims: Uniform::new(0, n_threads),
                    pending,
                    ctx,
                    totals,
                    delayed_references,
                }
                .run();
            });
        }
        if let Some((task_id, worker)) = own {
            CopyWorker {
                task_id,
                worker,
                injector: &injector,
                stealers: &stealers,
                victims: Uniform::new(0, n_threads),
                pending: &pending,
                ctx,
                totals,
                delayed_references: &delayed_references,
            }
            .run();
        }
    });
    state.pool = Some(pool);
    state.delayed_references.extend(
        delayed_references
            .into_inner()
            .into_iter()
            .map(|reference| reference as ObjectRef),
    );
}

/// Own chunks first, then the injector, then the other workers starting from a random one.
fn find_chunk(
    task_id: usize,
    worker: &Worker<MarkStackChunk>,
    injector: &Injector<MarkStackChunk>,
    stealers: &[Stealer<MarkStackChunk>],
    victims: &Uniform<usize>,
) -> Option<MarkStackChunk> {
    worker.pop().or_else(|| {
        let first_victim = victims.sample(&mut thread_rng());
        let n = stealers.len();
        iter::repeat_with(|| {
            injector.steal_batch_and_pop(worker).or_else(|| {
                (0..n)
                    .map(|i| (first_victim + i) % n)
                    .filter(|&id| id != task_id)
                    .map(|id| stealers[id].steal_batch_and_pop(worker))
                    .collect()
            })
        })
        .find(|steal| !steal.is_retry())
        .and_then(Steal::success)
    })
}

struct CopyWorker<'a, 'c> {
    task_id: usize,
    worker: Worker<MarkStackChunk>,
    injector: &'a Injector<MarkStackChunk>,
    stealers: &'a [Stealer<MarkStackChunk>],
    victims: Uniform<usize>,
    pending: &'a PendingChunks,
    ctx: &'a CycleContext<'c>,
    totals: &'a ParallelTotals,
    delayed_references: &'a Mutex<Vec<usize>>,
}

impl<'a, 'c> CopyWorker<'a, 'c> {
    fn run(self) {
        let buffers = CopyBuffers::attach(self.ctx);
        let mut counters = CopyCounters::default();
        let mut delayed = Vec::new();
        let backoff = Backoff::new();
        loop {
            if let Some(chunk) = find_chunk(
                self.task_id,
                &self.worker,
                self.injector,
                self.stealers,
                &self.victims,
            ) {
                self.process_chunk(chunk, &buffers, &mut counters, &mut delayed);
                self.pending.drained();
                backoff.reset();
            } else if self.pending.is_empty() {
                break;
            } else {
                // Others still hold chunks that may split.
                backoff.snooze();
            }
        }
        self.totals.add(&counters);
        let wasted = buffers.revoke(self.ctx);
        self.totals
            .bytes_wasted_buffers
            .fetch_add(wasted, Ordering::Relaxed);
        if !delayed.is_empty() {
            self.delayed_references.lock().extend(delayed);
        }
    }

    fn process_chunk(
        &self,
        mut chunk: MarkStackChunk,
        buffers: &CopyBuffers,
        counters: &mut CopyCounters,
        delayed: &mut Vec<usize>,
    ) {
        while let Some(obj) = chunk.0.pop() {
            self.ctx.on_pop(obj);
            let mut visitor = ParallelVisitor {
                ctx: self.ctx,
                dest: Destination::Buffers(buffers),
                counters: &mut *counters,
                stack: &mut chunk.0,
                delayed: &mut *delayed,
            };
            self.ctx.heap.model.visit_references(obj, &mut visitor);
            if chunk.len() >= MAX_TASK_SIZE {
                let half = chunk.0.split_off(chunk.len() / 2);
                self.pending.pushed();
                self.worker.push(MarkStackChunk(half));
            }
        }
    }
}

struct ParallelVisitor<'v, 'c> {
    ctx: &'v CycleContext<'c>,
    dest: Destination<'v>,
    counters: &'v mut CopyCounters,
    stack: &'v mut Vec<ObjectRef>,
    delayed: &'v mut Vec<usize>,
}

impl Visitor for ParallelVisitor<'_, '_> {
    fn mark_object(&mut self, slot: &mut ObjectRef) {
        if let Some(gray) = self.ctx.mark_slot(slot, self.dest, self.counters) {
            self.stack.push(gray);
        }
    }

    fn delay_reference_referent(&mut self, reference: ObjectRef) {
        self.delayed.push(reference as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(len: usize) -> Vec<ObjectRef> {
        (1..=len).map(|i| (i * 8) as ObjectRef).collect()
    }

    #[test]
    fn test_split_keeps_every_entry() {
        let chunks = split_mark_stack(stack(1000), 4, 8);
        let sizes: Vec<usize> = chunks.iter().map(MarkStackChunk::len).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 1000);
        assert_eq!(&sizes[..8], &[8; 8]);
        assert_eq!(&sizes[8..], &[235, 235, 235, 231]);

        let mut all: Vec<usize> = chunks
            .into_iter()
            .flat_map(|chunk| chunk.0)
            .map(|obj| obj as usize)
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
    }

    #[test]
    fn test_split_caps_chunk_size() {
        let chunks = split_mark_stack(stack(40_000), 2, 8);
        assert!(chunks.iter().all(|chunk| chunk.len() <= MAX_TASK_SIZE));
        assert_eq!(chunks.iter().map(MarkStackChunk::len).sum::<usize>(), 40_000);
    }

    #[test]
    fn test_split_small_stack() {
        let chunks = split_mark_stack(stack(3), 4, 8);
        assert_eq!(chunks.iter().map(MarkStackChunk::len).sum::<usize>(), 3);
        assert!(chunks.iter().all(|chunk| chunk.len() == 1));
    }

    #[test]
    fn test_pending_chunks_count_splits() {
        let pending = PendingChunks::new(2);
        pending.drained();
        assert!(!pending.is_empty());
        // The last chunk splits before it is drained.
        pending.pushed();
        pending.drained();
        assert!(!pending.is_empty());
        pending.drained();
        assert!(pending.is_empty());
    }

    #[test]
    fn test_workers_drain_every_chunk() {
        let chunks = split_mark_stack(stack(10_000), 3, 8);
        let n_chunks = chunks.len();
        let injector = Injector::new();
        for chunk in chunks {
            injector.push(chunk);
        }
        let pending = PendingChunks::new(n_chunks);
        let workers: Vec<Worker<MarkStackChunk>> = (0..3).map(|_| Worker::new_lifo()).collect();
        let stealers: Vec<_> = workers.iter().map(Worker::stealer).collect();
        let seen = AtomicUsize::new(0);
        crossbeam_utils::thread::scope(|scope| {
            for (task_id, worker) in workers.into_iter().enumerate() {
                let (injector, stealers, pending, seen) = (&injector, &stealers, &pending, &seen);
                scope.spawn(move |_| {
                    let victims = Uniform::new(0, stealers.len());
                    loop {
                        let chunk = find_chunk(task_id, &worker, injector, stealers, &victims);
                        match chunk {
                            Some(chunk) => {
                                seen.fetch_add(chunk.len(), Ordering::Relaxed);
                                pending.drained();
                            }
                            None if pending.is_empty() => break,
                            None => std::thread::yield_now(),
                        }
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 10_000);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_totals_accumulate() {
        let totals = ParallelTotals::default();
        let counters = CopyCounters {
            objects_copied: 2,
            bytes_copied: 64,
            ..Default::default()
        };
        totals.add(&counters);
        totals.add(&counters);
        assert_eq!(totals.load().objects_copied, 4);
        assert_eq!(totals.load().bytes_copied, 128);
        totals.reset();
        assert_eq!(totals.load().objects_copied, 0);
    }
}
