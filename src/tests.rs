use std::{collections::HashSet, ptr::null_mut, sync::Arc};

use crate::{
    api::{
        MarkCallbacks, NoReferenceProcessing, ObjectModel, ObjectRef, ReferenceProcessor,
        Visitor,
    },
    bump_pointer_space::BumpPointerSpace,
    config::{CollectorConfig, HeapConfig, MallocSpaceConfig, SlabConfig},
    heap::Heap,
    rosalloc_space::RosAllocSpace,
    semispace::{CollectorHeap, SemiSpace},
    space::{GcRetentionPolicy, Space},
    statistics::{GcCause, ObjectBytePair},
    utils::{mmap::Protection, KB, MB},
};

const HEADER_WORDS: usize = 3;
const KIND_NORMAL: usize = 0;
/// The first slot of such an object is only followed by reference processing.
const KIND_WEAK: usize = 1;

/// Objects are `[size, slot count, kind, slots..., payload...]`.
struct TestModel;

impl ObjectModel for TestModel {
    fn size_of(&self, obj: ObjectRef) -> usize {
        unsafe { *(obj as *const usize) }
    }

    fn visit_references(&self, obj: ObjectRef, visitor: &mut dyn Visitor) {
        unsafe {
            let header = obj as *const usize;
            let count = *header.add(1);
            let mut first = 0;
            if *header.add(2) == KIND_WEAK {
                visitor.delay_reference_referent(obj);
                first = 1;
            }
            for i in first..count {
                visitor.mark_object(&mut *slot(obj, i));
            }
        }
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const fn object_size(slots: usize, payload: usize) -> usize {
    (HEADER_WORDS + slots) * 8 + payload
}

unsafe fn init_object(obj: ObjectRef, size: usize, slots: usize, kind: usize) -> ObjectRef {
    let header = obj as *mut usize;
    header.write(size);
    header.add(1).write(slots);
    header.add(2).write(kind);
    obj
}

fn slot(obj: ObjectRef, i: usize) -> *mut ObjectRef {
    unsafe { (obj as *mut ObjectRef).add(HEADER_WORDS + i) }
}

fn load(obj: ObjectRef, i: usize) -> ObjectRef {
    unsafe { *slot(obj, i) }
}

fn store(obj: ObjectRef, i: usize, value: ObjectRef) {
    unsafe { *slot(obj, i) = value }
}

/// First payload word of an object with `slots` reference slots.
fn payload(obj: ObjectRef, slots: usize) -> *mut usize {
    slot(obj, slots) as *mut usize
}

fn no_roots() -> Vec<ObjectRef> {
    Vec::new()
}

fn new_object(heap: &Heap, slots: usize, payload_bytes: usize) -> ObjectRef {
    let size = object_size(slots, payload_bytes);
    let obj = heap.alloc(size).expect("heap exhausted");
    unsafe { init_object(obj, size, slots, KIND_NORMAL) }
}

fn config(collector: CollectorConfig) -> HeapConfig {
    HeapConfig {
        semispace_size: MB,
        main_space: MallocSpaceConfig::new(4 * MB, 4 * MB, 4 * MB),
        non_moving_space: MallocSpaceConfig::new(MB, MB, MB),
        low_memory_mode: false,
        large_object_space: true,
        verify_post_gc: true,
        collector,
    }
}

fn verbose() -> CollectorConfig {
    CollectorConfig {
        verbose: true,
        ..Default::default()
    }
}

fn new_heap(collector: CollectorConfig) -> Heap {
    init_logging();
    Heap::new(config(collector), Box::new(TestModel)).unwrap()
}

#[test]
fn test_full_collection_moves_only_reachable_objects() {
    let mut heap = new_heap(verbose());
    let mut head = null_mut();
    for i in 0..150 {
        let node = new_object(&heap, 1, 8);
        unsafe { *payload(node, 1) = i };
        if i % 3 != 0 {
            store(node, 0, head);
            head = node;
        }
    }
    let mut roots = vec![head];
    let stats = heap.collect_garbage(&mut roots, GcCause::Explicit, false);

    assert!(stats.whole_heap);
    assert_eq!(stats.objects_moved, 100);
    assert_eq!(stats.objects_promoted, 0);
    assert_eq!(
        stats.freed,
        ObjectBytePair::new(50, 50 * object_size(1, 8) as i64)
    );
    let bump = heap.bump_pointer_space();
    assert_eq!(bump.objects_allocated(), 100);
    assert_eq!(heap.temp_space().objects_allocated(), 0);

    let mut node = roots[0];
    let mut seen = 0;
    while !node.is_null() {
        assert!(bump.has_address(node));
        assert_ne!(unsafe { *payload(node, 1) } % 3, 0);
        node = load(node, 0);
        seen += 1;
    }
    assert_eq!(seen, 100);
}

#[test]
fn test_survivor_is_promoted_on_second_collection() {
    let mut heap = new_heap(verbose());
    // 40 bytes, served from the 48 byte bracket once promoted.
    let obj = new_object(&heap, 2, 0);
    assert!(heap.collector().config().generational);
    let mut roots = vec![obj];

    let first = heap.collect_garbage(&mut roots, GcCause::Background, false);
    assert!(!first.whole_heap);
    assert_eq!(first.objects_promoted, 0);
    assert!(heap.bump_pointer_space().has_address(roots[0]));
    assert!(roots[0] < heap.collector().last_gc_to_space_end());

    let second = heap.collect_garbage(&mut roots, GcCause::Background, false);
    assert_eq!(second.objects_promoted, 1);
    assert_eq!(second.bytes_promoted, 48);
    assert_eq!(second.bytes_wasted_promoted, 8);
    assert_eq!(
        heap.collector().bytes_promoted_since_last_whole_heap_collection(),
        48
    );
    let main = heap.main_space();
    assert!(main.has_address(roots[0]));
    assert!(main.live_bitmap().unwrap().test(roots[0]));
    assert_eq!(main.objects_allocated(), 1);
    assert_eq!(heap.collector().cumulative().bytes_promoted, 48);

    // A whole heap collection keeps the promoted object while it is reachable.
    let third = heap.collect_garbage(&mut roots, GcCause::Explicit, false);
    assert!(third.whole_heap);
    assert!(third.clear_soft_references);
    assert_eq!(third.objects_moved, 0);
    assert!(heap.main_space().live_bitmap().unwrap().test(roots[0]));
    assert!(heap.collector().collect_from_space_only());

    roots.clear();
    let fourth = heap.collect_garbage(&mut roots, GcCause::Explicit, false);
    assert_eq!(fourth.freed, ObjectBytePair::new(1, 48));
    assert_eq!(heap.main_space().objects_allocated(), 0);
    assert_eq!(heap.collector().cumulative().iterations, 4);
    assert_eq!(heap.collector().cumulative().whole_heap_iterations, 2);
}

#[test]
fn test_parallel_copy_forwards_each_object_once() {
    const N: usize = 2000;
    const ROOTS: usize = 300;
    let mut heap = new_heap(CollectorConfig {
        generational: false,
        parallel_gc_threads: 3,
        ..verbose()
    });
    assert_eq!(heap.collector().thread_count(), 4);

    let children = |i: usize| [(i * 7 + 1) % N, (i * 13 + 5) % N];
    let objects: Vec<ObjectRef> = (0..N)
        .map(|i| {
            let obj = new_object(&heap, 2, 8);
            unsafe { *payload(obj, 2) = i };
            obj
        })
        .collect();
    for (i, &obj) in objects.iter().enumerate() {
        for (s, child) in children(i).iter().enumerate() {
            store(obj, s, objects[*child]);
        }
    }

    let mut reachable = vec![false; N];
    let mut pending: Vec<usize> = (0..ROOTS).collect();
    while let Some(i) = pending.pop() {
        if !reachable[i] {
            reachable[i] = true;
            pending.extend(children(i).iter().copied());
        }
    }
    let expected = reachable.iter().filter(|&&r| r).count();

    let mut roots: Vec<ObjectRef> = objects[..ROOTS].to_vec();
    let stats = heap.collect_garbage(&mut roots, GcCause::Explicit, false);
    assert!(stats.parallel);
    assert_eq!(stats.objects_moved, expected);

    let bump = heap.bump_pointer_space().clone();
    assert_eq!(bump.objects_allocated(), expected);
    let mut ids = HashSet::new();
    bump.walk(&TestModel, |obj| {
        let id = unsafe { *payload(obj, 2) };
        assert!(reachable[id]);
        assert!(ids.insert(id), "object {} was copied twice", id);
        for (s, child) in children(id).iter().enumerate() {
            let referent = load(obj, s);
            assert!(bump.has_address(referent));
            assert_eq!(unsafe { *payload(referent, 2) }, *child);
        }
    });
    assert_eq!(ids.len(), expected);
    for (i, &root) in roots.iter().enumerate() {
        assert_eq!(unsafe { *payload(root, 2) }, i);
    }
}

#[test]
fn test_parallel_copy_promotes_survivors() {
    const N: usize = 1000;
    let mut heap = new_heap(CollectorConfig {
        parallel_gc_threads: 3,
        ..verbose()
    });
    // 40 bytes, promoted into the 48 byte bracket.
    assert_eq!(object_size(1, 8), 40);
    let mut roots: Vec<ObjectRef> = (0..N)
        .map(|i| {
            let obj = new_object(&heap, 1, 8);
            unsafe { *payload(obj, 1) = i };
            obj
        })
        .collect();
    // Every object also references its successor, so most are reached twice.
    for i in 0..N {
        store(roots[i], 0, roots[(i + 1) % N]);
    }

    let first = heap.collect_garbage(&mut roots, GcCause::Background, false);
    assert!(first.parallel);
    assert_eq!(first.objects_moved, N);
    assert_eq!(first.objects_promoted, 0);

    let second = heap.collect_garbage(&mut roots, GcCause::Background, false);
    assert!(!second.whole_heap);
    assert!(second.parallel);
    assert_eq!(second.objects_promoted, N);
    assert_eq!(second.bytes_promoted, N * 48);
    assert_eq!(second.bytes_wasted_promoted, N * 8);
    assert_eq!(heap.collector().last_cycle().objects_promoted, N);
    assert_eq!(heap.bump_pointer_space().objects_allocated(), 0);

    let main = heap.main_space().clone();
    assert_eq!(main.objects_allocated(), N);
    let mut ids = HashSet::new();
    main.visit_live_objects(|obj| {
        let id = unsafe { *payload(obj, 1) };
        assert!(ids.insert(id), "object {} was promoted twice", id);
        let next = load(obj, 0);
        assert!(main.has_address(next));
        assert_eq!(unsafe { *payload(next, 1) }, (id + 1) % N);
    });
    assert_eq!(ids.len(), N);
    for (i, &root) in roots.iter().enumerate() {
        assert!(main.has_address(root));
        assert_eq!(unsafe { *payload(root, 1) }, i);
    }
}

#[test]
fn test_duplicate_roots_share_forwarding_address() {
    let mut heap = new_heap(verbose());
    let a = new_object(&heap, 0, 8);
    let b = new_object(&heap, 2, 0);
    store(b, 0, a);
    store(b, 1, a);
    let mut roots = vec![a, a, b];
    let stats = heap.collect_garbage(&mut roots, GcCause::Explicit, false);

    assert_eq!(stats.objects_moved, 2);
    assert_eq!(roots[0], roots[1]);
    assert_eq!(load(roots[2], 0), roots[0]);
    assert_eq!(load(roots[2], 1), roots[0]);
}

/// Keeps referents alive unless soft references are being cleared.
struct SoftReferences;

impl ReferenceProcessor for SoftReferences {
    fn process_references(
        &mut self,
        references: &[ObjectRef],
        clear_soft_references: bool,
        callbacks: &mut dyn MarkCallbacks,
    ) {
        for &reference in references {
            let referent = load(reference, 0);
            if referent.is_null() {
                continue;
            }
            let new_referent = match callbacks.get_marked_forward_address(referent) {
                Some(forwarded) => forwarded,
                None if !clear_soft_references => callbacks.mark_object(referent),
                None => null_mut(),
            };
            store(reference, 0, new_referent);
        }
        callbacks.process_mark_stack();
    }
}

fn new_reference(heap: &Heap, referent: ObjectRef) -> ObjectRef {
    let size = object_size(1, 0);
    let obj = heap.alloc(size).unwrap();
    unsafe { init_object(obj, size, 1, KIND_WEAK) };
    store(obj, 0, referent);
    obj
}

#[test]
fn test_weak_referents_are_cleared_or_updated() {
    let mut heap = new_heap(verbose());
    heap.set_reference_processor(Box::new(SoftReferences));
    let dead = new_object(&heap, 0, 8);
    let alive = new_object(&heap, 0, 8);
    let to_dead = new_reference(&heap, dead);
    let to_alive = new_reference(&heap, alive);
    let mut roots = vec![to_dead, to_alive, alive];

    let stats = heap.collect_garbage(&mut roots, GcCause::Explicit, false);
    assert_eq!(stats.objects_moved, 3);
    assert!(load(roots[0], 0).is_null());
    assert_eq!(load(roots[1], 0), roots[2]);
}

#[test]
fn test_soft_referents_survive_bump_pointer_collections() {
    let mut heap = new_heap(verbose());
    heap.set_reference_processor(Box::new(SoftReferences));
    let referent = new_object(&heap, 1, 8);
    let child = new_object(&heap, 0, 8);
    store(referent, 0, child);
    unsafe { *payload(child, 0) = 42 };
    let mut roots = vec![new_reference(&heap, referent)];

    let stats = heap.collect_garbage(&mut roots, GcCause::Background, false);
    assert!(!stats.clear_soft_references);
    assert_eq!(stats.objects_moved, 3);
    let referent = load(roots[0], 0);
    assert!(heap.bump_pointer_space().has_address(referent));
    assert_eq!(unsafe { *payload(load(referent, 0), 0) }, 42);

    // Soft references are cleared as soon as the whole heap is collected.
    let stats = heap.collect_garbage(&mut roots, GcCause::Background, true);
    assert!(stats.whole_heap);
    assert!(load(roots[0], 0).is_null());
}

#[test]
fn test_promotion_threshold_triggers_whole_heap_collection() {
    init_logging();
    let mut heap = Heap::new(
        HeapConfig {
            semispace_size: 8 * MB,
            main_space: MallocSpaceConfig::new(16 * MB, 16 * MB, 16 * MB),
            large_object_space: false,
            ..config(verbose())
        },
        Box::new(TestModel),
    )
    .unwrap();
    let mut roots: Vec<ObjectRef> = (0..80)
        .map(|_| new_object(&heap, 0, 64 * KB - object_size(0, 0)))
        .collect();

    let first = heap.collect_garbage(&mut roots, GcCause::Background, false);
    assert!(!first.whole_heap);
    assert!(heap.collector().collect_from_space_only());

    let second = heap.collect_garbage(&mut roots, GcCause::Background, false);
    assert!(!second.whole_heap);
    assert_eq!(second.objects_promoted, 80);
    assert_eq!(second.bytes_promoted, 80 * 64 * KB);
    assert!(!heap.collector().collect_from_space_only());

    let third = heap.collect_garbage(&mut roots, GcCause::Background, false);
    assert!(third.whole_heap);
    assert!(heap.collector().collect_from_space_only());
    assert_eq!(
        heap.collector().bytes_promoted_since_last_whole_heap_collection(),
        0
    );
    assert!(roots.iter().all(|&root| heap.main_space().has_address(root)));
}

#[test]
fn test_non_moving_objects_are_roots_of_bump_pointer_collections() {
    let mut heap = new_heap(verbose());
    let size = object_size(1, 0);
    let holder = heap.alloc_non_moving(size).unwrap();
    unsafe { init_object(holder, size, 1, KIND_NORMAL) };
    let young = new_object(&heap, 0, 8);
    unsafe { *payload(young, 0) = 7 };
    store(holder, 0, young);

    let stats = heap.collect_garbage(&mut no_roots(), GcCause::Background, false);
    assert_eq!(stats.objects_moved, 1);
    let moved = load(holder, 0);
    assert!(heap.bump_pointer_space().has_address(moved));
    assert_eq!(unsafe { *payload(moved, 0) }, 7);

    // Nothing roots the holder once the whole heap is collected.
    let stats = heap.collect_garbage(&mut no_roots(), GcCause::Explicit, false);
    assert_eq!(stats.objects_moved, 0);
    assert_eq!(stats.freed.objects, 2);
    assert_eq!(heap.non_moving_space().objects_allocated(), 0);
}

#[test]
fn test_large_objects_are_only_swept_by_whole_heap_collections() {
    let mut heap = new_heap(verbose());
    let size = 16 * KB;
    let big = heap.alloc(size).unwrap();
    unsafe { init_object(big, size, 1, KIND_NORMAL) };
    let garbage = heap.alloc(size).unwrap();
    unsafe { init_object(garbage, size, 0, KIND_NORMAL) };
    let los = heap.large_object_space().unwrap();
    assert!(los.has_address(big) && los.has_address(garbage));
    store(big, 0, new_object(&heap, 0, 8));

    let stats = heap.collect_garbage(&mut no_roots(), GcCause::Background, false);
    assert_eq!(stats.objects_moved, 1);
    assert_eq!(stats.freed_los, ObjectBytePair::default());
    assert!(heap.bump_pointer_space().has_address(load(big, 0)));
    assert_eq!(heap.large_object_space().unwrap().objects_allocated(), 2);

    let mut roots = vec![big];
    let stats = heap.collect_garbage(&mut roots, GcCause::Explicit, false);
    assert_eq!(roots[0], big);
    assert_eq!(stats.objects_moved, 1);
    assert_eq!(stats.freed_los, ObjectBytePair::new(1, size as i64));
    let los = heap.large_object_space().unwrap();
    assert_eq!(los.objects_allocated(), 1);
    assert!(los.is_live(big));
    assert!(!los.is_marked(big));
}

#[test]
fn test_immune_space_references_are_updated() {
    let mut heap = new_heap(verbose());
    let image = Arc::new(
        RosAllocSpace::create(
            "image space",
            MallocSpaceConfig::new(MB, MB, MB),
            &SlabConfig::default(),
            false,
        )
        .unwrap()
        .with_retention_policy(GcRetentionPolicy::NeverCollect),
    );
    let runs = image.attach_thread();
    let size = object_size(1, 0);
    let holder = image.alloc_object(&runs, size).unwrap().ptr.as_ptr();
    unsafe { init_object(holder, size, 1, KIND_NORMAL) };
    store(holder, 0, new_object(&heap, 0, 8));
    heap.add_immune_space(image.clone());

    for cause in [GcCause::Background, GcCause::Explicit].iter() {
        let stats = heap.collect_garbage(&mut no_roots(), *cause, false);
        assert_eq!(stats.objects_moved, 1);
        // Promoted by the second collection.
        assert!(!heap.temp_space().has_address(load(holder, 0)));
        assert!(image.live_bitmap().unwrap().test(holder));
    }
    image.detach_thread(&runs);
}

fn bump_space(name: &'static str, capacity: usize) -> Arc<BumpPointerSpace> {
    Arc::new(BumpPointerSpace::create(name, capacity).unwrap())
}

fn fallback_space() -> Arc<RosAllocSpace> {
    Arc::new(
        RosAllocSpace::create(
            "fallback space",
            MallocSpaceConfig::new(MB, MB, MB),
            &SlabConfig::default(),
            false,
        )
        .unwrap(),
    )
}

#[test]
fn test_fallback_space_catches_to_space_overflow() {
    init_logging();
    let from = bump_space("from space", 64 * KB);
    let to = bump_space("to space", 4 * KB);
    let fallback = fallback_space();
    let mut roots: Vec<ObjectRef> = (0..20)
        .map(|_| {
            let obj = from.bump_alloc(512).unwrap().as_ptr();
            unsafe { init_object(obj, 512, 0, KIND_NORMAL) }
        })
        .collect();

    let mut collector = SemiSpace::new(CollectorConfig {
        generational: false,
        protect_from_space: false,
        ..verbose()
    });
    collector.set_from_space(from.clone());
    collector.set_to_space(to.clone());
    let heap = CollectorHeap {
        model: &TestModel,
        spaces: vec![
            from.clone() as Arc<dyn Space>,
            to.clone() as Arc<dyn Space>,
            fallback.clone() as Arc<dyn Space>,
        ],
        large_object_space: None,
        main_space: None,
        non_moving_space: fallback.clone(),
    };
    let stats = collector
        .run(&heap, &mut roots, &mut NoReferenceProcessing, GcCause::Explicit, false)
        .clone();

    assert_eq!(stats.objects_moved, 20);
    assert_eq!(stats.objects_fallback, 12);
    assert_eq!(stats.bytes_fallback, 12 * 512);
    assert!(roots[..8].iter().all(|&root| to.has_address(root)));
    for &root in &roots[8..] {
        assert!(fallback.has_address(root));
        assert!(fallback.live_bitmap().unwrap().test(root));
        assert!(!fallback.mark_bitmap().unwrap().test(root));
    }
    assert_eq!(fallback.objects_allocated(), 12);
    assert_eq!(from.bytes_allocated(), 0);
}

#[test]
fn test_slab_backed_from_space_is_compacted() {
    init_logging();
    let from = Arc::new(
        RosAllocSpace::create(
            "compacted space",
            MallocSpaceConfig::new(MB, MB, MB),
            &SlabConfig::default(),
            true,
        )
        .unwrap(),
    );
    let to = bump_space("to space", 64 * KB);
    let fallback = fallback_space();
    let runs = from.attach_thread();
    let size = object_size(2, 0);
    let objects: Vec<ObjectRef> = (0..60)
        .map(|_| {
            let obj = from.alloc_object(&runs, size).unwrap().ptr.as_ptr();
            unsafe { init_object(obj, size, 2, KIND_NORMAL) }
        })
        .collect();
    for pair in objects[..50].windows(2) {
        store(pair[0], 0, pair[1]);
    }
    let mut roots = vec![objects[0]];

    let mut collector = SemiSpace::new(CollectorConfig {
        generational: false,
        ..verbose()
    });
    collector.set_from_space(from.clone());
    collector.set_to_space(to.clone());
    let heap = CollectorHeap {
        model: &TestModel,
        spaces: vec![
            from.clone() as Arc<dyn Space>,
            to.clone() as Arc<dyn Space>,
            fallback.clone() as Arc<dyn Space>,
        ],
        large_object_space: None,
        main_space: None,
        non_moving_space: fallback.clone(),
    };
    let stats = collector
        .run(&heap, &mut roots, &mut NoReferenceProcessing, GcCause::Explicit, false)
        .clone();

    assert_eq!(stats.objects_moved, 50);
    assert_eq!(stats.freed.objects, 10);
    assert_eq!(to.objects_allocated(), 50);
    let mut node = roots[0];
    let mut count = 0;
    while !node.is_null() {
        assert!(to.has_address(node));
        node = load(node, 0);
        count += 1;
    }
    assert_eq!(count, 50);

    from.protect(Protection::ReadWrite);
    assert_eq!(from.bytes_allocated(), 0);
    from.detach_thread(&runs);
}
