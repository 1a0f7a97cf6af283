use std::ptr::null_mut;

use nova::{
    api::{ObjectModel, ObjectRef, Visitor},
    statistics::GcCause,
    CollectorConfig, Heap, HeapConfig,
};

/// `[size, next, value]`
struct Node;

const NODE_SIZE: usize = 24;

impl ObjectModel for Node {
    fn size_of(&self, _obj: ObjectRef) -> usize {
        NODE_SIZE
    }

    fn visit_references(&self, obj: ObjectRef, visitor: &mut dyn Visitor) {
        unsafe { visitor.mark_object(&mut *next(obj)) }
    }
}

fn next(obj: ObjectRef) -> *mut ObjectRef {
    unsafe { obj.add(8) as *mut ObjectRef }
}

fn value(obj: ObjectRef) -> *mut i64 {
    unsafe { obj.add(16) as *mut i64 }
}

fn main() {
    let config = HeapConfig {
        collector: CollectorConfig {
            parallel_gc_threads: 2,
            ..Default::default()
        },
        verify_post_gc: true,
        ..Default::default()
    };
    let mut heap = Heap::new(config, Box::new(Node)).expect("failed to reserve the heap");
    let mut roots: Vec<ObjectRef> = vec![null_mut()];

    for round in 0..10 {
        for i in 0..100_000 {
            let node = match heap.alloc(NODE_SIZE) {
                Some(node) => node,
                None => {
                    heap.collect_garbage(&mut roots, GcCause::AllocationFailure, false);
                    heap.alloc(NODE_SIZE).expect("out of memory")
                }
            };
            unsafe {
                *value(node) = i;
                // Keep every 10th node alive.
                if i % 10 == 0 {
                    *next(node) = roots[0];
                    roots[0] = node;
                }
            }
        }
        let stats = heap.collect_garbage(&mut roots, GcCause::Background, false);
        println!("round {}: {}", round, stats);
    }

    let mut count = 0;
    let mut node = roots[0];
    while !node.is_null() {
        count += 1;
        node = unsafe { *next(node) };
    }
    assert_eq!(count, 100_000);
    println!("{}", heap.collector().cumulative());
}
