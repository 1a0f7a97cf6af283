use std::sync::Arc;

use crate::{
    api::{NoReferenceProcessing, ObjectModel, ObjectRef, ReferenceProcessor, RootSet},
    bump_pointer_space::BumpPointerSpace,
    config::HeapConfig,
    error::SpaceError,
    large_space::{LargeObjectSpace, LARGE_OBJECT_THRESHOLD},
    rosalloc_space::RosAllocSpace,
    semispace::{verify_no_from_space_references, CollectorHeap, SemiSpace},
    slab::ThreadLocalRuns,
    space::Space,
    statistics::{CycleStatistics, GcCause},
    utils::{formatted_size, mmap::Protection},
};

/// Owner of every space and of the collector.
///
/// New objects are bump allocated in one semi-space. A collection evacuates it into the
/// other one, promoting older survivors into the main space, and then swaps the two.
pub struct Heap {
    model: Box<dyn ObjectModel>,
    references: Box<dyn ReferenceProcessor>,
    bump_pointer_space: Arc<BumpPointerSpace>,
    temp_space: Arc<BumpPointerSpace>,
    main_space: Arc<RosAllocSpace>,
    non_moving_space: Arc<RosAllocSpace>,
    large_object_space: Option<LargeObjectSpace>,
    immune_spaces: Vec<Arc<dyn Space>>,
    non_moving_runs: Arc<ThreadLocalRuns>,
    collector: SemiSpace,
    verify_post_gc: bool,
    num_collections: usize,
}

impl Heap {
    pub fn new(config: HeapConfig, model: Box<dyn ObjectModel>) -> Result<Self, SpaceError> {
        let slab_config = config.slab_config();
        let HeapConfig {
            semispace_size,
            main_space,
            non_moving_space,
            large_object_space,
            verify_post_gc,
            collector,
            low_memory_mode: _,
        } = config;
        let bump_pointer_space = Arc::new(BumpPointerSpace::create(
            "bump pointer space 1",
            semispace_size,
        )?);
        let temp_space = Arc::new(BumpPointerSpace::create(
            "bump pointer space 2",
            semispace_size,
        )?);
        let main_space = Arc::new(RosAllocSpace::create(
            "main space",
            main_space,
            &slab_config,
            false,
        )?);
        let non_moving_space = Arc::new(RosAllocSpace::create(
            "non moving space",
            non_moving_space,
            &slab_config,
            false,
        )?);
        let non_moving_runs = non_moving_space.attach_thread();
        log::debug!(
            "heap: semi-spaces of {}, main space {}, non moving space {}",
            formatted_size(semispace_size),
            formatted_size(main_space.capacity()),
            formatted_size(non_moving_space.capacity())
        );
        Ok(Self {
            model,
            references: Box::new(NoReferenceProcessing),
            bump_pointer_space,
            temp_space,
            main_space,
            non_moving_space,
            large_object_space: if large_object_space {
                Some(LargeObjectSpace::new())
            } else {
                None
            },
            immune_spaces: Vec::new(),
            non_moving_runs,
            collector: SemiSpace::new(collector),
            verify_post_gc,
            num_collections: 0,
        })
    }

    pub fn set_reference_processor(&mut self, references: Box<dyn ReferenceProcessor>) {
        self.references = references;
    }

    /// Adds a space the collector scans for references but never collects, such as a boot
    /// image.
    pub fn add_immune_space(&mut self, space: Arc<dyn Space>) {
        self.immune_spaces.push(space);
    }

    /// Allocates a zeroed movable object. Returns `None` when a collection is needed.
    pub fn alloc(&self, size: usize) -> Option<ObjectRef> {
        if size >= LARGE_OBJECT_THRESHOLD {
            if let Some(ref los) = self.large_object_space {
                return los.alloc(size).map(|allocation| allocation.ptr.as_ptr());
            }
        }
        self.bump_pointer_space
            .bump_alloc(size)
            .map(|ptr| ptr.as_ptr())
    }

    /// Allocates a zeroed object that is never moved.
    pub fn alloc_non_moving(&mut self, size: usize) -> Option<ObjectRef> {
        self.non_moving_space
            .alloc_with_growth(&self.non_moving_runs, size)
            .map(|allocation| allocation.ptr.as_ptr())
    }

    /// Space new objects are allocated in.
    pub fn bump_pointer_space(&self) -> &Arc<BumpPointerSpace> {
        &self.bump_pointer_space
    }

    /// The other semi-space, empty between collections.
    pub fn temp_space(&self) -> &Arc<BumpPointerSpace> {
        &self.temp_space
    }

    pub fn main_space(&self) -> &Arc<RosAllocSpace> {
        &self.main_space
    }

    pub fn non_moving_space(&self) -> &Arc<RosAllocSpace> {
        &self.non_moving_space
    }

    pub fn large_object_space(&self) -> Option<&LargeObjectSpace> {
        self.large_object_space.as_ref()
    }

    pub fn collector(&self) -> &SemiSpace {
        &self.collector
    }

    pub fn num_collections(&self) -> usize {
        self.num_collections
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bump_pointer_space.bytes_allocated()
            + self.main_space.bytes_allocated()
            + self.non_moving_space.bytes_allocated()
            + self
                .large_object_space
                .as_ref()
                .map_or(0, |los| los.bytes_allocated())
    }

    /// Evacuates the bump pointer space. Every slot visited by `roots` is updated to the new
    /// address of its object.
    pub fn collect_garbage(
        &mut self,
        roots: &mut dyn RootSet,
        cause: GcCause,
        clear_soft_references: bool,
    ) -> CycleStatistics {
        let from_space: Arc<dyn Space> = self.bump_pointer_space.clone();
        let to_space: Arc<dyn Space> = self.temp_space.clone();
        to_space.protect(Protection::ReadWrite);
        self.collector.set_from_space(from_space.clone());
        self.collector.set_to_space(to_space);

        let mut spaces = vec![
            self.bump_pointer_space.clone() as Arc<dyn Space>,
            self.temp_space.clone() as Arc<dyn Space>,
            self.main_space.clone() as Arc<dyn Space>,
            self.non_moving_space.clone() as Arc<dyn Space>,
        ];
        spaces.extend(self.immune_spaces.iter().cloned());
        let heap = CollectorHeap {
            model: &*self.model,
            spaces,
            large_object_space: self.large_object_space.as_ref(),
            main_space: Some(self.main_space.clone()),
            non_moving_space: self.non_moving_space.clone(),
        };
        let stats = self
            .collector
            .run(
                &heap,
                roots,
                &mut *self.references,
                cause,
                clear_soft_references,
            )
            .clone();
        drop(heap);
        self.num_collections += 1;

        std::mem::swap(&mut self.bump_pointer_space, &mut self.temp_space);
        if self.verify_post_gc {
            self.verify_no_from_space_references(&*from_space);
        }
        stats
    }

    /// Walks every object that survived the last collection.
    pub fn visit_objects(&self, mut visitor: impl FnMut(ObjectRef)) {
        self.bump_pointer_space.walk(&*self.model, &mut visitor);
        self.main_space.visit_live_objects(&mut visitor);
        self.non_moving_space.visit_live_objects(&mut visitor);
        if let Some(ref los) = self.large_object_space {
            for obj in los.live_objects() {
                visitor(obj);
            }
        }
    }

    fn verify_no_from_space_references(&self, from_space: &dyn Space) {
        let model = &*self.model;
        let mut count = 0;
        self.visit_objects(|obj| {
            verify_no_from_space_references(model, from_space, obj);
            count += 1;
        });
        log::debug!("heap: verified {} objects after collection", count);
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.non_moving_space.detach_thread(&self.non_moving_runs);
    }
}
