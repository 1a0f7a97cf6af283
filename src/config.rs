use crate::{
    slab::{
        brackets::NUM_THREAD_LOCAL_BRACKETS,
        PageReleaseMode,
    },
    utils::MB,
};

pub const DEFAULT_PAGE_RELEASE_SIZE_THRESHOLD: usize = 4 * MB;

pub struct SlabConfig {
    pub page_release_mode: PageReleaseMode,
    /// Free page runs at least this large are released under the `Size` modes.
    pub page_release_size_threshold: usize,
    /// Brackets below this index are served from per-thread runs.
    pub num_thread_local_brackets: usize,
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self {
            page_release_mode: PageReleaseMode::SizeAndEnd,
            page_release_size_threshold: DEFAULT_PAGE_RELEASE_SIZE_THRESHOLD,
            num_thread_local_brackets: NUM_THREAD_LOCAL_BRACKETS,
        }
    }
}

impl SlabConfig {
    pub fn low_memory() -> Self {
        Self {
            page_release_mode: PageReleaseMode::All,
            ..Default::default()
        }
    }
}

pub struct CollectorConfig {
    /// Promote objects that survived a previous cycle into the promotion space.
    pub generational: bool,
    /// Extra worker threads used to drain the mark stack. Zero keeps marking serial.
    pub parallel_gc_threads: usize,
    /// Size of the small leading chunks handed to workers, in mark stack entries per
    /// piece.
    pub first_iter_copy_size: usize,
    /// Make from-space inaccessible once it has been evacuated.
    pub protect_from_space: bool,
    /// Enables the per cycle summary line.
    pub verbose: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            generational: true,
            parallel_gc_threads: 0,
            first_iter_copy_size: 8,
            protect_from_space: true,
            verbose: false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MallocSpaceConfig {
    pub initial_size: usize,
    pub growth_limit: usize,
    pub capacity: usize,
}

impl MallocSpaceConfig {
    pub const fn new(initial_size: usize, growth_limit: usize, capacity: usize) -> Self {
        Self {
            initial_size,
            growth_limit,
            capacity,
        }
    }
}

pub struct HeapConfig {
    /// Size of each of the two bump pointer semi-spaces.
    pub semispace_size: usize,
    /// Promotion destination.
    pub main_space: MallocSpaceConfig,
    /// Last resort destination when the semi-space runs out while copying.
    pub non_moving_space: MallocSpaceConfig,
    /// Release every empty page back to the OS.
    pub low_memory_mode: bool,
    pub large_object_space: bool,
    /// Walk every survivor after a cycle and check it no longer points into from-space.
    pub verify_post_gc: bool,
    pub collector: CollectorConfig,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            semispace_size: 32 * MB,
            main_space: MallocSpaceConfig::new(16 * MB, 256 * MB, 256 * MB),
            non_moving_space: MallocSpaceConfig::new(4 * MB, 64 * MB, 64 * MB),
            low_memory_mode: false,
            large_object_space: true,
            verify_post_gc: false,
            collector: CollectorConfig::default(),
        }
    }
}

impl HeapConfig {
    pub fn slab_config(&self) -> SlabConfig {
        if self.low_memory_mode {
            SlabConfig::low_memory()
        } else {
            SlabConfig::default()
        }
    }
}
