//! Size-classed run allocator and a generational semi-space copying collector.
//!
//! [`slab::SlabAllocator`] hands out small objects from page runs split into equally sized
//! slots, with a per-thread fast path. [`semispace::SemiSpace`] evacuates a bump pointer
//! space into its twin, promoting older survivors into a slab backed space, optionally on
//! several threads. [`heap::Heap`] wires the spaces and the collector together.
//!
//! The collector never looks inside objects: the embedder describes them through
//! [`api::ObjectModel`] and supplies roots through [`api::RootSet`].

#[macro_use]
pub mod utils;

pub mod api;
pub mod bitmap;
pub mod bump_pointer_space;
pub mod config;
pub mod error;
pub mod forwarding;
pub mod heap;
pub mod large_space;
pub mod rosalloc_space;
pub mod semispace;
pub mod slab;
pub mod space;
pub mod statistics;

pub use config::{CollectorConfig, HeapConfig, MallocSpaceConfig, SlabConfig};
pub use error::SpaceError;
pub use heap::Heap;

#[cfg(test)]
mod tests;
