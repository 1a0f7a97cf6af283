use std::io;

use thiserror::Error;

/// Failures while setting up a space or allocator. Running out of memory later on is not an
/// error: allocation entry points return `None` instead.
#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("failed to reserve {size} bytes for {name}: {source}")]
    Reserve {
        name: &'static str,
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("invalid sizes for {name}: initial size {initial_size} > growth limit {growth_limit}")]
    InitialSizeTooLarge {
        name: &'static str,
        initial_size: usize,
        growth_limit: usize,
    },
    #[error("invalid sizes for {name}: growth limit {growth_limit} > capacity {capacity}")]
    GrowthLimitTooLarge {
        name: &'static str,
        growth_limit: usize,
        capacity: usize,
    },
    #[error("{name} needs a non-empty capacity")]
    EmptyCapacity { name: &'static str },
    #[error("failed to create bitmap for {name}: {source}")]
    Bitmap {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}
