use std::time::Duration;

use crate::utils::formatted_size;

/// Objects and bytes reclaimed by one step of a cycle.
///
/// Bytes are signed: promoting into a space with coarser size classes can free a negative
/// amount.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct ObjectBytePair {
    pub objects: u64,
    pub bytes: i64,
}

impl ObjectBytePair {
    pub const fn new(objects: u64, bytes: i64) -> Self {
        Self { objects, bytes }
    }

    pub fn add(&mut self, other: ObjectBytePair) {
        self.objects += other.objects;
        self.bytes += other.bytes;
    }
}

/// Why a collection was requested.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcCause {
    /// Requested by the program. Always collects the whole heap.
    Explicit,
    /// Native allocations crossed their watermark. Always collects the whole heap.
    NativeAlloc,
    AllocationFailure,
    Background,
}

/// Counters of a single cycle.
#[derive(Clone, Default, Debug)]
pub struct CycleStatistics {
    pub cause: Option<GcCause>,
    pub whole_heap: bool,
    pub clear_soft_references: bool,
    /// Objects copied out of from-space, wherever they landed.
    pub objects_moved: usize,
    pub bytes_moved: usize,
    pub objects_promoted: usize,
    pub bytes_promoted: usize,
    /// Bytes lost to size class rounding when promoting.
    pub bytes_wasted_promoted: usize,
    pub objects_fallback: usize,
    pub bytes_fallback: usize,
    /// Free bytes left in per-worker runs when parallel copying finished.
    pub bytes_wasted_parallel: usize,
    pub freed: ObjectBytePair,
    pub freed_los: ObjectBytePair,
    pub parallel: bool,
    pub pause_time: Duration,
}

impl CycleStatistics {
    pub fn total_freed(&self) -> ObjectBytePair {
        let mut freed = self.freed;
        freed.add(self.freed_los);
        freed
    }
}

/// Counters accumulated over the lifetime of a collector.
#[derive(Clone, Default, Debug)]
pub struct CumulativeStatistics {
    pub iterations: usize,
    pub whole_heap_iterations: usize,
    pub objects_moved: usize,
    pub bytes_moved: usize,
    pub bytes_promoted: usize,
    pub freed: ObjectBytePair,
    pub total_pause_time: Duration,
}

impl CumulativeStatistics {
    pub fn record(&mut self, cycle: &CycleStatistics) {
        self.iterations += 1;
        if cycle.whole_heap {
            self.whole_heap_iterations += 1;
        }
        self.objects_moved += cycle.objects_moved;
        self.bytes_moved += cycle.bytes_moved;
        self.bytes_promoted += cycle.bytes_promoted;
        self.freed.add(cycle.total_freed());
        self.total_pause_time += cycle.pause_time;
    }
}

fn signed_size(bytes: i64) -> String {
    if bytes < 0 {
        format!("-{}", formatted_size(bytes.unsigned_abs() as usize))
    } else {
        formatted_size(bytes as usize).to_string()
    }
}

impl std::fmt::Display for CycleStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let freed = self.total_freed();
        write!(
            f,
            "{} ({:?}) freed {} objects ({}), {} LOS objects ({}), moved {} objects ({}), promoted {} ({} wasted), fallback {} ({}), paused {:.3}ms",
            if self.whole_heap { "whole heap" } else { "bump pointer spaces" },
            self.cause,
            freed.objects,
            signed_size(freed.bytes),
            self.freed_los.objects,
            signed_size(self.freed_los.bytes),
            self.objects_moved,
            formatted_size(self.bytes_moved),
            formatted_size(self.bytes_promoted),
            formatted_size(self.bytes_wasted_promoted),
            self.objects_fallback,
            formatted_size(self.bytes_fallback),
            self.pause_time.as_secs_f64() * 1000.0
        )
    }
}

impl std::fmt::Display for CumulativeStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Collector statistics:")?;
        writeln!(
            f,
            "  Cycles: {} ({} whole heap)",
            self.iterations, self.whole_heap_iterations
        )?;
        writeln!(
            f,
            "  Objects moved: {} ({})",
            self.objects_moved,
            formatted_size(self.bytes_moved)
        )?;
        writeln!(f, "  Bytes promoted: {}", formatted_size(self.bytes_promoted))?;
        writeln!(
            f,
            "  Freed: {} objects ({})",
            self.freed.objects,
            signed_size(self.freed.bytes)
        )?;
        writeln!(
            f,
            "  Total pause time: {:.3}ms",
            self.total_pause_time.as_secs_f64() * 1000.0
        )?;
        Ok(())
    }
}
