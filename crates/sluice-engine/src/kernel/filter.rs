//! Filter kernels: parallel predicate evaluation with and without
//! stream compaction.

use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use sluice_core::device::{
    CopyMode, Device, DeviceRegion, FilterCompactLaunch, FilterIndexLaunch, LaunchDims,
};
use sluice_core::error::{Result, SluiceError};
use sluice_core::filter::FilterTableHandle;
use sluice_core::schema::EventSchema;

use crate::buffer::{IndexBuffer, StreamEventBuffer, SENTINEL_BYTE};
use crate::stats::BatchStats;

/// Single-filter kernel: one pass, no compaction.
///
/// Each device thread evaluates filter slot 0 against its event and
/// writes the event's own index into the result slot on a match;
/// non-matching slots keep the reset sentinel. The sparse result is
/// collapsed to an ascending position list on the host.
pub struct FilterIndexKernel {
    device: Arc<dyn Device>,
    schema: Arc<EventSchema>,
    input: DeviceRegion,
    capacity: usize,
    events_per_block: u32,
    table: Option<FilterTableHandle>,
    result: IndexBuffer,
    matched: Vec<u32>,
    stats: BatchStats,
}

impl FilterIndexKernel {
    /// Allocate the kernel's result buffer for `capacity` events.
    pub fn new(
        device: Arc<dyn Device>,
        schema: Arc<EventSchema>,
        input: DeviceRegion,
        capacity: usize,
        events_per_block: u32,
    ) -> Result<Self> {
        let result = IndexBuffer::create("filter index results", device.clone(), capacity)?;
        Ok(Self {
            device,
            schema,
            input,
            capacity,
            events_per_block,
            table: None,
            result,
            matched: Vec::with_capacity(capacity),
            stats: BatchStats::default(),
        })
    }

    /// Bind the uploaded filter table.
    pub fn set_filter_table(&mut self, table: FilterTableHandle) {
        self.table = Some(table);
    }

    /// Evaluate one batch; returns the matched count.
    pub fn process(&mut self, num_events: usize, _last: bool) -> Result<usize> {
        self.matched.clear();
        if num_events == 0 {
            return Ok(0);
        }
        if num_events > self.capacity {
            return Err(SluiceError::CapacityExceeded {
                requested: num_events,
                capacity: self.capacity,
            });
        }
        let table = self.table.ok_or(SluiceError::NotInitialized("filter table"))?;

        let started = Instant::now();
        self.result.reset_device(SENTINEL_BYTE)?;
        self.device.launch_filter_index(FilterIndexLaunch {
            dims: LaunchDims::for_events(num_events, self.events_per_block),
            schema: &self.schema,
            table,
            filter_slot: 0,
            input: self.input,
            num_events,
            result: self.result.alloc(),
        })?;
        self.result.copy_to_host(num_events, CopyMode::Sync)?;
        self.stats.record(started.elapsed());

        self.matched.extend(
            self.result
                .values(num_events)?
                .iter()
                .filter(|&&slot| slot >= 0)
                .map(|&slot| slot as u32),
        );
        trace!("filter index kernel: {num_events} in, {} matched", self.matched.len());
        Ok(self.matched.len())
    }

    /// Matched input positions from the most recent batch, ascending.
    pub fn matched(&self) -> &[u32] {
        &self.matched
    }

    /// Accumulated launch timing.
    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }
}

/// Multi-filter kernel with stream compaction.
///
/// Each device thread flags its event when any filter in the table
/// matches; an exclusive prefix sum over the flags assigns dense output
/// slots, and flagged threads scatter their payload and source index.
/// Compaction is stable: surviving events keep their relative input
/// order. The device-side matched count is read back through an explicit
/// copy to decide how many events the next stage sees.
pub struct FilterCompactKernel {
    device: Arc<dyn Device>,
    schema: Arc<EventSchema>,
    input: DeviceRegion,
    capacity: usize,
    events_per_block: u32,
    table: Option<FilterTableHandle>,
    flags: IndexBuffer,
    prefix_sums: IndexBuffer,
    result_events: StreamEventBuffer,
    positions: IndexBuffer,
    count_cell: IndexBuffer,
    matched_count: usize,
    matched: Vec<u32>,
    stats: BatchStats,
}

impl FilterCompactKernel {
    /// Allocate flag, scan, result, and count buffers for `capacity`
    /// events.
    pub fn new(
        device: Arc<dyn Device>,
        schema: Arc<EventSchema>,
        input: DeviceRegion,
        capacity: usize,
        events_per_block: u32,
    ) -> Result<Self> {
        let flags = IndexBuffer::create("filter match flags", device.clone(), capacity)?;
        let prefix_sums = IndexBuffer::create("filter prefix sums", device.clone(), capacity)?;
        let result_events = StreamEventBuffer::create(
            "filter compacted events",
            schema.clone(),
            device.clone(),
            capacity,
        )?;
        let positions = IndexBuffer::create("filter matched positions", device.clone(), capacity)?;
        let count_cell = IndexBuffer::create("filter matched count", device.clone(), 1)?;
        Ok(Self {
            device,
            schema,
            input,
            capacity,
            events_per_block,
            table: None,
            flags,
            prefix_sums,
            result_events,
            positions,
            count_cell,
            matched_count: 0,
            matched: Vec::with_capacity(capacity),
            stats: BatchStats::default(),
        })
    }

    /// Bind the uploaded filter table.
    pub fn set_filter_table(&mut self, table: FilterTableHandle) {
        self.table = Some(table);
    }

    /// Device region holding the compacted events, for downstream stages.
    pub fn result_region(&self) -> DeviceRegion {
        self.result_events.region()
    }

    /// Capacity of the result region in events.
    pub fn result_capacity(&self) -> usize {
        self.capacity
    }

    /// Evaluate and compact one batch; returns the matched count.
    ///
    /// When `last` is set the compacted events and their source
    /// positions are copied back to the host for retrieval.
    pub fn process(&mut self, num_events: usize, last: bool) -> Result<usize> {
        self.matched.clear();
        self.matched_count = 0;
        if num_events == 0 {
            return Ok(0);
        }
        if num_events > self.capacity {
            return Err(SluiceError::CapacityExceeded {
                requested: num_events,
                capacity: self.capacity,
            });
        }
        let table = self.table.ok_or(SluiceError::NotInitialized("filter table"))?;

        let started = Instant::now();
        self.positions.reset_device(SENTINEL_BYTE)?;
        self.device.launch_filter_compact(FilterCompactLaunch {
            dims: LaunchDims::for_events(num_events, self.events_per_block),
            schema: &self.schema,
            table,
            input: self.input,
            num_events,
            flags: self.flags.alloc(),
            prefix_sums: self.prefix_sums.alloc(),
            result_events: self.result_events.region().alloc(),
            matched_positions: self.positions.alloc(),
            matched_count: self.count_cell.alloc(),
        })?;
        self.count_cell.copy_to_host(1, CopyMode::Sync)?;
        let count = self.count_cell.values(1)?[0].max(0) as usize;
        self.stats.record(started.elapsed());

        self.matched_count = count;
        if last && count > 0 {
            self.result_events.copy_to_host(count, CopyMode::Sync)?;
            self.positions.copy_to_host(count, CopyMode::Sync)?;
        }
        if last {
            self.matched.extend(
                self.positions.values(count)?.iter().map(|&p| p.max(0) as u32),
            );
        }
        trace!("filter compact kernel: {num_events} in, {count} matched");
        Ok(count)
    }

    /// Matched input positions from the most recent terminal batch.
    pub fn matched(&self) -> &[u32] {
        &self.matched
    }

    /// Host bytes of the compacted events from the most recent terminal
    /// batch.
    pub fn matched_events(&self) -> Result<&[u8]> {
        self.result_events.host_events(self.matched_count)
    }

    /// Matched count from the most recent batch.
    pub fn matched_count(&self) -> usize {
        self.matched_count
    }

    /// Accumulated launch timing.
    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }
}
