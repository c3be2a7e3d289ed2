//! Length sliding-window kernel.

use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use sluice_core::device::{CopyMode, Device, DeviceRegion, LaunchDims, WindowUpdateLaunch};
use sluice_core::error::{Result, SluiceError};
use sluice_core::schema::EventSchema;

use crate::buffer::StreamEventBuffer;
use crate::context::StageOutput;
use crate::stats::BatchStats;

/// Device-resident sliding window over the last `window_size` events.
///
/// Two placements exist, chosen by the owning processor at init time:
/// first-in-chain (reading the pipeline's input buffer, registry slot 0)
/// and chained (reading the upstream filter stage's compacted result
/// region). The kernel itself is identical; only the input region
/// differs.
pub struct LengthWindowKernel {
    device: Arc<dyn Device>,
    schema: Arc<EventSchema>,
    input: DeviceRegion,
    input_capacity: usize,
    window: StreamEventBuffer,
    result: StreamEventBuffer,
    window_size: usize,
    occupancy: usize,
    events_per_block: u32,
    result_count: usize,
    stats: BatchStats,
}

impl LengthWindowKernel {
    /// Allocate window and result storage for `window_size` events,
    /// reading batches from `input`.
    pub fn new(
        device: Arc<dyn Device>,
        schema: Arc<EventSchema>,
        input: StageOutput,
        window_size: usize,
        events_per_block: u32,
    ) -> Result<Self> {
        if window_size == 0 {
            return Err(SluiceError::InvalidConfig(
                "window size must be at least 1 event".to_string(),
            ));
        }
        let window = StreamEventBuffer::create(
            "window contents",
            schema.clone(),
            device.clone(),
            window_size,
        )?;
        let result = StreamEventBuffer::create(
            "window results",
            schema.clone(),
            device.clone(),
            window_size,
        )?;
        Ok(Self {
            device,
            schema,
            input: input.region,
            input_capacity: input.capacity,
            window,
            result,
            window_size,
            occupancy: 0,
            events_per_block,
            result_count: 0,
            stats: BatchStats::default(),
        })
    }

    /// Advance the window by one batch.
    ///
    /// Returns the event count visible to the next stage: the window
    /// occupancy for a terminal stage, the incoming count otherwise.
    pub fn process(&mut self, num_events: usize, last: bool) -> Result<usize> {
        if num_events > self.input_capacity {
            return Err(SluiceError::CapacityExceeded {
                requested: num_events,
                capacity: self.input_capacity,
            });
        }

        let started = Instant::now();
        let occupancy = self.device.launch_window_update(WindowUpdateLaunch {
            dims: LaunchDims::for_events(num_events, self.events_per_block),
            schema: &self.schema,
            input: self.input,
            num_events,
            window: self.window.region().alloc(),
            window_size: self.window_size,
            occupancy: self.occupancy,
            result: self.result.region().alloc(),
            emit: last,
        })?;
        self.stats.record(started.elapsed());
        self.occupancy = occupancy;

        if last {
            self.result.copy_to_host(occupancy, CopyMode::Sync)?;
            self.result_count = occupancy;
            trace!("window kernel: +{num_events} events, emitting {occupancy}");
            Ok(occupancy)
        } else {
            trace!("window kernel: +{num_events} events, occupancy {occupancy}");
            Ok(num_events)
        }
    }

    /// Device region holding the emitted window, for downstream stages.
    pub fn result_region(&self) -> DeviceRegion {
        self.result.region()
    }

    /// Capacity of the result region in events.
    pub fn result_capacity(&self) -> usize {
        self.window_size
    }

    /// Host bytes of the window emitted by the most recent terminal
    /// batch.
    pub fn result_events(&self) -> Result<&[u8]> {
        self.result.host_events(self.result_count)
    }

    /// Events emitted by the most recent terminal batch.
    pub fn result_count(&self) -> usize {
        self.result_count
    }

    /// Current window occupancy.
    pub fn occupancy(&self) -> usize {
        self.occupancy
    }

    /// Configured window length.
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Accumulated launch timing.
    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }
}
