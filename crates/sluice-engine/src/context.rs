//! Shared per-stream processor context.
//!
//! One context exists per stream pipeline. It binds the device, the
//! stream's schema, the injected diagnostic sink, and the result-buffer
//! registry: an append-only list of device regions the chain's stages
//! expose to one another. Slot 0 is always the pipeline's input buffer;
//! a chained stage resolves its input by the upstream stage's registered
//! index.

use std::sync::Arc;

use parking_lot::RwLock;

use sluice_core::device::{Device, DeviceRegion};
use sluice_core::error::{Result, SluiceError};
use sluice_core::schema::EventSchema;
use sluice_core::sink::SharedSink;

/// One registered stage output (or the pipeline input at slot 0).
#[derive(Debug, Clone, Copy)]
pub struct StageOutput {
    /// Device region holding the events.
    pub region: DeviceRegion,
    /// Capacity of the region in events.
    pub capacity: usize,
}

/// Context shared by every stage of one stream's chain.
pub struct ProcessorContext {
    device: Arc<dyn Device>,
    schema: Arc<EventSchema>,
    stream_index: usize,
    events_per_block: u32,
    sink: SharedSink,
    outputs: RwLock<Vec<StageOutput>>,
}

impl ProcessorContext {
    /// Build a context for one stream.
    pub fn new(
        device: Arc<dyn Device>,
        schema: Arc<EventSchema>,
        stream_index: usize,
        events_per_block: u32,
        sink: SharedSink,
    ) -> Self {
        Self {
            device,
            schema,
            stream_index,
            events_per_block,
            sink,
            outputs: RwLock::new(Vec::new()),
        }
    }

    /// Bound device.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Stream schema.
    pub fn schema(&self) -> &Arc<EventSchema> {
        &self.schema
    }

    /// Index of the stream this context belongs to.
    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    /// Threads per block for kernel launches.
    pub fn events_per_block(&self) -> u32 {
        self.events_per_block
    }

    /// Append a line to the stream's diagnostic sink.
    pub fn log(&self, line: impl AsRef<str>) {
        self.sink.append(line.as_ref());
    }

    /// The injected diagnostic sink.
    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    /// Register a stage output, returning its registry index.
    pub fn register_output(&self, output: StageOutput) -> usize {
        let mut outputs = self.outputs.write();
        outputs.push(output);
        outputs.len() - 1
    }

    /// Resolve a registry index.
    pub fn output(&self, index: usize) -> Result<StageOutput> {
        self.outputs
            .read()
            .get(index)
            .copied()
            .ok_or(SluiceError::UnknownBufferIndex(index))
    }
}
