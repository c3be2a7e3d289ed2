//! Per-stream pipeline: the ordered processor chain and its context.

use std::sync::Arc;

use tracing::info;

use sluice_core::device::{CopyMode, Device};
use sluice_core::error::{Result, SluiceError};
use sluice_core::schema::EventSchema;
use sluice_core::sink::SharedSink;

use crate::buffer::StreamEventBuffer;
use crate::context::{ProcessorContext, StageOutput};
use crate::processor::{Processor, StagePosition};

/// Owns the ordered processor chain for one named input stream together
/// with the device binding for that stream.
///
/// Stages are appended in query-pipeline order before initialization;
/// `initialize` builds the shared context, registers the pipeline input
/// buffer at registry slot 0, and configures and initializes every stage
/// head to tail. Afterwards the chain is immutable and `process` walks
/// it in order, threading each stage's surviving event count into the
/// next.
pub struct StreamPipeline {
    stream_id: String,
    stream_index: usize,
    schema: Arc<EventSchema>,
    events_per_block: u32,
    sink: SharedSink,
    stages: Vec<Box<dyn Processor>>,
    ctx: Option<Arc<ProcessorContext>>,
    input: Option<StreamEventBuffer>,
}

impl StreamPipeline {
    /// Build an empty pipeline for one stream.
    pub fn new(
        stream_id: impl Into<String>,
        stream_index: usize,
        schema: Arc<EventSchema>,
        events_per_block: u32,
        sink: SharedSink,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            stream_index,
            schema,
            events_per_block,
            sink,
            stages: Vec::new(),
            ctx: None,
            input: None,
        }
    }

    /// Stream this pipeline serves.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Number of stages in the chain.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Whether `initialize` has run.
    pub fn is_initialized(&self) -> bool {
        self.ctx.is_some()
    }

    /// The shared processor context, once initialized.
    pub fn context(&self) -> Option<&Arc<ProcessorContext>> {
        self.ctx.as_ref()
    }

    /// Append a stage to the chain tail (query pipeline order).
    ///
    /// # Errors
    ///
    /// Rejected once the pipeline is initialized; the chain is immutable
    /// during processing.
    pub fn add_processor(&mut self, processor: Box<dyn Processor>) -> Result<()> {
        if self.is_initialized() {
            return Err(SluiceError::InvalidConfig(format!(
                "stream '{}' is initialized; its chain is immutable",
                self.stream_id
            )));
        }
        self.stages.push(processor);
        Ok(())
    }

    /// Allocate all per-device resources for this stream.
    pub fn initialize(&mut self, device: Arc<dyn Device>, input_capacity: usize) -> Result<()> {
        if self.is_initialized() {
            return Err(SluiceError::InvalidConfig(format!(
                "stream '{}' is already initialized",
                self.stream_id
            )));
        }

        let input = StreamEventBuffer::create(
            format!("{} input", self.stream_id),
            self.schema.clone(),
            device.clone(),
            input_capacity,
        )?;
        let ctx = Arc::new(ProcessorContext::new(
            device,
            self.schema.clone(),
            self.stream_index,
            self.events_per_block,
            self.sink.clone(),
        ));
        // Registry slot 0 is always the pipeline input.
        ctx.register_output(StageOutput {
            region: input.region(),
            capacity: input.capacity(),
        });

        let stage_total = self.stages.len();
        let mut upstream = None;
        for (index, stage) in self.stages.iter_mut().enumerate() {
            let position = StagePosition {
                index,
                upstream,
                is_tail: index + 1 == stage_total,
            };
            stage.configure(position, ctx.clone())?;
            stage.init()?;
            upstream = stage.result_buffer_index();
        }

        ctx.log(format!(
            "StreamPipeline initialized: stream={} device={} stages={} capacity={}",
            self.stream_id,
            ctx.device().id(),
            stage_total,
            input_capacity
        ));
        info!(
            "stream '{}' initialized with {stage_total} stages",
            self.stream_id
        );

        self.input = Some(input);
        self.ctx = Some(ctx);
        Ok(())
    }

    /// Stage `count` events into the pipeline input buffer.
    pub fn write_events(&mut self, bytes: &[u8], count: usize) -> Result<()> {
        let input = self
            .input
            .as_mut()
            .ok_or(SluiceError::NotInitialized("StreamPipeline"))?;
        input.write_events(bytes, count)
    }

    /// Run one batch through the chain head to tail.
    ///
    /// Returns the event count surviving the tail stage.
    pub fn process(&mut self, num_events: usize) -> Result<usize> {
        let (Some(input), Some(ctx)) = (self.input.as_ref(), self.ctx.as_ref()) else {
            return Err(SluiceError::NotInitialized("StreamPipeline"));
        };

        input.copy_to_device(num_events, CopyMode::Async)?.wait()?;

        let stage_total = self.stages.len();
        let mut count = num_events;
        for (index, stage) in self.stages.iter_mut().enumerate() {
            let last = index + 1 == stage_total;
            count = stage.process(count, last)?;
        }
        ctx.log(format!(
            "Process: stream={} events_in={num_events} events_out={count}",
            self.stream_id
        ));
        Ok(count)
    }

    /// The tail stage's terminal result events.
    pub fn result_events(&self) -> Result<&[u8]> {
        match self.stages.last() {
            Some(stage) => stage.result_events(),
            None => Ok(&[]),
        }
    }

    /// The tail stage's terminal result count.
    pub fn result_count(&self) -> usize {
        self.stages.last().map_or(0, |s| s.result_count())
    }

    /// Matched input positions reported by the tail stage, when it is a
    /// filter.
    pub fn matched_positions(&self) -> &[u32] {
        self.stages.last().map_or(&[], |s| s.matched_positions())
    }

    /// An uninitialized copy of this pipeline sharing no device
    /// resources; used to stand up the same chain on another device or
    /// partition.
    pub fn clone_unconfigured(&self) -> StreamPipeline {
        let mut clone = StreamPipeline::new(
            self.stream_id.clone(),
            self.stream_index,
            self.schema.clone(),
            self.events_per_block,
            self.sink.clone(),
        );
        clone.stages = self
            .stages
            .iter()
            .map(|s| s.clone_unconfigured())
            .collect();
        clone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::filter::{Filter, FilterProgram, Instr};
    use sluice_core::schema::{AttrValue, AttributeType, EventKind, EventView, EventWriter};
    use sluice_core::sink::MemorySink;
    use sluice_cpu::CpuDevice;

    use crate::processor::{FilterProcessor, LengthWindowProcessor};

    fn schema() -> Arc<EventSchema> {
        EventSchema::builder("trades")
            .attribute("a", AttributeType::Int)
            .build()
            .unwrap()
    }

    fn encode(schema: &EventSchema, values: &[i32]) -> Vec<u8> {
        let es = schema.event_size();
        let mut bytes = vec![0u8; es * values.len()];
        for (i, &v) in values.iter().enumerate() {
            let mut w = EventWriter::new(schema, &mut bytes[i * es..(i + 1) * es]).unwrap();
            w.header(i as i64, i as i64, EventKind::Current);
            w.attribute(0, AttrValue::Int(v)).unwrap();
        }
        bytes
    }

    fn even_filter() -> Filter {
        Filter::new(
            7,
            FilterProgram::new(vec![
                Instr::PushAttr(0),
                Instr::PushInt(2),
                Instr::Mod,
                Instr::PushInt(0),
                Instr::Eq,
            ]),
        )
    }

    #[test]
    fn test_process_before_initialize_is_rejected() {
        let mut pipeline =
            StreamPipeline::new("trades", 0, schema(), 256, Arc::new(MemorySink::new()));
        assert!(matches!(
            pipeline.process(1),
            Err(SluiceError::NotInitialized(_))
        ));
    }

    #[test]
    fn test_add_processor_after_initialize_is_rejected() {
        let mut pipeline =
            StreamPipeline::new("trades", 0, schema(), 256, Arc::new(MemorySink::new()));
        pipeline
            .add_processor(Box::new(LengthWindowProcessor::new(3)))
            .unwrap();
        pipeline
            .initialize(Arc::new(CpuDevice::new()), 16)
            .unwrap();
        assert!(pipeline
            .add_processor(Box::new(LengthWindowProcessor::new(3)))
            .is_err());
    }

    #[test]
    fn test_window_only_chain() {
        let schema = schema();
        let sink = Arc::new(MemorySink::new());
        let mut pipeline = StreamPipeline::new("trades", 0, schema.clone(), 4, sink.clone());
        pipeline
            .add_processor(Box::new(LengthWindowProcessor::new(3)))
            .unwrap();
        pipeline
            .initialize(Arc::new(CpuDevice::new()), 16)
            .unwrap();

        let batch = encode(&schema, &[1, 2, 3, 4, 5]);
        pipeline.write_events(&batch, 5).unwrap();
        let survivors = pipeline.process(5).unwrap();
        assert_eq!(survivors, 3);
        assert_eq!(pipeline.result_count(), 3);

        let es = schema.event_size();
        let events = pipeline.result_events().unwrap();
        for (k, expected) in [3, 4, 5].into_iter().enumerate() {
            let view = EventView::new(&schema, &events[k * es..(k + 1) * es]).unwrap();
            assert_eq!(view.attribute(0), Some(AttrValue::Int(expected)));
        }
        assert!(sink.contains("StreamPipeline initialized"));
    }

    #[test]
    fn test_filter_then_window_chain() {
        let schema = schema();
        let mut pipeline =
            StreamPipeline::new("trades", 0, schema.clone(), 4, Arc::new(MemorySink::new()));
        pipeline
            .add_processor(Box::new(FilterProcessor::new(vec![even_filter()])))
            .unwrap();
        pipeline
            .add_processor(Box::new(LengthWindowProcessor::new(2)))
            .unwrap();
        pipeline
            .initialize(Arc::new(CpuDevice::new()), 16)
            .unwrap();

        // Evens are 2,4,6,8; the window of 2 keeps 6,8.
        let batch = encode(&schema, &[1, 2, 3, 4, 5, 6, 7, 8]);
        pipeline.write_events(&batch, 8).unwrap();
        let survivors = pipeline.process(8).unwrap();
        assert_eq!(survivors, 2);

        let es = schema.event_size();
        let events = pipeline.result_events().unwrap();
        for (k, expected) in [6, 8].into_iter().enumerate() {
            let view = EventView::new(&schema, &events[k * es..(k + 1) * es]).unwrap();
            assert_eq!(view.attribute(0), Some(AttrValue::Int(expected)));
        }
    }

    #[test]
    fn test_clone_unconfigured_runs_independently() {
        let schema = schema();
        let mut pipeline =
            StreamPipeline::new("trades", 0, schema.clone(), 4, Arc::new(MemorySink::new()));
        pipeline
            .add_processor(Box::new(LengthWindowProcessor::new(2)))
            .unwrap();
        pipeline
            .initialize(Arc::new(CpuDevice::new()), 8)
            .unwrap();

        let mut clone = pipeline.clone_unconfigured();
        assert!(!clone.is_initialized());
        assert_eq!(clone.stage_count(), 1);
        clone.initialize(Arc::new(CpuDevice::new()), 8).unwrap();

        let batch = encode(&schema, &[9, 10, 11]);
        clone.write_events(&batch, 3).unwrap();
        assert_eq!(clone.process(3).unwrap(), 2);
    }
}
