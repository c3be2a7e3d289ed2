//! Pipeline stages wrapping the kernel layer.
//!
//! A processor moves through `Uninitialized → Configured → Initialized`.
//! `configure` binds the stage's position in the chain and the shared
//! context but allocates nothing; `init` allocates the concrete kernel
//! for the stage's placement (first-in-chain vs. chained) and wires its
//! input to the upstream stage's registered result region, or to the
//! pipeline input at registry slot 0 for the chain head. `process` is
//! only legal once initialized.
//!
//! The chain itself is an ordered vector owned by the stream pipeline;
//! stages know their neighbors only through registry indices fixed at
//! configure time.

use std::sync::Arc;

use tracing::debug;

use sluice_core::error::{Result, SluiceError};
use sluice_core::filter::Filter;

use crate::context::{ProcessorContext, StageOutput};
use crate::kernel::{FilterCompactKernel, FilterIndexKernel, LengthWindowKernel};

/// Kind tag for chain composition and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    /// Predicate filter stage.
    Filter,
    /// Length sliding-window stage.
    LengthSlidingWindow,
}

/// Lifecycle state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessorState {
    /// Freshly constructed or cloned; nothing bound.
    #[default]
    Uninitialized,
    /// Chain position and context bound; no device resources yet.
    Configured,
    /// Kernel and buffers allocated; ready to process.
    Initialized,
}

/// A stage's position in its chain, fixed at configure time.
#[derive(Debug, Clone, Copy)]
pub struct StagePosition {
    /// Index of this stage in the chain.
    pub index: usize,
    /// Registry index of the upstream result region; `None` means the
    /// stage reads the pipeline input at registry slot 0.
    pub upstream: Option<usize>,
    /// Whether this stage is the chain tail.
    pub is_tail: bool,
}

impl StagePosition {
    fn input_index(&self) -> usize {
        self.upstream.unwrap_or(0)
    }
}

/// One stage of a stream's processor chain.
pub trait Processor: Send {
    /// Stage kind.
    fn kind(&self) -> ProcessorKind;

    /// Current lifecycle state.
    fn state(&self) -> ProcessorState;

    /// Bind chain position and shared context. Allocates nothing.
    fn configure(&mut self, position: StagePosition, ctx: Arc<ProcessorContext>) -> Result<()>;

    /// Allocate the stage's kernel and device buffers.
    fn init(&mut self) -> Result<()>;

    /// Process one batch; returns the event count visible to the next
    /// stage.
    fn process(&mut self, num_events: usize, last: bool) -> Result<usize>;

    /// Registry index of this stage's result region, when it exposes one.
    fn result_buffer_index(&self) -> Option<usize>;

    /// Matched input positions from the most recent terminal batch.
    fn matched_positions(&self) -> &[u32] {
        &[]
    }

    /// Host bytes of the stage's terminal result events.
    fn result_events(&self) -> Result<&[u8]>;

    /// Event count of the stage's terminal result.
    fn result_count(&self) -> usize;

    /// An unconfigured, uninitialized copy sharing no device resources;
    /// used to instantiate one independent chain per device.
    fn clone_unconfigured(&self) -> Box<dyn Processor>;
}

enum FilterKernel {
    /// Terminal stage: sparse index output, no compaction.
    Index(FilterIndexKernel),
    /// Mid-chain stage: dense compacted output for the next stage.
    Compact(FilterCompactKernel),
}

/// Filter stage evaluating a fixed filter set.
pub struct FilterProcessor {
    filters: Vec<Filter>,
    state: ProcessorState,
    position: Option<StagePosition>,
    ctx: Option<Arc<ProcessorContext>>,
    kernel: Option<FilterKernel>,
    result_index: Option<usize>,
}

impl FilterProcessor {
    /// Build a stage over an already-compiled filter set.
    pub fn new(filters: Vec<Filter>) -> Self {
        Self {
            filters,
            state: ProcessorState::Uninitialized,
            position: None,
            ctx: None,
            kernel: None,
            result_index: None,
        }
    }
}

impl Processor for FilterProcessor {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Filter
    }

    fn state(&self) -> ProcessorState {
        self.state
    }

    fn configure(&mut self, position: StagePosition, ctx: Arc<ProcessorContext>) -> Result<()> {
        ctx.log(format!(
            "FilterProcessor configured: stream={} stage={} filters={}",
            ctx.stream_index(),
            position.index,
            self.filters.len()
        ));
        self.position = Some(position);
        self.ctx = Some(ctx);
        self.state = ProcessorState::Configured;
        Ok(())
    }

    fn init(&mut self) -> Result<()> {
        let (Some(position), Some(ctx)) = (self.position, self.ctx.clone()) else {
            return Err(SluiceError::NotInitialized("FilterProcessor"));
        };
        let input = ctx.output(position.input_index())?;
        let device = ctx.device().clone();
        let table = device.upload_filter_table(&self.filters)?;

        let kernel = if position.is_tail {
            let mut kernel = FilterIndexKernel::new(
                device,
                ctx.schema().clone(),
                input.region,
                input.capacity,
                ctx.events_per_block(),
            )?;
            kernel.set_filter_table(table);
            FilterKernel::Index(kernel)
        } else {
            let mut kernel = FilterCompactKernel::new(
                device,
                ctx.schema().clone(),
                input.region,
                input.capacity,
                ctx.events_per_block(),
            )?;
            kernel.set_filter_table(table);
            self.result_index = Some(ctx.register_output(StageOutput {
                region: kernel.result_region(),
                capacity: kernel.result_capacity(),
            }));
            FilterKernel::Compact(kernel)
        };

        debug!(
            "filter stage {} initialized (tail={})",
            position.index, position.is_tail
        );
        self.kernel = Some(kernel);
        self.state = ProcessorState::Initialized;
        Ok(())
    }

    fn process(&mut self, num_events: usize, last: bool) -> Result<usize> {
        match self.kernel.as_mut() {
            Some(FilterKernel::Index(kernel)) => kernel.process(num_events, last),
            Some(FilterKernel::Compact(kernel)) => kernel.process(num_events, last),
            None => Err(SluiceError::NotInitialized("FilterProcessor")),
        }
    }

    fn result_buffer_index(&self) -> Option<usize> {
        self.result_index
    }

    fn matched_positions(&self) -> &[u32] {
        match self.kernel.as_ref() {
            Some(FilterKernel::Index(kernel)) => kernel.matched(),
            Some(FilterKernel::Compact(kernel)) => kernel.matched(),
            None => &[],
        }
    }

    fn result_events(&self) -> Result<&[u8]> {
        match self.kernel.as_ref() {
            Some(FilterKernel::Compact(kernel)) => kernel.matched_events(),
            // The index kernel reports positions, not payloads.
            Some(FilterKernel::Index(_)) => Ok(&[]),
            None => Err(SluiceError::NotInitialized("FilterProcessor")),
        }
    }

    fn result_count(&self) -> usize {
        match self.kernel.as_ref() {
            Some(FilterKernel::Index(kernel)) => kernel.matched().len(),
            Some(FilterKernel::Compact(kernel)) => kernel.matched_count(),
            None => 0,
        }
    }

    fn clone_unconfigured(&self) -> Box<dyn Processor> {
        Box::new(FilterProcessor::new(self.filters.clone()))
    }
}

/// Length sliding-window stage.
pub struct LengthWindowProcessor {
    window_size: usize,
    state: ProcessorState,
    position: Option<StagePosition>,
    ctx: Option<Arc<ProcessorContext>>,
    kernel: Option<LengthWindowKernel>,
    result_index: Option<usize>,
}

impl LengthWindowProcessor {
    /// Build a stage keeping the last `window_size` events.
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            state: ProcessorState::Uninitialized,
            position: None,
            ctx: None,
            kernel: None,
            result_index: None,
        }
    }

    /// Configured window length.
    pub fn window_size(&self) -> usize {
        self.window_size
    }
}

impl Processor for LengthWindowProcessor {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::LengthSlidingWindow
    }

    fn state(&self) -> ProcessorState {
        self.state
    }

    fn configure(&mut self, position: StagePosition, ctx: Arc<ProcessorContext>) -> Result<()> {
        ctx.log(format!(
            "LengthWindowProcessor configured: stream={} stage={} window={}",
            ctx.stream_index(),
            position.index,
            self.window_size
        ));
        self.position = Some(position);
        self.ctx = Some(ctx);
        self.state = ProcessorState::Configured;
        Ok(())
    }

    fn init(&mut self) -> Result<()> {
        let (Some(position), Some(ctx)) = (self.position, self.ctx.clone()) else {
            return Err(SluiceError::NotInitialized("LengthWindowProcessor"));
        };
        // First-in-chain reads the pipeline input (slot 0); chained
        // placement reads the upstream filter's compacted result.
        let input = ctx.output(position.input_index())?;
        let kernel = LengthWindowKernel::new(
            ctx.device().clone(),
            ctx.schema().clone(),
            input,
            self.window_size,
            ctx.events_per_block(),
        )?;
        self.result_index = Some(ctx.register_output(StageOutput {
            region: kernel.result_region(),
            capacity: kernel.result_capacity(),
        }));

        debug!(
            "window stage {} initialized (input index {})",
            position.index,
            position.input_index()
        );
        self.kernel = Some(kernel);
        self.state = ProcessorState::Initialized;
        Ok(())
    }

    fn process(&mut self, num_events: usize, last: bool) -> Result<usize> {
        match self.kernel.as_mut() {
            Some(kernel) => kernel.process(num_events, last),
            None => Err(SluiceError::NotInitialized("LengthWindowProcessor")),
        }
    }

    fn result_buffer_index(&self) -> Option<usize> {
        self.result_index
    }

    fn result_events(&self) -> Result<&[u8]> {
        match self.kernel.as_ref() {
            Some(kernel) => kernel.result_events(),
            None => Err(SluiceError::NotInitialized("LengthWindowProcessor")),
        }
    }

    fn result_count(&self) -> usize {
        self.kernel.as_ref().map_or(0, |k| k.result_count())
    }

    fn clone_unconfigured(&self) -> Box<dyn Processor> {
        Box::new(LengthWindowProcessor::new(self.window_size))
    }
}
