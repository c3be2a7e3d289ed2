//! # Sluice Engine
//!
//! The execution pipeline of the Sluice event-processing core: mirrored
//! host/device buffers, the filter and sliding-window kernels, the
//! per-stream processor chain, and the top-level event consumer.
//!
//! ## Data flow
//!
//! ```text
//! raw event bytes
//!   └─> EventConsumer / StreamPipeline
//!         └─> StreamEventBuffer          (host → device copy)
//!               └─> filter / window kernel (parallel evaluation,
//!                     │                      prefix-sum compaction)
//!               <─────┘                   (device → host copy)
//!         <── matched positions / window contents
//! ```
//!
//! Host-side dispatch is single-threaded per consumer or pipeline: one
//! batch fully drains before the next is accepted. Device-side
//! parallelism lives behind the [`sluice_core::device::Device`] trait.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod consumer;
pub mod context;
pub mod kernel;
pub mod pipeline;
pub mod processor;
pub mod stats;

pub use buffer::{IndexBuffer, StreamEventBuffer, MATCH_SENTINEL, SENTINEL_BYTE};
pub use consumer::{ByteBufferLayout, EventConsumer, KernelTopology};
pub use context::{ProcessorContext, StageOutput};
pub use kernel::{FilterCompactKernel, FilterIndexKernel, LengthWindowKernel};
pub use pipeline::StreamPipeline;
pub use processor::{
    FilterProcessor, LengthWindowProcessor, Processor, ProcessorKind, ProcessorState,
    StagePosition,
};
pub use stats::BatchStats;
