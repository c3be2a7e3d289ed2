//! # Sluice
//!
//! GPU-resident execution core for complex event processing: batches of
//! schema-laid-out events are copied to an accelerator, evaluated
//! against registered predicate filters and sliding-window operators in
//! parallel, and the surviving events (and their input positions) come
//! back compacted and in order.
//!
//! ## Quick start
//!
//! ```
//! use std::sync::Arc;
//! use sluice::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let schema = EventSchema::builder("trades")
//!     .attribute("volume", AttributeType::Int)
//!     .build()?;
//!
//! // volume % 2 == 0
//! let program = FilterProgram::new(vec![
//!     Instr::PushAttr(0),
//!     Instr::PushInt(2),
//!     Instr::Mod,
//!     Instr::PushInt(0),
//!     Instr::Eq,
//! ]);
//!
//! let mut consumer = EventConsumer::new(
//!     "trades",
//!     schema.clone(),
//!     KernelTopology::MultiFilter,
//!     1024,
//!     256,
//!     Arc::new(NullSink),
//! );
//! consumer.initialize(Arc::new(CpuDevice::new()))?;
//! consumer.add_filter(Filter::new(1, program));
//! consumer.configure_filters()?;
//!
//! let mut batch = vec![0u8; 4 * schema.event_size()];
//! for (i, volume) in [3, 6, 9, 12].into_iter().enumerate() {
//!     let event = &mut batch[i * schema.event_size()..(i + 1) * schema.event_size()];
//!     EventWriter::new(&schema, event)?
//!         .header(0, i as i64, EventKind::Current)
//!         .attribute(0, AttrValue::Int(volume))?;
//! }
//! consumer.on_events(&batch, 4)?;
//! assert_eq!(consumer.matching_events(), &[1, 3]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! Device execution sits behind [`sluice_core::device::Device`]. The
//! bundled [`sluice_cpu::CpuDevice`] emulates the accelerator and is
//! always available; accelerator backends plug in at the same seam.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use sluice_core;
pub use sluice_cpu;
pub use sluice_engine;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use sluice_core::prelude::*;
    pub use sluice_cpu::CpuDevice;
    pub use sluice_engine::{
        BatchStats, ByteBufferLayout, EventConsumer, FilterProcessor, IndexBuffer,
        KernelTopology, LengthWindowProcessor, Processor, ProcessorContext, ProcessorKind,
        ProcessorState, StreamEventBuffer, StreamPipeline, MATCH_SENTINEL,
    };
}
