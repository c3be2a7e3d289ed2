//! # Sluice Core
//!
//! Core traits and types for the Sluice GPU-resident event-processing
//! pipeline: event schemas and byte layouts, compiled predicate filters,
//! the device abstraction (memory, transfers with explicit fences, and
//! the closed kernel set), and the injected diagnostic sink.
//!
//! Backends implement [`Device`]; the pipeline crates compose buffers,
//! kernels, and processors on top of it.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod device;
pub mod error;
pub mod filter;
pub mod schema;
pub mod sink;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::device::{
        CopyFence, CopyMode, Device, DeviceAlloc, DeviceId, DeviceRegion, FilterCompactLaunch,
        FilterIndexLaunch, LaunchDims, WindowUpdateLaunch,
    };
    pub use crate::error::{Result, SluiceError};
    pub use crate::filter::{Filter, FilterProgram, FilterTableHandle, Instr};
    pub use crate::schema::{
        AttrValue, Attribute, AttributeType, EventKind, EventSchema, EventView, EventWriter,
        SchemaBuilder, EVENT_HEADER_SIZE,
    };
    pub use crate::sink::{DiagnosticSink, FileSink, MemorySink, NullSink, SharedSink};
}

pub use device::{Device, DeviceAlloc, DeviceId, DeviceRegion};
pub use error::{Result, SluiceError};
pub use filter::{Filter, FilterProgram};
pub use schema::EventSchema;
pub use sink::DiagnosticSink;
