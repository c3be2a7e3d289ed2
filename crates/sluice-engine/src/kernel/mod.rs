//! Kernel layer: one struct per device program the pipeline launches.
//!
//! A kernel owns its output buffers, derives grid geometry from the
//! batch size and the configured events-per-block, and drives the
//! copy-in → launch → copy-out cycle for its stage. Host-visible results
//! are materialized only for the chain tail (`last == true`);
//! intermediate stages leave their results device-resident for the next
//! stage to consume.

mod filter;
mod window;

pub use filter::{FilterCompactKernel, FilterIndexKernel};
pub use window::LengthWindowKernel;
