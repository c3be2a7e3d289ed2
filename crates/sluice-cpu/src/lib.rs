//! # Sluice CPU backend
//!
//! CPU implementation of the Sluice device abstraction. This backend
//! executes the filter and window kernels on the host, simulating the
//! accelerator's work decomposition (per-block evaluation, blocked
//! prefix-sum compaction). It is always available and is the backend
//! every test suite runs against.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

mod device;
pub mod scan;

pub use device::CpuDevice;
