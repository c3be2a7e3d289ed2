//! Device abstraction: memory, transfers, and the closed kernel set.
//!
//! A [`Device`] owns accelerator memory and executes the pipeline's three
//! kernel entry points. Dispatch happens once per launch, never per
//! event, so a pipeline binds its device at configuration time and the
//! per-event hot path stays monomorphic on the device side.
//!
//! Transfers take an explicit [`CopyMode`] and return a [`CopyFence`]:
//! the synchronization point is a value the caller must consume, not a
//! convention about which later call happens to block.

use std::fmt;

use crate::error::Result;
use crate::filter::{Filter, FilterTableHandle};
use crate::schema::EventSchema;

/// Identifier of one accelerator device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device{}", self.0)
    }
}

/// Handle to one device-memory allocation.
///
/// The handle is plain data; the owning [`Device`] holds the storage.
/// Exactly one buffer owns each allocation — downstream readers receive
/// a [`DeviceRegion`] instead of a second handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAlloc {
    id: u64,
    len: usize,
}

impl DeviceAlloc {
    /// Construct a handle. Backends call this from `alloc`.
    pub fn new(id: u64, len: usize) -> Self {
        Self { id, len }
    }

    /// Backend-assigned allocation id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Allocation length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the allocation is zero-sized.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Read-only descriptor of a device region used as kernel input.
///
/// Produced by the buffer that owns the allocation; carrying one of
/// these grants read access only, so two pipeline stages never hold
/// owning handles to the same region.
#[derive(Debug, Clone, Copy)]
pub struct DeviceRegion {
    alloc: DeviceAlloc,
}

impl DeviceRegion {
    /// Wrap an owned allocation for read-only consumption.
    pub fn new(alloc: DeviceAlloc) -> Self {
        Self { alloc }
    }

    /// The underlying allocation handle.
    pub fn alloc(&self) -> DeviceAlloc {
        self.alloc
    }
}

/// Whether a transfer blocks the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyMode {
    /// Block until the transfer completes.
    #[default]
    Sync,
    /// Issue the transfer and return; the data is valid only after the
    /// returned fence has been waited on.
    Async,
}

/// Completion fence for one transfer.
///
/// `wait` consumes the fence, making the synchronization point explicit
/// and single-use. Dropping an unwaited fence completes the transfer
/// best-effort so deferred writes still land.
#[must_use = "a copy is only ordered once its fence has been waited on"]
pub struct CopyFence<'a> {
    waiter: Option<Box<dyn FnOnce() -> Result<()> + Send + 'a>>,
}

impl<'a> CopyFence<'a> {
    /// A fence for a transfer that already completed.
    pub fn ready() -> Self {
        Self { waiter: None }
    }

    /// A fence that runs `waiter` to complete the transfer.
    pub fn deferred(waiter: impl FnOnce() -> Result<()> + Send + 'a) -> Self {
        Self {
            waiter: Some(Box::new(waiter)),
        }
    }

    /// Block until the transfer has completed.
    pub fn wait(mut self) -> Result<()> {
        match self.waiter.take() {
            Some(waiter) => waiter(),
            None => Ok(()),
        }
    }
}

impl Drop for CopyFence<'_> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            // Errors surface on explicit wait; a dropped fence cannot
            // report them.
            let _ = waiter();
        }
    }
}

impl fmt::Debug for CopyFence<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyFence")
            .field("pending", &self.waiter.is_some())
            .finish()
    }
}

/// Grid/block geometry for one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDims {
    /// Number of thread blocks.
    pub grid_size: u32,
    /// Threads (events) per block.
    pub block_size: u32,
}

impl LaunchDims {
    /// Geometry for `num_events` with `events_per_block` threads per block.
    pub fn for_events(num_events: usize, events_per_block: u32) -> Self {
        let block = events_per_block.max(1);
        let grid = (num_events as u32).div_ceil(block).max(1);
        Self {
            grid_size: grid,
            block_size: block,
        }
    }
}

/// Launch parameters for the single-filter index kernel.
///
/// One thread per event; thread `i` evaluates filter `filter_slot` and
/// writes `i` into `result[i]` on a match. Non-matching slots keep the
/// reset sentinel.
#[derive(Debug)]
pub struct FilterIndexLaunch<'a> {
    /// Launch geometry.
    pub dims: LaunchDims,
    /// Event layout of the input region.
    pub schema: &'a EventSchema,
    /// Uploaded filter table.
    pub table: FilterTableHandle,
    /// Slot in the table to evaluate.
    pub filter_slot: u32,
    /// Input events.
    pub input: DeviceRegion,
    /// Events in this batch.
    pub num_events: usize,
    /// `i32` result slots, one per input event.
    pub result: DeviceAlloc,
}

/// Launch parameters for the multi-filter compaction kernel.
///
/// One thread per event; a thread's flag is set when any table entry
/// matches. Flags are exclusive-prefix-summed to assign dense output
/// slots; matching threads scatter their event payload and source index,
/// and the matched count lands in `matched_count` for host readback.
#[derive(Debug)]
pub struct FilterCompactLaunch<'a> {
    /// Launch geometry.
    pub dims: LaunchDims,
    /// Event layout of the input region.
    pub schema: &'a EventSchema,
    /// Uploaded filter table.
    pub table: FilterTableHandle,
    /// Input events.
    pub input: DeviceRegion,
    /// Events in this batch.
    pub num_events: usize,
    /// `i32` match flags, one per input event.
    pub flags: DeviceAlloc,
    /// `i32` exclusive prefix sums over the flags.
    pub prefix_sums: DeviceAlloc,
    /// Densely packed matching events.
    pub result_events: DeviceAlloc,
    /// `i32` source index per compacted event.
    pub matched_positions: DeviceAlloc,
    /// Single `i32` matched-count cell.
    pub matched_count: DeviceAlloc,
}

/// Launch parameters for the sliding-window update kernel.
#[derive(Debug)]
pub struct WindowUpdateLaunch<'a> {
    /// Launch geometry.
    pub dims: LaunchDims,
    /// Event layout of the window and input regions.
    pub schema: &'a EventSchema,
    /// New events for this batch.
    pub input: DeviceRegion,
    /// Events in this batch.
    pub num_events: usize,
    /// Device-resident window storage, `window_size` events.
    pub window: DeviceAlloc,
    /// Configured window length in events.
    pub window_size: usize,
    /// Window occupancy before this batch.
    pub occupancy: usize,
    /// Result region receiving the window contents when `emit` is set.
    pub result: DeviceAlloc,
    /// Whether this stage is the chain tail and must emit its window.
    pub emit: bool,
}

/// An accelerator backend.
///
/// The kernel set is closed: filters and windows are the only device
/// programs the pipeline dispatches, so backends implement exactly these
/// three entry points plus memory management.
pub trait Device: Send + Sync {
    /// Device identity.
    fn id(&self) -> DeviceId;

    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Allocate `len` bytes of device memory.
    fn alloc(&self, len: usize) -> Result<DeviceAlloc>;

    /// Release an allocation.
    fn free(&self, alloc: DeviceAlloc) -> Result<()>;

    /// Copy `src` into the front of `dst`.
    fn copy_to_device<'a>(
        &'a self,
        dst: DeviceAlloc,
        src: &[u8],
        mode: CopyMode,
    ) -> Result<CopyFence<'a>>;

    /// Copy the front of `src` into `dst`.
    fn copy_to_host<'a>(
        &'a self,
        src: DeviceAlloc,
        dst: &'a mut [u8],
        mode: CopyMode,
    ) -> Result<CopyFence<'a>>;

    /// Fill an allocation with a byte pattern.
    fn fill(&self, alloc: DeviceAlloc, value: u8) -> Result<()>;

    /// Upload a filter table; the table is immutable afterwards.
    fn upload_filter_table(&self, filters: &[Filter]) -> Result<FilterTableHandle>;

    /// Run the single-filter index kernel.
    fn launch_filter_index(&self, launch: FilterIndexLaunch<'_>) -> Result<()>;

    /// Run the multi-filter compaction kernel.
    fn launch_filter_compact(&self, launch: FilterCompactLaunch<'_>) -> Result<()>;

    /// Run the sliding-window update kernel; returns the new occupancy.
    fn launch_window_update(&self, launch: WindowUpdateLaunch<'_>) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_dims() {
        let dims = LaunchDims::for_events(1000, 256);
        assert_eq!(dims.grid_size, 4);
        assert_eq!(dims.block_size, 256);

        let dims = LaunchDims::for_events(1024, 256);
        assert_eq!(dims.grid_size, 4);

        // Degenerate geometry still launches one block.
        let dims = LaunchDims::for_events(0, 256);
        assert_eq!(dims.grid_size, 1);
        let dims = LaunchDims::for_events(10, 0);
        assert_eq!(dims.block_size, 1);
    }

    #[test]
    fn test_ready_fence_waits_ok() {
        let fence = CopyFence::ready();
        assert!(fence.wait().is_ok());
    }

    #[test]
    fn test_deferred_fence_runs_on_wait() {
        let mut hit = false;
        let fence = CopyFence::deferred(|| {
            hit = true;
            Ok(())
        });
        fence.wait().unwrap();
        assert!(hit);
    }
}
