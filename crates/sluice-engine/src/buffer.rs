//! Mirrored host/device buffers.
//!
//! A mirrored buffer pairs one host region and one device region of
//! identical layout under single ownership: creating the buffer
//! allocates both, dropping it releases the device side, and the only
//! mutations are explicit copies and resets. Downstream pipeline stages
//! read a buffer's device side through a [`DeviceRegion`] descriptor;
//! they never hold a second owning handle.

use std::sync::Arc;

use tracing::warn;

use sluice_core::device::{CopyFence, CopyMode, Device, DeviceAlloc, DeviceRegion};
use sluice_core::error::{Result, SluiceError};
use sluice_core::schema::EventSchema;

/// Sentinel written into index slots that hold no match.
pub const MATCH_SENTINEL: i32 = -1;

/// Byte pattern whose `i32` interpretation is [`MATCH_SENTINEL`].
pub const SENTINEL_BYTE: u8 = 0xFF;

/// Mirrored buffer of schema-laid-out events.
pub struct StreamEventBuffer {
    name: String,
    schema: Arc<EventSchema>,
    device: Arc<dyn Device>,
    host: Vec<u8>,
    dev: DeviceAlloc,
    capacity: usize,
}

impl StreamEventBuffer {
    /// Allocate host and device regions for `capacity` events.
    pub fn create(
        name: impl Into<String>,
        schema: Arc<EventSchema>,
        device: Arc<dyn Device>,
        capacity: usize,
    ) -> Result<Self> {
        let name = name.into();
        if capacity == 0 {
            return Err(SluiceError::InvalidConfig(format!(
                "event buffer '{name}' needs a non-zero capacity"
            )));
        }
        let bytes = capacity * schema.event_size();
        let dev = device.alloc(bytes)?;
        Ok(Self {
            name,
            schema,
            device,
            host: vec![0u8; bytes],
            dev,
            capacity,
        })
    }

    /// Adopt caller-provided host storage instead of allocating.
    ///
    /// The storage must hold at least `capacity` events; it is handed
    /// back by [`into_host_buffer`](Self::into_host_buffer).
    pub fn from_parts(
        name: impl Into<String>,
        schema: Arc<EventSchema>,
        device: Arc<dyn Device>,
        host: Vec<u8>,
        capacity: usize,
    ) -> Result<Self> {
        let name = name.into();
        let bytes = capacity * schema.event_size();
        if capacity == 0 || host.len() < bytes {
            return Err(SluiceError::BufferNotBound(name));
        }
        let dev = device.alloc(bytes)?;
        Ok(Self {
            name,
            schema,
            device,
            host,
            dev,
            capacity,
        })
    }

    /// Reclaim the host storage, releasing the device side on drop.
    pub fn into_host_buffer(mut self) -> Vec<u8> {
        std::mem::take(&mut self.host)
    }

    /// Buffer name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event layout.
    pub fn schema(&self) -> &Arc<EventSchema> {
        &self.schema
    }

    /// Capacity in events.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size of one event in bytes.
    pub fn event_size(&self) -> usize {
        self.schema.event_size()
    }

    /// Read-only descriptor of the device region.
    pub fn region(&self) -> DeviceRegion {
        DeviceRegion::new(self.dev)
    }

    /// Host bytes of the first `count` events.
    pub fn host_events(&self, count: usize) -> Result<&[u8]> {
        self.check_count(count)?;
        Ok(&self.host[..count * self.event_size()])
    }

    /// Write `count` events into the front of the host region.
    pub fn write_events(&mut self, bytes: &[u8], count: usize) -> Result<()> {
        self.check_count(count)?;
        let len = count * self.event_size();
        if bytes.len() < len {
            return Err(SluiceError::TransferOverflow {
                required: len,
                available: bytes.len(),
            });
        }
        self.host[..len].copy_from_slice(&bytes[..len]);
        Ok(())
    }

    /// Copy the first `count` events host → device.
    ///
    /// The host region may not be written again until the returned fence
    /// has been waited on.
    pub fn copy_to_device(&self, count: usize, mode: CopyMode) -> Result<CopyFence<'_>> {
        self.check_count(count)?;
        let len = count * self.event_size();
        self.device.copy_to_device(self.dev, &self.host[..len], mode)
    }

    /// Copy the first `count` events device → host.
    ///
    /// The fence is resolved before returning: the buffer owns both
    /// regions, so the ordering point cannot outlive the borrow of its
    /// host side.
    pub fn copy_to_host(&mut self, count: usize, mode: CopyMode) -> Result<()> {
        self.check_count(count)?;
        let len = count * self.event_size();
        self.device
            .copy_to_host(self.dev, &mut self.host[..len], mode)?
            .wait()
    }

    /// Fill the host region with a byte pattern.
    pub fn reset_host(&mut self, value: u8) {
        self.host.fill(value);
    }

    /// Fill the device region with a byte pattern.
    pub fn reset_device(&self, value: u8) -> Result<()> {
        self.device.fill(self.dev, value)
    }

    fn check_count(&self, count: usize) -> Result<()> {
        if count > self.capacity {
            return Err(SluiceError::CapacityExceeded {
                requested: count,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

impl Drop for StreamEventBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.device.free(self.dev) {
            warn!("freeing event buffer '{}' failed: {err}", self.name);
        }
    }
}

/// Mirrored buffer of `i32` slots (match flags, prefix sums, indices).
pub struct IndexBuffer {
    name: String,
    device: Arc<dyn Device>,
    host: Vec<i32>,
    dev: DeviceAlloc,
    capacity: usize,
}

impl IndexBuffer {
    /// Allocate host and device regions for `capacity` slots.
    pub fn create(
        name: impl Into<String>,
        device: Arc<dyn Device>,
        capacity: usize,
    ) -> Result<Self> {
        let name = name.into();
        if capacity == 0 {
            return Err(SluiceError::InvalidConfig(format!(
                "index buffer '{name}' needs a non-zero capacity"
            )));
        }
        let dev = device.alloc(capacity * 4)?;
        Ok(Self {
            name,
            device,
            host: vec![0i32; capacity],
            dev,
            capacity,
        })
    }

    /// Buffer name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capacity in slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The device allocation handle, for launch parameters.
    pub fn alloc(&self) -> DeviceAlloc {
        self.dev
    }

    /// Host values of the first `count` slots.
    pub fn values(&self, count: usize) -> Result<&[i32]> {
        self.check_count(count)?;
        Ok(&self.host[..count])
    }

    /// Copy the first `count` slots host → device.
    pub fn copy_to_device(&self, count: usize, mode: CopyMode) -> Result<CopyFence<'_>> {
        self.check_count(count)?;
        let bytes: &[u8] = bytemuck::cast_slice(&self.host[..count]);
        self.device.copy_to_device(self.dev, bytes, mode)
    }

    /// Copy the first `count` slots device → host, resolving the fence.
    pub fn copy_to_host(&mut self, count: usize, mode: CopyMode) -> Result<()> {
        self.check_count(count)?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.host[..count]);
        self.device.copy_to_host(self.dev, bytes, mode)?.wait()
    }

    /// Fill the host slots with a value.
    pub fn reset_host(&mut self, value: i32) {
        self.host.fill(value);
    }

    /// Fill the device region with a byte pattern.
    ///
    /// [`SENTINEL_BYTE`] yields [`MATCH_SENTINEL`] in every slot.
    pub fn reset_device(&self, value: u8) -> Result<()> {
        self.device.fill(self.dev, value)
    }

    fn check_count(&self, count: usize) -> Result<()> {
        if count > self.capacity {
            return Err(SluiceError::CapacityExceeded {
                requested: count,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

impl Drop for IndexBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.device.free(self.dev) {
            warn!("freeing index buffer '{}' failed: {err}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::schema::AttributeType;
    use sluice_cpu::CpuDevice;

    fn schema() -> Arc<EventSchema> {
        EventSchema::builder("s")
            .attribute("a", AttributeType::Int)
            .build()
            .unwrap()
    }

    #[test]
    fn test_round_trip_preserves_bytes() {
        let device: Arc<dyn Device> = Arc::new(CpuDevice::new());
        let schema = schema();
        let mut buf =
            StreamEventBuffer::create("input", schema.clone(), device.clone(), 4).unwrap();

        let payload: Vec<u8> = (0..schema.event_size() as u8).collect();
        let mut batch = payload.clone();
        batch.extend_from_slice(&payload);
        buf.write_events(&batch, 2).unwrap();

        buf.copy_to_device(2, CopyMode::Sync).unwrap().wait().unwrap();
        buf.reset_host(0);
        buf.copy_to_host(2, CopyMode::Sync).unwrap();

        assert_eq!(buf.host_events(2).unwrap(), &batch[..]);
    }

    #[test]
    fn test_reset_host_is_total() {
        let device: Arc<dyn Device> = Arc::new(CpuDevice::new());
        let mut buf = StreamEventBuffer::create("input", schema(), device, 4).unwrap();
        buf.reset_host(0xEE);
        assert!(buf
            .host_events(4)
            .unwrap()
            .iter()
            .all(|&b| b == 0xEE));
    }

    #[test]
    fn test_capacity_checks() {
        let device: Arc<dyn Device> = Arc::new(CpuDevice::new());
        let mut buf = StreamEventBuffer::create("input", schema(), device, 2).unwrap();
        let bytes = vec![0u8; 3 * buf.event_size()];
        assert!(matches!(
            buf.write_events(&bytes, 3),
            Err(SluiceError::CapacityExceeded { .. })
        ));
        assert!(buf.copy_to_device(3, CopyMode::Sync).is_err());
    }

    #[test]
    fn test_from_parts_round_trip() {
        let device: Arc<dyn Device> = Arc::new(CpuDevice::new());
        let schema = schema();
        let storage = vec![7u8; 4 * schema.event_size()];
        let buf = StreamEventBuffer::from_parts(
            "external",
            schema.clone(),
            device,
            storage.clone(),
            4,
        )
        .unwrap();
        assert_eq!(buf.host_events(4).unwrap(), &storage[..]);
        assert_eq!(buf.into_host_buffer(), storage);
    }

    #[test]
    fn test_from_parts_undersized_is_rejected() {
        let device: Arc<dyn Device> = Arc::new(CpuDevice::new());
        let schema = schema();
        let storage = vec![0u8; schema.event_size()];
        assert!(matches!(
            StreamEventBuffer::from_parts("external", schema, device, storage, 4),
            Err(SluiceError::BufferNotBound(_))
        ));
    }

    #[test]
    fn test_index_buffer_sentinel_reset() {
        let device: Arc<dyn Device> = Arc::new(CpuDevice::new());
        let mut buf = IndexBuffer::create("results", device, 8).unwrap();
        buf.reset_device(SENTINEL_BYTE).unwrap();
        buf.copy_to_host(8, CopyMode::Sync).unwrap();
        assert!(buf.values(8).unwrap().iter().all(|&v| v == MATCH_SENTINEL));
    }

    #[test]
    fn test_index_buffer_round_trip() {
        let device: Arc<dyn Device> = Arc::new(CpuDevice::new());
        let mut buf = IndexBuffer::create("scan", device, 4).unwrap();
        buf.reset_host(0);
        let values = [3, 1, 4, 1];
        buf.host.copy_from_slice(&values);
        buf.copy_to_device(4, CopyMode::Sync).unwrap().wait().unwrap();
        buf.reset_host(0);
        buf.copy_to_host(4, CopyMode::Sync).unwrap();
        assert_eq!(buf.values(4).unwrap(), &values);
    }

    #[test]
    fn test_device_allocation_released_on_drop() {
        let cpu = Arc::new(CpuDevice::new());
        let device: Arc<dyn Device> = cpu.clone();
        {
            let _buf = StreamEventBuffer::create("input", schema(), device.clone(), 2).unwrap();
            let _idx = IndexBuffer::create("results", device, 2).unwrap();
            assert_eq!(cpu.allocation_count(), 2);
        }
        assert_eq!(cpu.allocation_count(), 0);
    }
}
