//! CPU implementation of the device abstraction.
//!
//! This backend executes the kernel set on the CPU, simulating the
//! accelerator: device allocations are separate host-side regions, and
//! every launch honors the requested grid/block geometry so the blocked
//! scan and per-block evaluation match a real device's work
//! decomposition. It is always available and backs every test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tracing::{debug, trace};

use sluice_core::device::{
    CopyFence, CopyMode, Device, DeviceAlloc, DeviceId, FilterCompactLaunch, FilterIndexLaunch,
    WindowUpdateLaunch,
};
use sluice_core::error::{Result, SluiceError};
use sluice_core::filter::{Filter, FilterTableHandle};
use sluice_core::schema::EventView;

use crate::scan::exclusive_scan_blocked;

type Region = Arc<Mutex<Vec<u8>>>;

/// CPU-backed device.
pub struct CpuDevice {
    id: DeviceId,
    regions: RwLock<HashMap<u64, Region>>,
    filter_tables: RwLock<HashMap<u64, Arc<Vec<Filter>>>>,
    next_alloc: AtomicU64,
    next_table: AtomicU64,
}

impl CpuDevice {
    /// Create a CPU device with id 0.
    pub fn new() -> Self {
        Self::with_id(DeviceId(0))
    }

    /// Create a CPU device with an explicit id.
    pub fn with_id(id: DeviceId) -> Self {
        debug!("Initializing CPU device ({id})");
        Self {
            id,
            regions: RwLock::new(HashMap::new()),
            filter_tables: RwLock::new(HashMap::new()),
            next_alloc: AtomicU64::new(1),
            next_table: AtomicU64::new(1),
        }
    }

    /// Number of live allocations; used by leak checks in tests.
    pub fn allocation_count(&self) -> usize {
        self.regions.read().len()
    }

    fn region(&self, alloc: DeviceAlloc) -> Result<Region> {
        self.regions
            .read()
            .get(&alloc.id())
            .cloned()
            .ok_or(SluiceError::UnknownAllocation(alloc.id()))
    }

    fn table(&self, handle: FilterTableHandle) -> Result<Arc<Vec<Filter>>> {
        self.filter_tables
            .read()
            .get(&handle.0)
            .cloned()
            .ok_or(SluiceError::UnknownFilterTable(handle.0))
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn write_i32(bytes: &mut [u8], index: usize, value: i32) {
    bytes[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
}

fn check_region_fits(alloc: DeviceAlloc, required: usize) -> Result<()> {
    if alloc.len() < required {
        return Err(SluiceError::TransferOverflow {
            required,
            available: alloc.len(),
        });
    }
    Ok(())
}

impl Device for CpuDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn name(&self) -> &str {
        "cpu"
    }

    fn alloc(&self, len: usize) -> Result<DeviceAlloc> {
        if len == 0 {
            return Err(SluiceError::InvalidConfig(
                "cannot allocate zero-sized device buffer".to_string(),
            ));
        }
        let id = self.next_alloc.fetch_add(1, Ordering::Relaxed);
        self.regions
            .write()
            .insert(id, Arc::new(Mutex::new(vec![0u8; len])));
        trace!("alloc {id}: {len} bytes");
        Ok(DeviceAlloc::new(id, len))
    }

    fn free(&self, alloc: DeviceAlloc) -> Result<()> {
        self.regions
            .write()
            .remove(&alloc.id())
            .map(|_| ())
            .ok_or(SluiceError::UnknownAllocation(alloc.id()))
    }

    fn copy_to_device<'a>(
        &'a self,
        dst: DeviceAlloc,
        src: &[u8],
        _mode: CopyMode,
    ) -> Result<CopyFence<'a>> {
        if src.len() > dst.len() {
            return Err(SluiceError::TransferOverflow {
                required: src.len(),
                available: dst.len(),
            });
        }
        let region = self.region(dst)?;
        region.lock()[..src.len()].copy_from_slice(src);
        // The emulated transfer completes eagerly; the fence remains the
        // caller's ordering point.
        Ok(CopyFence::ready())
    }

    fn copy_to_host<'a>(
        &'a self,
        src: DeviceAlloc,
        dst: &'a mut [u8],
        _mode: CopyMode,
    ) -> Result<CopyFence<'a>> {
        if dst.len() > src.len() {
            return Err(SluiceError::TransferOverflow {
                required: dst.len(),
                available: src.len(),
            });
        }
        let region = self.region(src)?;
        let len = dst.len();
        dst.copy_from_slice(&region.lock()[..len]);
        Ok(CopyFence::ready())
    }

    fn fill(&self, alloc: DeviceAlloc, value: u8) -> Result<()> {
        let region = self.region(alloc)?;
        region.lock().fill(value);
        Ok(())
    }

    fn upload_filter_table(&self, filters: &[Filter]) -> Result<FilterTableHandle> {
        let id = self.next_table.fetch_add(1, Ordering::Relaxed);
        self.filter_tables
            .write()
            .insert(id, Arc::new(filters.to_vec()));
        debug!("uploaded filter table {id} ({} filters)", filters.len());
        Ok(FilterTableHandle(id))
    }

    fn launch_filter_index(&self, launch: FilterIndexLaunch<'_>) -> Result<()> {
        let table = self.table(launch.table)?;
        let input_region = self.region(launch.input.alloc())?;
        let result_region = self.region(launch.result)?;

        let n = launch.num_events;
        if n == 0 {
            return Ok(());
        }
        let event_size = launch.schema.event_size();
        check_region_fits(launch.input.alloc(), n * event_size)?;
        check_region_fits(launch.result, n * 4)?;

        let filter = table.get(launch.filter_slot as usize);
        let input = input_region.lock();
        let mut result = result_region.lock();

        let block = launch.dims.block_size as usize;
        let schema = launch.schema;
        let input_bytes: &[u8] = &input;
        result[..n * 4]
            .par_chunks_mut(block * 4)
            .enumerate()
            .for_each(|(block_index, out_block)| {
                for (t, slot) in out_block.chunks_exact_mut(4).enumerate() {
                    let i = block_index * block + t;
                    let start = i * event_size;
                    let matched = match (filter, EventView::new(schema, &input_bytes[start..start + event_size])) {
                        (Some(f), Ok(view)) => f.program.evaluate(&view),
                        _ => false,
                    };
                    if matched {
                        slot.copy_from_slice(&(i as i32).to_le_bytes());
                    }
                }
            });
        Ok(())
    }

    fn launch_filter_compact(&self, launch: FilterCompactLaunch<'_>) -> Result<()> {
        let table = self.table(launch.table)?;
        let input_region = self.region(launch.input.alloc())?;
        let flags_region = self.region(launch.flags)?;
        let prefix_region = self.region(launch.prefix_sums)?;
        let result_region = self.region(launch.result_events)?;
        let positions_region = self.region(launch.matched_positions)?;
        let count_region = self.region(launch.matched_count)?;

        let n = launch.num_events;
        let event_size = launch.schema.event_size();
        if n > 0 {
            check_region_fits(launch.input.alloc(), n * event_size)?;
            check_region_fits(launch.result_events, n * event_size)?;
            check_region_fits(launch.flags, n * 4)?;
            check_region_fits(launch.prefix_sums, n * 4)?;
            check_region_fits(launch.matched_positions, n * 4)?;
        }
        check_region_fits(launch.matched_count, 4)?;

        if n == 0 {
            count_region.lock()[..4].copy_from_slice(&0i32.to_le_bytes());
            return Ok(());
        }

        let input = input_region.lock();
        let input_bytes: &[u8] = &input;
        let schema = launch.schema;
        let block = launch.dims.block_size as usize;

        // Phase 1: one flag per event, set when any table entry matches.
        let mut flags = vec![0i32; n];
        flags
            .par_chunks_mut(block)
            .enumerate()
            .for_each(|(block_index, flag_block)| {
                for (t, flag) in flag_block.iter_mut().enumerate() {
                    let i = block_index * block + t;
                    let start = i * event_size;
                    let matched = EventView::new(schema, &input_bytes[start..start + event_size])
                        .map(|view| table.iter().any(|f| f.program.evaluate(&view)))
                        .unwrap_or(false);
                    *flag = matched as i32;
                }
            });

        // Phase 2: exclusive scan assigns each match its dense slot.
        // The scan/write-back split is the device-side barrier.
        let mut prefix = vec![0i32; n];
        let total = exclusive_scan_blocked(&flags, &mut prefix, block);
        let count = total as usize;

        {
            let mut flags_bytes = flags_region.lock();
            for (i, &f) in flags.iter().enumerate() {
                write_i32(&mut flags_bytes, i, f);
            }
            let mut prefix_bytes = prefix_region.lock();
            for (i, &p) in prefix.iter().enumerate() {
                write_i32(&mut prefix_bytes, i, p);
            }
        }

        // Phase 3: stable scatter. Output slot k belongs to the k-th set
        // flag; its source is the last index whose prefix sum is <= k.
        let mut result = result_region.lock();
        result[..count * event_size]
            .par_chunks_mut(event_size)
            .enumerate()
            .for_each(|(k, out_event)| {
                let i = prefix.partition_point(|&p| p <= k as i32) - 1;
                let start = i * event_size;
                out_event.copy_from_slice(&input_bytes[start..start + event_size]);
            });

        let mut positions = positions_region.lock();
        positions[..count * 4]
            .par_chunks_mut(4)
            .enumerate()
            .for_each(|(k, slot)| {
                let i = prefix.partition_point(|&p| p <= k as i32) - 1;
                slot.copy_from_slice(&(i as i32).to_le_bytes());
            });

        count_region.lock()[..4].copy_from_slice(&(count as i32).to_le_bytes());
        trace!("filter compact: {n} events in, {count} matched");
        Ok(())
    }

    fn launch_window_update(&self, launch: WindowUpdateLaunch<'_>) -> Result<usize> {
        let input_region = self.region(launch.input.alloc())?;
        let window_region = self.region(launch.window)?;

        let event_size = launch.schema.event_size();
        let window_size = launch.window_size;
        let n = launch.num_events;
        let occupancy = launch.occupancy.min(window_size);

        check_region_fits(launch.window, window_size * event_size)?;
        check_region_fits(launch.input.alloc(), n * event_size)?;

        let input = input_region.lock();
        let mut window = window_region.lock();

        let new_occupancy = if n >= window_size {
            // The batch alone fills the window; keep its tail.
            let tail_start = (n - window_size) * event_size;
            window[..window_size * event_size]
                .copy_from_slice(&input[tail_start..n * event_size]);
            window_size
        } else {
            let keep = occupancy.min(window_size - n);
            let shift = occupancy - keep;
            if shift > 0 {
                window.copy_within(shift * event_size..occupancy * event_size, 0);
            }
            window[keep * event_size..(keep + n) * event_size]
                .copy_from_slice(&input[..n * event_size]);
            keep + n
        };

        if launch.emit {
            let result_region = self.region(launch.result)?;
            check_region_fits(launch.result, new_occupancy * event_size)?;
            result_region.lock()[..new_occupancy * event_size]
                .copy_from_slice(&window[..new_occupancy * event_size]);
        }

        trace!("window update: +{n} events, occupancy {new_occupancy}/{window_size}");
        Ok(new_occupancy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::device::LaunchDims;
    use sluice_core::filter::{FilterProgram, Instr};
    use sluice_core::schema::{AttrValue, AttributeType, EventKind, EventSchema, EventWriter};

    fn int_schema() -> Arc<EventSchema> {
        EventSchema::builder("s")
            .attribute("a", AttributeType::Int)
            .build()
            .unwrap()
    }

    fn encode_events(schema: &EventSchema, values: &[i32]) -> Vec<u8> {
        let es = schema.event_size();
        let mut bytes = vec![0u8; es * values.len()];
        for (i, &v) in values.iter().enumerate() {
            let mut w = EventWriter::new(schema, &mut bytes[i * es..(i + 1) * es]).unwrap();
            w.header(i as i64, i as i64, EventKind::Current);
            w.attribute(0, AttrValue::Int(v)).unwrap();
        }
        bytes
    }

    fn even_filter(id: u32) -> Filter {
        Filter::new(
            id,
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
    fn test_alloc_copy_round_trip() {
        let device = CpuDevice::new();
        let alloc = device.alloc(64).unwrap();

        let data: Vec<u8> = (0..64).collect();
        device
            .copy_to_device(alloc, &data, CopyMode::Sync)
            .unwrap()
            .wait()
            .unwrap();

        let mut back = vec![0u8; 64];
        device
            .copy_to_host(alloc, &mut back, CopyMode::Sync)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(back, data);

        device.free(alloc).unwrap();
        assert_eq!(device.allocation_count(), 0);
    }

    #[test]
    fn test_copy_overflow_rejected() {
        let device = CpuDevice::new();
        let alloc = device.alloc(8).unwrap();
        let result = device.copy_to_device(alloc, &[0u8; 16], CopyMode::Sync);
        assert!(matches!(
            result,
            Err(SluiceError::TransferOverflow { .. })
        ));
    }

    #[test]
    fn test_fill() {
        let device = CpuDevice::new();
        let alloc = device.alloc(16).unwrap();
        device.fill(alloc, 0xAB).unwrap();
        let mut back = vec![0u8; 16];
        device
            .copy_to_host(alloc, &mut back, CopyMode::Sync)
            .unwrap()
            .wait()
            .unwrap();
        assert!(back.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_filter_index_launch() {
        let device = CpuDevice::new();
        let schema = int_schema();
        let events = encode_events(&schema, &[1, 2, 3, 4, 5, 6]);

        let input = device.alloc(events.len()).unwrap();
        device
            .copy_to_device(input, &events, CopyMode::Sync)
            .unwrap()
            .wait()
            .unwrap();
        let result = device.alloc(6 * 4).unwrap();
        device.fill(result, 0xFF).unwrap(); // -1 sentinel

        let table = device.upload_filter_table(&[even_filter(1)]).unwrap();
        device
            .launch_filter_index(FilterIndexLaunch {
                dims: LaunchDims::for_events(6, 4),
                schema: &schema,
                table,
                filter_slot: 0,
                input: sluice_core::device::DeviceRegion::new(input),
                num_events: 6,
                result,
            })
            .unwrap();

        let mut back = vec![0u8; 6 * 4];
        device
            .copy_to_host(result, &mut back, CopyMode::Sync)
            .unwrap()
            .wait()
            .unwrap();
        let slots: Vec<i32> = back
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(slots, vec![-1, 1, -1, 3, -1, 5]);
    }

    #[test]
    fn test_filter_compact_launch() {
        let device = CpuDevice::new();
        let schema = int_schema();
        let es = schema.event_size();
        let values = [1, 2, 3, 4, 5, 6];
        let events = encode_events(&schema, &values);

        let input = device.alloc(events.len()).unwrap();
        device
            .copy_to_device(input, &events, CopyMode::Sync)
            .unwrap()
            .wait()
            .unwrap();
        let flags = device.alloc(6 * 4).unwrap();
        let prefix = device.alloc(6 * 4).unwrap();
        let result_events = device.alloc(6 * es).unwrap();
        let positions = device.alloc(6 * 4).unwrap();
        let count = device.alloc(4).unwrap();

        let table = device.upload_filter_table(&[even_filter(1)]).unwrap();
        device
            .launch_filter_compact(FilterCompactLaunch {
                dims: LaunchDims::for_events(6, 2),
                schema: &schema,
                table,
                input: sluice_core::device::DeviceRegion::new(input),
                num_events: 6,
                flags,
                prefix_sums: prefix,
                result_events,
                matched_positions: positions,
                matched_count: count,
            })
            .unwrap();

        let mut count_back = [0u8; 4];
        device
            .copy_to_host(count, &mut count_back, CopyMode::Sync)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(i32::from_le_bytes(count_back), 3);

        let mut pos_back = vec![0u8; 3 * 4];
        device
            .copy_to_host(positions, &mut pos_back, CopyMode::Sync)
            .unwrap()
            .wait()
            .unwrap();
        let pos: Vec<i32> = pos_back
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(pos, vec![1, 3, 5]);

        // Compacted payloads preserve input order.
        let mut ev_back = vec![0u8; 3 * es];
        device
            .copy_to_host(result_events, &mut ev_back, CopyMode::Sync)
            .unwrap()
            .wait()
            .unwrap();
        for (k, expected) in [2, 4, 6].into_iter().enumerate() {
            let view = EventView::new(&schema, &ev_back[k * es..(k + 1) * es]).unwrap();
            assert_eq!(view.attribute(0), Some(AttrValue::Int(expected)));
        }
    }

    #[test]
    fn test_empty_filter_table_matches_nothing() {
        let device = CpuDevice::new();
        let schema = int_schema();
        let events = encode_events(&schema, &[2, 4]);

        let input = device.alloc(events.len()).unwrap();
        device
            .copy_to_device(input, &events, CopyMode::Sync)
            .unwrap()
            .wait()
            .unwrap();
        let flags = device.alloc(2 * 4).unwrap();
        let prefix = device.alloc(2 * 4).unwrap();
        let result_events = device.alloc(events.len()).unwrap();
        let positions = device.alloc(2 * 4).unwrap();
        let count = device.alloc(4).unwrap();

        let table = device.upload_filter_table(&[]).unwrap();
        device
            .launch_filter_compact(FilterCompactLaunch {
                dims: LaunchDims::for_events(2, 2),
                schema: &schema,
                table,
                input: sluice_core::device::DeviceRegion::new(input),
                num_events: 2,
                flags,
                prefix_sums: prefix,
                result_events,
                matched_positions: positions,
                matched_count: count,
            })
            .unwrap();

        let mut count_back = [0u8; 4];
        device
            .copy_to_host(count, &mut count_back, CopyMode::Sync)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(i32::from_le_bytes(count_back), 0);
    }

    #[test]
    fn test_window_update_partial_then_overflow() {
        let device = CpuDevice::new();
        let schema = int_schema();
        let es = schema.event_size();
        let window = device.alloc(3 * es).unwrap();
        let result = device.alloc(3 * es).unwrap();

        // First batch: 2 events into an empty window of 3.
        let batch = encode_events(&schema, &[10, 20]);
        let input = device.alloc(batch.len()).unwrap();
        device
            .copy_to_device(input, &batch, CopyMode::Sync)
            .unwrap()
            .wait()
            .unwrap();
        let occ = device
            .launch_window_update(WindowUpdateLaunch {
                dims: LaunchDims::for_events(2, 4),
                schema: &schema,
                input: sluice_core::device::DeviceRegion::new(input),
                num_events: 2,
                window,
                window_size: 3,
                occupancy: 0,
                result,
                emit: false,
            })
            .unwrap();
        assert_eq!(occ, 2);

        // Second batch: 5 events; only the last 3 stay.
        let batch = encode_events(&schema, &[1, 2, 3, 4, 5]);
        let input2 = device.alloc(batch.len()).unwrap();
        device
            .copy_to_device(input2, &batch, CopyMode::Sync)
            .unwrap()
            .wait()
            .unwrap();
        let occ = device
            .launch_window_update(WindowUpdateLaunch {
                dims: LaunchDims::for_events(5, 4),
                schema: &schema,
                input: sluice_core::device::DeviceRegion::new(input2),
                num_events: 5,
                window,
                window_size: 3,
                occupancy: occ,
                result,
                emit: true,
            })
            .unwrap();
        assert_eq!(occ, 3);

        let mut back = vec![0u8; 3 * es];
        device
            .copy_to_host(result, &mut back, CopyMode::Sync)
            .unwrap()
            .wait()
            .unwrap();
        for (k, expected) in [3, 4, 5].into_iter().enumerate() {
            let view = EventView::new(&schema, &back[k * es..(k + 1) * es]).unwrap();
            assert_eq!(view.attribute(0), Some(AttrValue::Int(expected)));
        }
    }
}
