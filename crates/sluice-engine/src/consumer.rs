//! Top-level event consumer.
//!
//! The consumer is the entry point the host-runtime bridge talks to: it
//! owns one filter kernel (single- or multi-filter topology, fixed at
//! construction), the filter registry, and the mirrored input buffer,
//! and drives the copy-in → launch → copy-out cycle per batch. Matched
//! input positions are rebuilt for every batch and stay valid until the
//! next one.
//!
//! ## Byte-buffer protocol
//!
//! The bridge shares one flat byte region with four configured offsets
//! ([`ByteBufferLayout`]). Event payloads are read from
//! `event_data_offset` with a fixed stride of `event_size`;
//! after a batch the matched-count (`i32` little-endian) followed by the
//! matched positions (`i32` each) is written back at `results_offset`.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use sluice_core::device::{CopyMode, Device};
use sluice_core::error::{Result, SluiceError};
use sluice_core::filter::{Filter, FilterTableHandle};
use sluice_core::schema::EventSchema;
use sluice_core::sink::SharedSink;

use crate::buffer::StreamEventBuffer;
use crate::kernel::{FilterCompactKernel, FilterIndexKernel};
use crate::stats::BatchStats;

/// Kernel topology fixed at consumer construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelTopology {
    /// One filter, one pass, sparse index output.
    SingleFilter,
    /// Filter set with prefix-sum stream compaction.
    MultiFilter,
}

/// Offsets interpreting the flat byte buffer shared with the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteBufferLayout {
    /// Offset where matched positions are written back.
    pub results_offset: usize,
    /// Offset of per-event metadata, when a kernel variant uses it.
    pub event_meta_offset: usize,
    /// Offset where raw event payloads begin.
    pub event_data_offset: usize,
    /// Stride in bytes between consecutive events.
    pub event_size: usize,
}

enum ConsumerKernel {
    Index(FilterIndexKernel),
    Compact(FilterCompactKernel),
}

/// Receives raw event batches and exposes the matched-position list.
pub struct EventConsumer {
    name: String,
    topology: KernelTopology,
    max_buffer_size: usize,
    events_per_block: u32,
    schema: Arc<EventSchema>,
    sink: SharedSink,
    filters: BTreeMap<u32, Filter>,
    table: Option<FilterTableHandle>,
    device: Option<Arc<dyn Device>>,
    input: Option<StreamEventBuffer>,
    kernel: Option<ConsumerKernel>,
    results: Vec<u32>,
    byte_buffer: Option<Vec<u8>>,
    layout: Option<ByteBufferLayout>,
}

impl EventConsumer {
    /// Build a consumer for one stream.
    ///
    /// `max_buffer_size` is the largest accepted batch in events;
    /// `events_per_block` sets the kernel launch geometry.
    pub fn new(
        name: impl Into<String>,
        schema: Arc<EventSchema>,
        topology: KernelTopology,
        max_buffer_size: usize,
        events_per_block: u32,
        sink: SharedSink,
    ) -> Self {
        let name = name.into();
        sink.append(&format!(
            "EventConsumer '{name}' created for {topology:?}: MaxBufferSize=[{max_buffer_size} events]"
        ));
        Self {
            name,
            topology,
            max_buffer_size,
            events_per_block,
            schema,
            sink,
            filters: BTreeMap::new(),
            table: None,
            device: None,
            input: None,
            kernel: None,
            results: Vec::new(),
            byte_buffer: None,
            layout: None,
        }
    }

    /// Consumer name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Largest accepted batch in events.
    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// Allocate the kernel and its device buffers.
    pub fn initialize(&mut self, device: Arc<dyn Device>) -> Result<()> {
        let input = StreamEventBuffer::create(
            format!("{} input", self.name),
            self.schema.clone(),
            device.clone(),
            self.max_buffer_size,
        )?;
        let kernel = match self.topology {
            KernelTopology::SingleFilter => ConsumerKernel::Index(FilterIndexKernel::new(
                device.clone(),
                self.schema.clone(),
                input.region(),
                self.max_buffer_size,
                self.events_per_block,
            )?),
            KernelTopology::MultiFilter => ConsumerKernel::Compact(FilterCompactKernel::new(
                device.clone(),
                self.schema.clone(),
                input.region(),
                self.max_buffer_size,
                self.events_per_block,
            )?),
        };
        info!(
            "consumer '{}' initialized on {} ({:?})",
            self.name,
            device.id(),
            self.topology
        );
        self.device = Some(device);
        self.input = Some(input);
        self.kernel = Some(kernel);
        Ok(())
    }

    /// Register a filter. First registration wins: a duplicate id is
    /// dropped silently.
    pub fn add_filter(&mut self, filter: Filter) {
        match self.filters.entry(filter.id) {
            std::collections::btree_map::Entry::Occupied(_) => {
                self.sink
                    .append(&format!("AddFilter : duplicate id {} dropped", filter.id));
            }
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(filter);
                // A new filter invalidates any uploaded table.
                self.table = None;
            }
        }
    }

    /// Number of registered filters.
    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    /// Upload the registered filters to the device, in ascending id
    /// order. Must run after the last `add_filter` and before the first
    /// batch.
    pub fn configure_filters(&mut self) -> Result<()> {
        let device = self
            .device
            .as_ref()
            .ok_or(SluiceError::NotInitialized("EventConsumer"))?;
        let filters: Vec<Filter> = self.filters.values().cloned().collect();
        let table = device.upload_filter_table(&filters)?;
        match self.kernel.as_mut() {
            Some(ConsumerKernel::Index(kernel)) => kernel.set_filter_table(table),
            Some(ConsumerKernel::Compact(kernel)) => kernel.set_filter_table(table),
            None => return Err(SluiceError::NotInitialized("EventConsumer")),
        }
        self.table = Some(table);
        self.sink.append(&format!(
            "ConfigureFilters : FilterCount={}",
            filters.len()
        ));
        Ok(())
    }

    /// Process one batch of `count` events laid out per the stream
    /// schema in `events`.
    ///
    /// The previous result set is cleared first, so a failed batch never
    /// exposes stale or partially written positions. Any transient
    /// per-event decode allocations are released before returning,
    /// whatever the outcome.
    pub fn on_events(&mut self, events: &[u8], count: usize) -> Result<()> {
        self.results.clear();
        self.sink
            .append(&format!("OnEvents : Event batch size [{count}]"));
        if count == 0 {
            return Ok(());
        }
        if count > self.max_buffer_size {
            return Err(SluiceError::CapacityExceeded {
                requested: count,
                capacity: self.max_buffer_size,
            });
        }
        if self.table.is_none() {
            return Err(SluiceError::NotInitialized("filter table"));
        }
        let (Some(input), Some(kernel)) = (self.input.as_mut(), self.kernel.as_mut()) else {
            return Err(SluiceError::NotInitialized("EventConsumer"));
        };

        input.write_events(events, count)?;
        input.copy_to_device(count, CopyMode::Async)?.wait()?;

        let matched = match kernel {
            ConsumerKernel::Index(kernel) => {
                kernel.process(count, true)?;
                kernel.matched()
            }
            ConsumerKernel::Compact(kernel) => {
                kernel.process(count, true)?;
                kernel.matched()
            }
        };
        self.results.extend_from_slice(matched);
        debug!(
            "consumer '{}': {count} events, {} matched",
            self.name,
            self.results.len()
        );
        Ok(())
    }

    /// Matched input positions of the most recent batch, ascending.
    ///
    /// Valid only until the next [`on_events`](Self::on_events) call.
    pub fn matching_events(&self) -> &[u32] {
        &self.results
    }

    /// Accumulated kernel timing.
    pub fn stats(&self) -> BatchStats {
        match self.kernel.as_ref() {
            Some(ConsumerKernel::Index(kernel)) => *kernel.stats(),
            Some(ConsumerKernel::Compact(kernel)) => *kernel.stats(),
            None => BatchStats::default(),
        }
    }

    /// Report mean device latency per batch and per event to the sink.
    pub fn log_average_stats(&self) {
        let stats = self.stats();
        self.sink.append(&format!(
            "GPU Average Elapsed Time (Event Batch Size : {} - {:.6} ms) : {:.6} ms per event",
            self.max_buffer_size,
            stats.average_batch_ms(),
            stats.average_per_event_ms(self.max_buffer_size)
        ));
    }

    /// Allocate an owned byte buffer of `size` bytes for the bridge
    /// protocol.
    pub fn create_byte_buffer(&mut self, size: usize) {
        self.byte_buffer = Some(vec![0u8; size]);
    }

    /// Adopt a bridge-provided byte buffer.
    pub fn set_byte_buffer(&mut self, buffer: Vec<u8>) {
        self.byte_buffer = Some(buffer);
    }

    /// The current byte buffer, if any.
    pub fn byte_buffer(&self) -> Option<&[u8]> {
        self.byte_buffer.as_deref()
    }

    /// Hand the byte buffer back to the bridge.
    pub fn take_byte_buffer(&mut self) -> Option<Vec<u8>> {
        self.byte_buffer.take()
    }

    /// Configure the byte-buffer offsets. Must precede the first
    /// [`process_byte_buffer`](Self::process_byte_buffer) call.
    pub fn set_layout(&mut self, layout: ByteBufferLayout) {
        self.layout = Some(layout);
    }

    /// Process `count` events staged in the byte buffer and write the
    /// matched positions back into its results region.
    ///
    /// Returns the matched count.
    pub fn process_byte_buffer(&mut self, count: usize) -> Result<usize> {
        let layout = self
            .layout
            .ok_or(SluiceError::LayoutNotConfigured("byte buffer offsets"))?;
        if layout.event_size != self.schema.event_size() {
            return Err(SluiceError::InvalidConfig(format!(
                "layout event size {} does not match schema event size {}",
                layout.event_size,
                self.schema.event_size()
            )));
        }
        let mut buffer = self
            .byte_buffer
            .take()
            .ok_or(SluiceError::LayoutNotConfigured("byte buffer"))?;

        let data_start = layout.event_data_offset;
        let data_end = data_start + count * layout.event_size;
        let outcome = if data_end > buffer.len() {
            Err(SluiceError::TransferOverflow {
                required: data_end,
                available: buffer.len(),
            })
        } else {
            self.on_events(&buffer[data_start..data_end], count)
        };

        let outcome = outcome.and_then(|()| {
            let needed = layout.results_offset + 4 * (1 + self.results.len());
            if needed > buffer.len() {
                return Err(SluiceError::TransferOverflow {
                    required: needed,
                    available: buffer.len(),
                });
            }
            let mut at = layout.results_offset;
            buffer[at..at + 4].copy_from_slice(&(self.results.len() as i32).to_le_bytes());
            at += 4;
            for &position in &self.results {
                buffer[at..at + 4].copy_from_slice(&(position as i32).to_le_bytes());
                at += 4;
            }
            Ok(self.results.len())
        });

        self.byte_buffer = Some(buffer);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::filter::{FilterProgram, Instr};
    use sluice_core::schema::{AttrValue, AttributeType, EventKind, EventWriter};
    use sluice_core::sink::MemorySink;
    use sluice_cpu::CpuDevice;

    fn schema() -> Arc<EventSchema> {
        EventSchema::builder("s")
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

    fn even_program() -> FilterProgram {
        FilterProgram::new(vec![
            Instr::PushAttr(0),
            Instr::PushInt(2),
            Instr::Mod,
            Instr::PushInt(0),
            Instr::Eq,
        ])
    }

    fn odd_program() -> FilterProgram {
        FilterProgram::new(vec![
            Instr::PushAttr(0),
            Instr::PushInt(2),
            Instr::Mod,
            Instr::PushInt(1),
            Instr::Eq,
        ])
    }

    fn consumer(topology: KernelTopology) -> EventConsumer {
        let mut consumer = EventConsumer::new(
            "test",
            schema(),
            topology,
            16,
            4,
            Arc::new(MemorySink::new()),
        );
        consumer.initialize(Arc::new(CpuDevice::new())).unwrap();
        consumer
    }

    #[test]
    fn test_multi_filter_matched_positions() {
        let mut consumer = consumer(KernelTopology::MultiFilter);
        consumer.add_filter(Filter::new(1, even_program()));
        consumer.configure_filters().unwrap();

        let batch = encode(&schema(), &[1, 2, 3, 4, 5, 6]);
        consumer.on_events(&batch, 6).unwrap();
        assert_eq!(consumer.matching_events(), &[1, 3, 5]);
    }

    #[test]
    fn test_single_filter_matched_positions() {
        let mut consumer = consumer(KernelTopology::SingleFilter);
        consumer.add_filter(Filter::new(1, even_program()));
        consumer.configure_filters().unwrap();

        let batch = encode(&schema(), &[1, 2, 3, 4, 5, 6]);
        consumer.on_events(&batch, 6).unwrap();
        assert_eq!(consumer.matching_events(), &[1, 3, 5]);
    }

    #[test]
    fn test_duplicate_filter_id_first_wins() {
        let mut consumer = consumer(KernelTopology::MultiFilter);
        consumer.add_filter(Filter::new(7, even_program()));
        consumer.add_filter(Filter::new(7, odd_program()));
        assert_eq!(consumer.filter_count(), 1);
        consumer.configure_filters().unwrap();

        let batch = encode(&schema(), &[1, 2, 3, 4]);
        consumer.on_events(&batch, 4).unwrap();
        // The first registration (even) governs matching.
        assert_eq!(consumer.matching_events(), &[1, 3]);
    }

    #[test]
    fn test_zero_filters_match_nothing() {
        let mut consumer = consumer(KernelTopology::MultiFilter);
        consumer.configure_filters().unwrap();

        let batch = encode(&schema(), &[1, 2, 3]);
        consumer.on_events(&batch, 3).unwrap();
        assert!(consumer.matching_events().is_empty());
    }

    #[test]
    fn test_empty_batch_is_defined() {
        let mut consumer = consumer(KernelTopology::MultiFilter);
        consumer.add_filter(Filter::new(1, even_program()));
        consumer.configure_filters().unwrap();

        consumer.on_events(&[], 0).unwrap();
        assert!(consumer.matching_events().is_empty());
    }

    #[test]
    fn test_oversized_batch_rejected_and_results_cleared() {
        let mut consumer = consumer(KernelTopology::MultiFilter);
        consumer.add_filter(Filter::new(1, even_program()));
        consumer.configure_filters().unwrap();

        let batch = encode(&schema(), &[2, 4]);
        consumer.on_events(&batch, 2).unwrap();
        assert_eq!(consumer.matching_events().len(), 2);

        // A rejected batch must not expose the previous results.
        let oversized = encode(&schema(), &(0..17).collect::<Vec<i32>>());
        assert!(matches!(
            consumer.on_events(&oversized, 17),
            Err(SluiceError::CapacityExceeded { .. })
        ));
        assert!(consumer.matching_events().is_empty());
    }

    #[test]
    fn test_unconfigured_filters_rejected() {
        let mut consumer = consumer(KernelTopology::MultiFilter);
        consumer.add_filter(Filter::new(1, even_program()));
        let batch = encode(&schema(), &[2]);
        assert!(matches!(
            consumer.on_events(&batch, 1),
            Err(SluiceError::NotInitialized(_))
        ));
    }

    #[test]
    fn test_add_filter_invalidates_table() {
        let mut consumer = consumer(KernelTopology::MultiFilter);
        consumer.add_filter(Filter::new(1, even_program()));
        consumer.configure_filters().unwrap();
        consumer.add_filter(Filter::new(2, odd_program()));

        let batch = encode(&schema(), &[2]);
        assert!(matches!(
            consumer.on_events(&batch, 1),
            Err(SluiceError::NotInitialized(_))
        ));
        consumer.configure_filters().unwrap();
        consumer.on_events(&batch, 1).unwrap();
        assert_eq!(consumer.matching_events(), &[0]);
    }

    #[test]
    fn test_byte_buffer_protocol_round_trip() {
        let schema = schema();
        let es = schema.event_size();
        let mut consumer = consumer(KernelTopology::MultiFilter);
        consumer.add_filter(Filter::new(1, even_program()));
        consumer.configure_filters().unwrap();

        let results_offset = 0;
        let data_offset = 64;
        let layout = ByteBufferLayout {
            results_offset,
            event_meta_offset: 32,
            event_data_offset: data_offset,
            event_size: es,
        };
        consumer.set_layout(layout);
        consumer.create_byte_buffer(data_offset + 8 * es);

        let batch = encode(&schema, &[1, 2, 3, 4, 5, 6]);
        let mut buffer = consumer.take_byte_buffer().unwrap();
        buffer[data_offset..data_offset + batch.len()].copy_from_slice(&batch);
        consumer.set_byte_buffer(buffer);

        let matched = consumer.process_byte_buffer(6).unwrap();
        assert_eq!(matched, 3);

        let buffer = consumer.byte_buffer().unwrap();
        let count = i32::from_le_bytes(buffer[0..4].try_into().unwrap());
        assert_eq!(count, 3);
        let positions: Vec<i32> = (0..3)
            .map(|k| {
                let at = 4 + k * 4;
                i32::from_le_bytes(buffer[at..at + 4].try_into().unwrap())
            })
            .collect();
        assert_eq!(positions, vec![1, 3, 5]);
    }

    #[test]
    fn test_byte_buffer_requires_layout() {
        let mut consumer = consumer(KernelTopology::MultiFilter);
        consumer.create_byte_buffer(256);
        assert!(matches!(
            consumer.process_byte_buffer(1),
            Err(SluiceError::LayoutNotConfigured(_))
        ));
    }

    #[test]
    fn test_average_stats_logged() {
        let sink = Arc::new(MemorySink::new());
        let mut consumer = EventConsumer::new(
            "stats",
            schema(),
            KernelTopology::MultiFilter,
            16,
            4,
            sink.clone(),
        );
        consumer.initialize(Arc::new(CpuDevice::new())).unwrap();
        consumer.add_filter(Filter::new(1, even_program()));
        consumer.configure_filters().unwrap();

        let batch = encode(&schema(), &[1, 2]);
        consumer.on_events(&batch, 2).unwrap();
        consumer.log_average_stats();
        assert!(sink.contains("GPU Average Elapsed Time"));
    }
}
