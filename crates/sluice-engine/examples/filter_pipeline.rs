//! Filter + sliding-window chain over a synthetic trade stream.
//!
//! Run with `cargo run --example filter_pipeline`.

use std::sync::Arc;

use sluice_core::filter::{Filter, FilterProgram, Instr};
use sluice_core::schema::{AttrValue, AttributeType, EventKind, EventSchema, EventView};
use sluice_core::schema::EventWriter;
use sluice_core::sink::MemorySink;
use sluice_cpu::CpuDevice;
use sluice_engine::{FilterProcessor, LengthWindowProcessor, StreamPipeline};

fn main() -> sluice_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let schema = EventSchema::builder("trades")
        .attribute("volume", AttributeType::Int)
        .build()?;

    // volume % 2 == 0
    let even_volume = FilterProgram::new(vec![
        Instr::PushAttr(0),
        Instr::PushInt(2),
        Instr::Mod,
        Instr::PushInt(0),
        Instr::Eq,
    ]);

    let sink = Arc::new(MemorySink::new());
    let mut pipeline = StreamPipeline::new("trades", 0, schema.clone(), 256, sink.clone());
    pipeline.add_processor(Box::new(FilterProcessor::new(vec![Filter::new(
        1,
        even_volume,
    )])))?;
    pipeline.add_processor(Box::new(LengthWindowProcessor::new(3)))?;
    pipeline.initialize(Arc::new(CpuDevice::new()), 1024)?;

    let volumes: Vec<i32> = (1..=10).collect();
    let es = schema.event_size();
    let mut batch = vec![0u8; volumes.len() * es];
    for (i, &volume) in volumes.iter().enumerate() {
        EventWriter::new(&schema, &mut batch[i * es..(i + 1) * es])?
            .header(0, i as i64, EventKind::Current)
            .attribute(0, AttrValue::Int(volume))?;
    }

    pipeline.write_events(&batch, volumes.len())?;
    let survivors = pipeline.process(volumes.len())?;

    println!("input volumes: {volumes:?}");
    println!("window of 3 over even volumes -> {survivors} events:");
    let events = pipeline.result_events()?;
    for k in 0..survivors {
        let view = EventView::new(&schema, &events[k * es..(k + 1) * es])?;
        println!("  slot {k}: {:?}", view.attribute(0));
    }

    println!("\ndiagnostic trace:");
    for line in sink.lines() {
        println!("  {line}");
    }
    Ok(())
}
