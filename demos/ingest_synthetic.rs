//! Example: Ingest a synthetic 3D survey with missing traces and read it back
//!
//! Run with: cargo run --example ingest_synthetic
//! Set RUST_LOG=vds_ingest=debug for per-chunk logs.

use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vds_ingest::{
    CodecSpec, CompressionMethod, IngestConfig, Ingestor, MemoryRecordSource, Record,
    SampleAxis, SampleBuffer, VolumeReader,
};

const INLINES: i64 = 120;
const CROSSLINES: i64 = 90;
const SAMPLES: usize = 500;

/// A dipping reflector with a gap in the acquisition
fn synthetic_survey() -> Vec<Record> {
    let mut records = Vec::new();
    for il in 0..INLINES {
        for xl in 0..CROSSLINES {
            // Platform exclusion zone
            if (40..55).contains(&il) && (30..50).contains(&xl) {
                continue;
            }
            let reflector = 150.0 + il as f32 * 0.8 + xl as f32 * 0.4;
            let samples: Vec<f32> = (0..SAMPLES)
                .map(|s| {
                    let t = s as f32 - reflector;
                    (1.0 - 2.0 * (t / 6.0).powi(2)) * (-(t / 6.0).powi(2)).exp()
                })
                .collect();
            let offset = ((il * CROSSLINES + xl) as u64) * (240 + SAMPLES as u64 * 4);
            records.push(Record::new(
                offset,
                [("inline", 1000 + il), ("crossline", 2000 + xl)],
                SampleBuffer::from_samples(&samples),
            ));
        }
    }
    records
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("Synthetic survey ingestion");
    println!("==========================\n");

    let records = synthetic_survey();
    println!(
        "Source: {} traces over {} x {} positions, {} samples each",
        records.len(),
        INLINES,
        CROSSLINES,
        SAMPLES
    );

    let temp_dir = tempfile::tempdir()?;
    let store_path = temp_dir.path().join("survey");
    let url = format!("file://{}", store_path.display());
    println!("Store: {}\n", store_path.display());

    let config = IngestConfig::new(url.clone())
        .with_axes(["inline", "crossline"])
        .with_sample_axis(SampleAxis::new("time", "ms", 0, 0.0, 4.0))
        .with_chunk_shape(vec![32, 32])
        .with_sample_chunk(128)
        .with_codec(CodecSpec::lossless(CompressionMethod::Zstd))
        .with_attribute("survey", "Synthetic 3D")
        .with_attribute("acquisition_year", "2024");

    let summary = Ingestor::new(config)
        .await?
        .run(Arc::new(MemoryRecordSource::new(records)))
        .await?;

    println!("Ingestion report:");
    println!("  {}", summary.descriptor.summary());
    println!("  Chunks written:    {}", summary.report.chunks_written);
    println!(
        "  Stored:            {} ({:.2}x compression)",
        vds_ingest::utils::format_bytes(summary.report.stored_bytes),
        summary.report.compression_ratio()
    );
    let stats = &summary.descriptor.statistics;
    println!(
        "  Amplitude:         min {:.3}, max {:.3}, rms {:.3}",
        stats.min.unwrap_or_default(),
        stats.max.unwrap_or_default(),
        stats.rms.unwrap_or_default()
    );
    println!();

    let reader = VolumeReader::open_url(&url).await?;
    println!("Reader: {}", reader.get_stats()?.summary());

    let inside_gap = reader.read_trace(&[45, 40]).await?;
    println!("  Trace (45, 40) in the gap: {}", if inside_gap.is_some() { "live" } else { "absent" });

    if let Some(trace) = reader.read_trace(&[10, 10]).await? {
        let values = trace.to_vec::<f32>()?;
        let peak = values
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
        let axis = &reader.descriptor().sample_axis;
        println!(
            "  Trace (10, 10) peaks at sample {} ({:.0} {})",
            peak.0,
            axis.index_to_coord(peak.0),
            axis.unit
        );
    }

    let volume = reader.read_volume_f64().await?;
    println!("  Full volume shape: {:?}", volume.shape());

    Ok(())
}
