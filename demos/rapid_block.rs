// Rapid-block capture example
//
// Splits device memory into segments, captures one trigger per segment in
// quick succession and reports each segment separately.

use clap::Parser;
use polars::prelude::*;
use scope_acquire::{
    AcquisitionConfig, AcquisitionController, Channel, ChannelConfig, RapidBlockRequest,
    SimulatedScope, TriggerConfig,
};

#[derive(Parser)]
#[command(name = "rapid_block")]
#[command(version = "1.0")]
#[command(about = "Capture several triggered segments in rapid succession")]
struct Args {
    #[arg(short, long, default_value_t = 10, help = "Number of memory segments to capture")]
    segments: u32,

    #[arg(long, default_value_t = 200)]
    pre_trigger: u64,

    #[arg(long, default_value_t = 800)]
    post_trigger: u64,

    #[arg(long, help = "Segment the simulated device reports as over-range")]
    overflow_segment: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    println!("Rapid-Block Capture Example");
    println!("===========================\n");

    let mut driver = SimulatedScope::new();
    if let Some(segment) = args.overflow_segment {
        driver = driver.overflow_on_segment(segment);
    }
    let mut controller = AcquisitionController::new(driver);

    let config = AcquisitionConfig::new()
        .channel(ChannelConfig::on(Channel::A))
        .channel(ChannelConfig::on(Channel::B))
        .trigger(TriggerConfig::start_capturing_when(Channel::A, 0.0).rising_edge());
    let request = RapidBlockRequest::new(args.pre_trigger, args.post_trigger, args.segments);

    let datasets = controller.run_rapid_block_capture(&config, &request)?;
    println!("Captured {} segments\n", datasets.len());

    for dataset in &datasets {
        let peaks = dataset
            .to_dataframe()?
            .lazy()
            .select([
                col("A").max().alias("A max"),
                col("B").max().alias("B max"),
            ])
            .collect()?;
        let a = peaks.column("A max")?.f64()?.get(0).unwrap_or_default();
        let b = peaks.column("B max")?.f64()?.get(0).unwrap_or_default();
        println!(
            "  segment {:>3}: {} samples, max A {:8.2} mV, max B {:8.2} mV{}",
            dataset.segment(),
            dataset.len(),
            a,
            b,
            if dataset.is_overflowed() { "  [over-range]" } else { "" }
        );
    }

    Ok(())
}
