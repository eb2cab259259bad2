// Block capture example
//
// Captures one triggered block from the simulated device, scales it to
// millivolts and prints a summary computed with polars.

use clap::Parser;
use polars::prelude::*;
use scope_acquire::{
    AcquisitionConfig, AcquisitionController, BlockRequest, Channel, ChannelConfig, DownSampleMode,
    DownSampling, SimulatedScope, TriggerConfig, VoltageRange,
};

#[derive(Parser)]
#[command(name = "block_capture")]
#[command(version = "1.0")]
#[command(about = "Capture a single triggered block")]
struct Args {
    /// Channels to enable
    #[arg(short, long, default_values_t = [Channel::A], num_args = 1..)]
    channels: Vec<Channel>,

    #[arg(short, long, default_value_t = 10, help = "ADC resolution in bits (8, 10 or 12)")]
    resolution: u8,

    #[arg(long, default_value_t = 5000, help = "Symmetric input range in millivolts")]
    range_mv: i64,

    #[arg(long, default_value_t = 1000.0, help = "Rising-edge trigger threshold on the first channel, in millivolts")]
    threshold_mv: f64,

    #[arg(long, default_value_t = 1_000)]
    pre_trigger: u64,

    #[arg(long, default_value_t = 9_000)]
    post_trigger: u64,

    #[arg(long, default_value_t = 1, help = "Average every N samples")]
    ratio: u32,

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

    println!("Block Capture Example");
    println!("=====================\n");

    let range = VoltageRange::symmetric_mv(args.range_mv);
    let mut config = AcquisitionConfig::new().resolution_bits(args.resolution);
    for &channel in &args.channels {
        config = config.channel(ChannelConfig::on(channel).range(range));
    }
    if let Some(&source) = args.channels.first() {
        config =
            config.trigger(TriggerConfig::start_capturing_when(source, args.threshold_mv).rising_edge());
    }

    let mut request = BlockRequest::new(args.pre_trigger, args.post_trigger);
    if args.ratio > 1 {
        request = request.downsampling(DownSampling::new(args.ratio, DownSampleMode::Average));
    }

    let mut controller = AcquisitionController::new(SimulatedScope::new());
    let dataset = controller.run_block_capture(&config, &request)?;

    println!(
        "Captured {} samples at {} ({:.3} ns per sample), {} before the trigger",
        dataset.len(),
        dataset.resolution(),
        dataset.sample_interval_s() * 1e9,
        dataset.pre_trigger_samples()
    );
    if dataset.is_overflowed() {
        println!("Over-range on: {:?}", dataset.overflowed_channels());
    }

    let df = dataset.to_dataframe()?;
    let stats: Vec<Expr> = args
        .channels
        .iter()
        .flat_map(|channel| {
            let name = channel.as_str();
            [
                col(name).min().alias(format!("{name} min")),
                col(name).max().alias(format!("{name} max")),
                col(name).mean().alias(format!("{name} mean")),
            ]
        })
        .collect();
    let summary = df.lazy().select(stats).collect()?;
    println!("\n{summary}");

    Ok(())
}
