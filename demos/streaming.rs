// Streaming capture example
//
// Streams from the simulated device into a small ring of buffers, printing
// progress as buffers fill, and optionally abandons the run early.

use std::io::{self, Write};
use std::time::Duration;

use clap::Parser;
use scope_acquire::{
    AcquisitionConfig, AcquisitionController, Channel, ChannelConfig, ErrorCategory, PollControl,
    SimulatedScope, StreamingRequest, TimeUnit,
};

#[derive(Parser)]
#[command(name = "streaming")]
#[command(version = "1.0")]
#[command(about = "Stream samples into a ring of buffers")]
struct Args {
    #[arg(long, default_value_t = 10_000, help = "Samples per buffer")]
    buffer_size: usize,

    #[arg(long, default_value_t = 20, help = "Buffers to fill before stopping")]
    buffers: u32,

    #[arg(long, default_value_t = 2, help = "Buffers cycled per channel")]
    ring_slots: u32,

    #[arg(long, default_value_t = 1, help = "Sample interval in microseconds")]
    interval_us: u32,

    #[arg(long, default_value_t = 3, help = "Simulated device only has data every Nth poll")]
    ready_every: u32,

    #[arg(long, help = "Abandon the run after this many buffers")]
    abandon_after: Option<u32>,

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

    println!("Streaming Capture Example");
    println!("=========================\n");

    let driver = SimulatedScope::new().streaming(args.buffer_size / 4, args.ready_every);
    let probe = driver.probe();
    let mut controller = AcquisitionController::new(driver);

    let config = AcquisitionConfig::new().channel(ChannelConfig::on(Channel::A));
    let request = StreamingRequest::new(args.interval_us, TimeUnit::Microseconds, args.buffer_size)
        .max_buffers(args.buffers)
        .ring_slots(args.ring_slots)
        .poll_interval(Duration::from_millis(1));

    let result = controller.run_streaming_capture_with(&config, &request, |progress| {
        print!(
            "\r{:>3}/{} buffers, {:>10} samples",
            progress.buffers_filled, args.buffers, progress.total_samples
        );
        let _ = io::stdout().flush();
        match args.abandon_after {
            Some(limit) if progress.buffers_filled >= limit => PollControl::Abandon,
            _ => PollControl::Continue,
        }
    });
    println!();

    match result {
        Ok(dataset) => {
            let elapsed = dataset.time().last().copied().unwrap_or_default();
            println!(
                "Streamed {} samples covering {:.3} ms",
                dataset.len(),
                elapsed * 1e3
            );
        }
        Err(e) if e.category() == ErrorCategory::Cancelled => {
            println!("Run abandoned; device closed: {}", !probe.is_open());
        }
        Err(e) => return Err(e.into()),
    }
    println!("Samples dropped by the device: {}", probe.dropped_samples());

    Ok(())
}
