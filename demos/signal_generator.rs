// Signal generator example
//
// Programs the built-in function generator of the simulated device, either
// at a fixed frequency or as a frequency sweep.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use scope_acquire::signal_generator::{self, SweepType};
use scope_acquire::{DeviceHandle, SignalGeneratorConfig, SimulatedScope, Waveform};

#[derive(Clone, Copy, ValueEnum)]
enum Shape {
    Sine,
    Square,
    Triangle,
    RampUp,
    RampDown,
    Dc,
}

impl From<Shape> for Waveform {
    fn from(shape: Shape) -> Self {
        match shape {
            Shape::Sine => Waveform::Sine,
            Shape::Square => Waveform::Square,
            Shape::Triangle => Waveform::Triangle,
            Shape::RampUp => Waveform::RampUp,
            Shape::RampDown => Waveform::RampDown,
            Shape::Dc => Waveform::DcVoltage,
        }
    }
}

#[derive(Parser)]
#[command(name = "signal_generator")]
#[command(version = "1.0")]
#[command(about = "Program the built-in signal generator")]
struct Args {
    #[arg(short, long, value_enum, default_value_t = Shape::Sine)]
    waveform: Shape,

    #[arg(short, long, default_value_t = 1000.0, help = "Frequency in Hz (sweep start)")]
    frequency: f64,

    #[arg(long, default_value_t = 2000, help = "Peak-to-peak amplitude in millivolts")]
    amplitude_mv: u32,

    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    offset_mv: i32,

    #[arg(long, help = "Sweep up to this frequency in Hz")]
    sweep_to: Option<f64>,

    #[arg(long, default_value_t = 100.0, help = "Sweep step in Hz")]
    increment: f64,

    #[arg(long, default_value_t = 10, help = "Time per sweep step in milliseconds")]
    dwell_ms: u64,

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

    println!("Signal Generator Example");
    println!("========================\n");

    let mut config = SignalGeneratorConfig::new(args.waveform.into(), args.frequency)
        .amplitude_mv(args.amplitude_mv)
        .offset_mv(args.offset_mv);
    if let Some(stop) = args.sweep_to {
        config = config.sweep_to(
            stop,
            args.increment,
            Duration::from_millis(args.dwell_ms),
            SweepType::UpDown,
        );
    }

    let mut driver = SimulatedScope::new();
    let probe = driver.probe();
    let mut device = DeviceHandle::open(&mut driver, None)?;
    signal_generator::apply(&mut device, &config)?;

    if let Some(output) = probe.sig_gen() {
        println!(
            "Output: {} {} mVpp, offset {} mV",
            output.waveform.as_str(),
            output.amplitude_mv,
            output.offset_mv
        );
        if output.stop_hz > output.start_hz {
            println!(
                "Sweeping {} Hz -> {} Hz in {} Hz steps every {:?}",
                output.start_hz, output.stop_hz, output.increment_hz, output.dwell
            );
        } else {
            println!("Fixed at {} Hz", output.start_hz);
        }
    }

    device.close()?;
    Ok(())
}
