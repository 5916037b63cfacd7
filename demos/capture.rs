// Oscilloscope capture example
//
// Captures a burst of samples on up to four analog inputs of a PSLab and
// prints a summary of every channel.

use clap::Parser;
use pslab_rs::{AnalogTrigger, CaptureParameters, PslabConnector};

#[derive(Parser)]
#[command(name = "capture")]
#[command(version = "1.0")]
#[command(about = "Capture analog samples from a PSLab")]
struct Args {
    /// Serial port the PSLab is attached to
    port: String,

    /// Serial parameters, e.g. 1000000/8n1
    #[arg(long)]
    serialcomm: Option<String>,

    /// Channels to capture, sampled in this order
    #[arg(short, long, value_delimiter = ',', default_value = "CH1")]
    channels: Vec<String>,

    /// Samples per channel
    #[arg(short = 'n', long, default_value_t = 1000)]
    samples: u16,

    /// Samples per second per channel
    #[arg(short, long, default_value_t = 100_000.0)]
    samplerate: f64,

    /// Gain for CH1 and CH2
    #[arg(short, long)]
    gain: Option<u8>,

    /// Wait until this channel rises through --level before capturing
    #[arg(short, long)]
    trigger: Option<String>,

    /// Trigger level in volts
    #[arg(short, long, default_value_t = 0.0)]
    level: f64,

    /// Enable verbose logging
    #[arg(short, long)]
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

    let mut pslab = PslabConnector::connect(&args.port, args.serialcomm.as_deref())?;
    println!("✓ Connected to {} on {}", pslab.version(), args.port);

    if let Some(gain) = args.gain {
        for name in args.channels.iter().filter(|c| *c == "CH1" || *c == "CH2") {
            pslab.set_gain(name, gain)?;
        }
    }

    let names: Vec<&str> = args.channels.iter().map(String::as_str).collect();
    let mut params =
        CaptureParameters::by_name(pslab.channels(), &names, args.samples, args.samplerate)?;
    if let Some(trigger) = &args.trigger {
        let trigger = AnalogTrigger::start_capturing_when(trigger)
            .rises_through(args.level)
            .into_trigger(pslab.channels())?;
        params = params.with_trigger(trigger);
    }

    let started = std::time::Instant::now();
    let (_pslab, reading) = pslab
        .start_capture(params)
        .map_err(|(_, e)| e)?
        .wait()
        .map_err(|(_, e)| e)?;
    println!(
        "Captured in {:.1} ms at {:.0} samples/s",
        started.elapsed().as_secs_f64() * 1000.0,
        reading.effective_samplerate
    );

    for frame in &reading.frames {
        let min = frame.samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = frame.samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = frame.samples.iter().sum::<f64>() / frame.samples.len().max(1) as f64;
        println!(
            "{:>4}: {} samples | min {:.3}V | max {:.3}V | mean {:.3}V",
            frame.name,
            frame.samples.len(),
            min,
            max,
            mean
        );
    }

    let df = reading.to_dataframe()?;
    println!("{}", df.head(Some(5)));
    Ok(())
}
