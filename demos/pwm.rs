// Square-wave generator example
//
// Drives SQ1..SQ4 with a common frequency and per-output duty cycle and
// phase, or sets them to static levels.

use clap::Parser;
use pslab_rs::{PslabConnector, PwmSettings};

const OUTPUTS: [&str; 4] = ["SQ1", "SQ2", "SQ3", "SQ4"];

#[derive(Parser)]
#[command(name = "pwm")]
#[command(version = "1.0")]
#[command(about = "Generate square waves on a PSLab")]
struct Args {
    /// Serial port the PSLab is attached to
    port: String,

    /// Serial parameters, e.g. 1000000/8n1
    #[arg(long)]
    serialcomm: Option<String>,

    /// Output frequency in Hz
    #[arg(short, long, default_value_t = 1000.0)]
    frequency: f64,

    /// Duty cycle in percent for SQ1..SQ4
    #[arg(short, long, value_delimiter = ',', default_value = "50,50,50,50")]
    duty: Vec<f64>,

    /// Phase in degrees for SQ1..SQ4, relative to SQ1
    #[arg(short, long, value_delimiter = ',', default_value = "0,0,0,0")]
    phase: Vec<f64>,

    /// Outputs to drive high instead of generating a waveform
    #[arg(long, value_delimiter = ',')]
    high: Vec<String>,

    /// Outputs to drive low instead of generating a waveform
    #[arg(long, value_delimiter = ',')]
    low: Vec<String>,

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

    if !args.high.is_empty() || !args.low.is_empty() {
        let states: Vec<(&str, bool)> = args
            .high
            .iter()
            .map(|name| (name.as_str(), true))
            .chain(args.low.iter().map(|name| (name.as_str(), false)))
            .collect();
        let byte = pslab.set_digital_state(&states)?;
        println!("Digital state set to {:#04x}", byte);
        return Ok(());
    }

    let mut settings = PwmSettings::new();
    settings.set_frequency(args.frequency)?;
    for (name, duty) in OUTPUTS.iter().zip(&args.duty) {
        settings.set_duty_cycle(pslab.channels(), name, *duty)?;
    }
    for (name, phase) in OUTPUTS.iter().zip(&args.phase) {
        settings.set_phase(pslab.channels(), name, *phase)?;
    }

    let plan = pslab.generate_pwm(&settings)?;
    println!(
        "Generating {} Hz: wavelength {} ticks, prescaler {}",
        plan.frequency, plan.wavelength, plan.prescaler
    );
    for (i, name) in OUTPUTS.iter().enumerate() {
        println!(
            "{}: duty {} ticks, phase {} ticks",
            name, plan.duty[i], plan.phase[i]
        );
    }
    Ok(())
}
