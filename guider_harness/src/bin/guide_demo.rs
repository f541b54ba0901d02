use anyhow::{anyhow, Context};
use clap::Parser;
use guider::{Guider, GuiderConfig, GuiderEvent};
use guider_harness::{
    create_simulated_equipment, create_test_guider_config, create_test_sky,
    create_test_sky_with_ao, run_session, unguided_rms, SessionOptions, TestDrifts,
};
use std::path::PathBuf;

/// Command line arguments for the guiding demo
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Calibrate and guide against a simulated sky"
)]
struct Args {
    /// Drift pattern (none, linear, periodic, combined)
    #[arg(short, long, default_value = "combined")]
    drift: String,

    /// Guide frames to run after calibration
    #[arg(short, long, default_value_t = 200)]
    frames: usize,

    /// Put a simulated AO unit in the light path
    #[arg(long)]
    ao: bool,

    /// Dither every N frames
    #[arg(long)]
    dither_every: Option<usize>,

    /// Dither amount in pixels
    #[arg(long, default_value_t = 3.0)]
    dither_amount: f64,

    /// Guider configuration JSON, replacing the built-in test config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the guider configuration in use to this path and continue
    #[arg(long)]
    dump_config: Option<PathBuf>,

    /// Noise seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Print every guide step
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let drift = TestDrifts::by_name(&args.drift).ok_or_else(|| {
        anyhow!(
            "unknown drift '{}', expected one of {:?}",
            args.drift,
            TestDrifts::names()
        )
    })?;
    let sky_config = if args.ao {
        create_test_sky_with_ao(args.seed)
    } else {
        create_test_sky(args.seed)
    };
    let config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            GuiderConfig::from_json(&json)?
        }
        None => create_test_guider_config(),
    };
    if let Some(path) = &args.dump_config {
        std::fs::write(path, config.to_json()?)
            .with_context(|| format!("writing {}", path.display()))?;
    }

    println!("Guiding Demo");
    println!("============");
    println!("Drift: {}", args.drift);
    println!("Frames: {}", args.frames);
    println!("AO: {}", if args.ao { "yes" } else { "no" });

    let (equipment, sky) = create_simulated_equipment(sky_config, drift);
    let mut guider = Guider::new(equipment, config)?;
    if args.verbose {
        guider.register_callback(|event| {
            if let GuiderEvent::GuideStep(step) = event {
                println!(
                    "frame {:>4}  offset ({:+.2}, {:+.2})  {:?} {}  {:?} {}",
                    step.frame_number,
                    step.camera_offset.0,
                    step.camera_offset.1,
                    step.axis1.direction,
                    step.axis1.amount,
                    step.axis2.direction,
                    step.axis2.amount
                );
            }
        });
    }

    let options = SessionOptions {
        calibrate: true,
        frames: args.frames,
        dither_every: args.dither_every,
        dither_amount: args.dither_amount,
    };
    let results = run_session(&mut guider, &sky, &options)?;

    println!();
    println!("{}", guider.settings_summary());
    println!();
    println!("Results");
    println!("-------");
    println!("Frames guided: {}", results.frames_guided);
    println!("Frames lost: {}", results.frames_lost);
    println!("Calibration advisories: {}", results.advisories());
    println!(
        "Guider RMS: RA {:.3} px, Dec {:.3} px, total {:.3} px",
        results.stats.ra_rms, results.stats.dec_rms, results.stats.total_rms
    );
    println!("True RMS with guiding: {:.3} px", results.true_rms());
    println!(
        "True RMS without guiding: {:.3} px",
        unguided_rms(&sky, results.frames_guided)
    );
    if args.ao {
        println!("Largest AO excursion: {} steps", results.max_ao_excursion);
    }
    for error in &results.errors {
        println!("  {error}");
    }

    guider.disconnect()?;
    Ok(())
}
