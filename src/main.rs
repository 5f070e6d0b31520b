use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rover_interlock::config::Settings;
use rover_interlock::hal::{Hardware, SimHardware, SysfsHardware};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Rover control runtime: two motors behind an ultrasonic obstacle interlock
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON settings file (defaults are used when absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run against simulated GPIO/PWM instead of sysfs
    #[arg(long)]
    simulate: bool,

    /// Distance the simulated sensor reports, in cm (no echo when absent)
    #[arg(long, requires = "simulate")]
    sim_distance: Option<f64>,

    /// Zenoh endpoint to listen on, replaces the configured list (repeatable)
    #[arg(long)]
    listen: Vec<String>,

    /// Zenoh endpoint to connect to, replaces the configured list (repeatable)
    #[arg(long)]
    connect: Vec<String>,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => match Settings::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Config error ({}): {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => Settings::default(),
    };
    if !args.listen.is_empty() {
        settings.network.listen = args.listen.clone();
    }
    if !args.connect.is_empty() {
        settings.network.connect = args.connect.clone();
    }

    let hardware: Arc<dyn Hardware> = if args.simulate {
        warn!("Simulated hardware: nothing will move");
        let sim = SimHardware::new();
        sim.link_echo(settings.sonar.trig_pin, settings.sonar.echo_pin);
        sim.set_distance(args.sim_distance);
        Arc::new(sim)
    } else {
        info!("Using sysfs GPIO/PWM");
        Arc::new(SysfsHardware::new(settings.pwm_period_ns))
    };

    if let Err(e) = rover_interlock::runtime::run(settings, hardware).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
