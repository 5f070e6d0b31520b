// Ultrasonic sensor bench check: wiring, single reading, continuous ranging
//
// Usage: sonar-probe [--config settings.json] [--simulate] <single|continuous|lines>

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rover_interlock::config::{Settings, SonarConfig};
use rover_interlock::hal::{Hardware, Line, SimHardware, SysfsHardware};
use rover_interlock::sonar::{DistanceSample, EchoSensor, Hcsr04};
use tracing_subscriber::EnvFilter;

/// Readings up to this multiple of the threshold are flagged for attention
const ATTENTION_FACTOR: f64 = 1.5;

#[derive(Parser, Debug)]
#[command(version, about = "HC-SR04 bench check")]
struct Args {
    /// JSON settings file; only the sonar section is used
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use simulated lines with an echo at this distance (cm)
    #[arg(long, global = true)]
    simulate: Option<f64>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Take one reading
    Single,
    /// Range continuously until Ctrl+C, then print statistics
    Continuous {
        /// Milliseconds between readings
        #[arg(long, default_value_t = 200)]
        interval_ms: u64,
        /// Stop after this many readings
        #[arg(long)]
        count: Option<u64>,
    },
    /// Pulse the trigger line and read the echo line level
    Lines,
}

#[derive(Debug, Default)]
struct Stats {
    readings: u64,
    obstacles: u64,
    timeouts: u64,
    min: Option<f64>,
    max: Option<f64>,
}

impl Stats {
    fn record(&mut self, sample: DistanceSample, threshold: f64) -> &'static str {
        self.readings += 1;
        let Some(distance) = sample.distance() else {
            self.timeouts += 1;
            return "TIMEOUT";
        };

        self.min = Some(self.min.map_or(distance, |m| m.min(distance)));
        self.max = Some(self.max.map_or(distance, |m| m.max(distance)));
        if distance <= threshold {
            self.obstacles += 1;
            "OBSTACLE"
        } else if distance <= threshold * ATTENTION_FACTOR {
            "attention"
        } else {
            "ok"
        }
    }

    fn print(&self) {
        println!();
        println!("Readings:  {}", self.readings);
        println!("Obstacles: {}", self.obstacles);
        println!("Timeouts:  {}", self.timeouts);
        if self.readings > 0 {
            println!(
                "Timeout rate: {:.1}%",
                self.timeouts as f64 / self.readings as f64 * 100.0
            );
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            println!("Range: {:.2} .. {:.2} cm", min, max);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();
    let sonar = match &args.config {
        Some(path) => Settings::load(path)?.sonar,
        None => SonarConfig::default(),
    };

    let hardware: Arc<dyn Hardware> = match args.simulate {
        Some(distance) => {
            let sim = SimHardware::new();
            sim.link_echo(sonar.trig_pin, sonar.echo_pin);
            sim.set_distance(Some(distance));
            Arc::new(sim)
        }
        None => Arc::new(SysfsHardware::new(Settings::default().pwm_period_ns)),
    };

    println!("HC-SR04 bench check");
    println!("TRIG: GPIO{}  ECHO: GPIO{}  threshold: {} cm", sonar.trig_pin, sonar.echo_pin, sonar.threshold_cm);
    println!();

    let result = match args.mode {
        Mode::Single => single(hardware.as_ref(), &sonar),
        Mode::Continuous { interval_ms, count } => {
            continuous(hardware.as_ref(), &sonar, Duration::from_millis(interval_ms), count).await
        }
        Mode::Lines => lines(hardware.as_ref(), &sonar),
    };

    hardware.release(Line::Gpio(sonar.trig_pin));
    hardware.release(Line::Gpio(sonar.echo_pin));
    println!("Lines released");

    result
}

fn open(hardware: &dyn Hardware, sonar: &SonarConfig) -> Result<Hcsr04, Box<dyn std::error::Error + Send + Sync>> {
    match Hcsr04::new(hardware, sonar.trig_pin, sonar.echo_pin, sonar.echo_timeout()) {
        Ok(sensor) => Ok(sensor),
        Err(e) => {
            println!("  ✗ Failed to claim sensor lines: {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - Check the pin numbers in the config");
            println!("  - Another process may hold the lines (is the runtime running?)");
            println!("  - Writing to /sys/class/gpio usually needs the gpio group or root");
            Err(e.into())
        }
    }
}

fn single(hardware: &dyn Hardware, sonar: &SonarConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut sensor = open(hardware, sonar)?;

    match sensor.try_measure()? {
        DistanceSample::Distance(distance) => {
            println!("  ✓ Distance: {} cm", distance);
            if distance <= sonar.threshold_cm {
                println!("  ⚠ Obstacle within {} cm", sonar.threshold_cm);
            }
        }
        DistanceSample::Timeout => {
            println!("  ✗ No echo within {} ms", sonar.echo_timeout_ms);
            println!("    Check the wiring and that nothing is pressed against the sensor");
        }
    }
    Ok(())
}

async fn continuous(
    hardware: &dyn Hardware,
    sonar: &SonarConfig,
    interval: Duration,
    count: Option<u64>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut sensor = open(hardware, sonar)?;
    let mut stats = Stats::default();
    let mut ticker = tokio::time::interval(interval);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    println!("Ranging every {} ms, Ctrl+C to stop", interval.as_millis());
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sample = sensor.measure();
                let verdict = stats.record(sample, sonar.threshold_cm);
                match sample.distance() {
                    Some(distance) => println!("[{:04}] {:7.2} cm  {}", stats.readings, distance, verdict),
                    None => println!("[{:04}]      --     {}", stats.readings, verdict),
                }
                if count.is_some_and(|limit| stats.readings >= limit) {
                    break;
                }
            }
            _ = &mut shutdown => break,
        }
    }

    stats.print();
    Ok(())
}

fn lines(hardware: &dyn Hardware, sonar: &SonarConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    println!("Step 1: Trigger line...");
    let mut trigger = hardware.output(sonar.trig_pin)?;
    trigger.set_high()?;
    std::thread::sleep(Duration::from_millis(100));
    trigger.set_low()?;
    println!("  ✓ GPIO{} (TRIG) toggled as output", sonar.trig_pin);

    println!("Step 2: Echo line...");
    let mut echo = hardware.input(sonar.echo_pin)?;
    let level = if echo.is_high()? { "HIGH" } else { "LOW" };
    println!("  ✓ GPIO{} (ECHO) reads {}", sonar.echo_pin, level);
    if level == "HIGH" {
        println!("  ⚠ Echo idles low on a healthy sensor");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let mut stats = Stats::default();
        assert_eq!(stats.record(DistanceSample::Distance(12.0), 20.0), "OBSTACLE");
        assert_eq!(stats.record(DistanceSample::Distance(20.0), 20.0), "OBSTACLE");
        assert_eq!(stats.record(DistanceSample::Distance(29.5), 20.0), "attention");
        assert_eq!(stats.record(DistanceSample::Distance(80.0), 20.0), "ok");
        assert_eq!(stats.record(DistanceSample::Timeout, 20.0), "TIMEOUT");

        assert_eq!(stats.readings, 5);
        assert_eq!(stats.obstacles, 2);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.min, Some(12.0));
        assert_eq!(stats.max, Some(80.0));
    }
}
