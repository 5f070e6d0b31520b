// Linux sysfs backend
//
// GPIO: /sys/class/gpio/{export,unexport,gpioN/direction,gpioN/value}
// PWM:  /sys/class/pwm/pwmchipC/{export,unexport,pwmM/period,pwmM/duty_cycle,pwmM/enable}

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::sleep;
use std::time::Duration;

use tracing::{debug, warn};

use super::{HalError, Hardware, InputPin, Line, OutputPin, PwmOutput, Result};

const GPIO_ROOT: &str = "/sys/class/gpio";
const PWM_ROOT: &str = "/sys/class/pwm";

/// udev needs a moment to fix permissions on freshly exported nodes
const EXPORT_SETTLE: Duration = Duration::from_millis(50);

pub struct SysfsHardware {
    gpio_root: PathBuf,
    pwm_root: PathBuf,
    pwm_period_ns: u64,
    claimed: Mutex<HashSet<Line>>,
}

impl SysfsHardware {
    pub fn new(pwm_period_ns: u64) -> Self {
        Self::with_roots(GPIO_ROOT, PWM_ROOT, pwm_period_ns)
    }

    /// Use alternate sysfs roots (e.g. a bind-mounted tree in a container)
    pub fn with_roots(
        gpio_root: impl Into<PathBuf>,
        pwm_root: impl Into<PathBuf>,
        pwm_period_ns: u64,
    ) -> Self {
        Self {
            gpio_root: gpio_root.into(),
            pwm_root: pwm_root.into(),
            pwm_period_ns,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    fn mark_claimed(&self, line: Line) -> Result<()> {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        if !claimed.insert(line) {
            return Err(HalError::Busy { line });
        }
        Ok(())
    }

    fn forget(&self, line: Line) -> bool {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        claimed.remove(&line)
    }

    fn gpio_dir(&self, pin: u32) -> PathBuf {
        self.gpio_root.join(format!("gpio{}", pin))
    }

    fn pwm_chip_dir(&self, chip: u32) -> PathBuf {
        self.pwm_root.join(format!("pwmchip{}", chip))
    }

    /// Export a GPIO, set its direction and open its value file
    fn claim_gpio(&self, pin: u32, direction: &str, write: bool) -> Result<File> {
        let line = Line::Gpio(pin);
        let claim = |source| HalError::Claim { line, source };

        let dir = self.gpio_dir(pin);
        export(&self.gpio_root.join("export"), pin, &dir).map_err(claim)?;
        write_attr(&dir.join("direction"), direction).map_err(claim)?;

        let value = OpenOptions::new()
            .read(true)
            .write(write)
            .open(dir.join("value"))
            .map_err(claim)?;

        debug!("Claimed {} as {}", line, direction);
        Ok(value)
    }
}

impl Hardware for SysfsHardware {
    fn output(&self, pin: u32) -> Result<Box<dyn OutputPin>> {
        let line = Line::Gpio(pin);
        self.mark_claimed(line)?;

        // "low" sets direction out with an initial low level, no glitch
        match self.claim_gpio(pin, "low", true) {
            Ok(value) => Ok(Box::new(SysfsOutput { line, value })),
            Err(e) => {
                self.release(line);
                Err(e)
            }
        }
    }

    fn input(&self, pin: u32) -> Result<Box<dyn InputPin>> {
        let line = Line::Gpio(pin);
        self.mark_claimed(line)?;

        match self.claim_gpio(pin, "in", false) {
            Ok(value) => Ok(Box::new(SysfsInput { line, value })),
            Err(e) => {
                self.release(line);
                Err(e)
            }
        }
    }

    fn pwm(&self, chip: u32, channel: u32) -> Result<Box<dyn PwmOutput>> {
        let line = Line::Pwm { chip, channel };
        self.mark_claimed(line)?;

        let claim = |source| HalError::Claim { line, source };
        let chip_dir = self.pwm_chip_dir(chip);
        let dir = chip_dir.join(format!("pwm{}", channel));

        let opened = (|| -> io::Result<File> {
            export(&chip_dir.join("export"), channel, &dir)?;
            // Shrinking the period below the current duty cycle is rejected
            write_attr(&dir.join("duty_cycle"), "0")?;
            write_attr(&dir.join("period"), &self.pwm_period_ns.to_string())?;
            write_attr(&dir.join("enable"), "1")?;
            OpenOptions::new().write(true).open(dir.join("duty_cycle"))
        })();

        match opened {
            Ok(duty_cycle) => {
                debug!("Claimed {} with period {} ns", line, self.pwm_period_ns);
                Ok(Box::new(SysfsPwm {
                    line,
                    duty_cycle,
                    period_ns: self.pwm_period_ns,
                }))
            }
            Err(source) => {
                self.release(line);
                Err(claim(source))
            }
        }
    }

    fn release(&self, line: Line) {
        if !self.forget(line) {
            return;
        }

        let result = match line {
            Line::Gpio(pin) => write_attr(&self.gpio_root.join("unexport"), &pin.to_string()),
            Line::Pwm { chip, channel } => {
                let chip_dir = self.pwm_chip_dir(chip);
                let dir = chip_dir.join(format!("pwm{}", channel));
                let _ = write_attr(&dir.join("enable"), "0");
                write_attr(&chip_dir.join("unexport"), &channel.to_string())
            }
        };

        match result {
            Ok(()) => debug!("Released {}", line),
            Err(e) => warn!("Failed to release {}: {}", line, e),
        }
    }
}

fn write_attr(path: &Path, value: &str) -> io::Result<()> {
    fs::write(path, value)
}

/// Export a line; a line left exported by a previous run is reused
fn export(export_file: &Path, index: u32, exported_dir: &Path) -> io::Result<()> {
    if exported_dir.exists() {
        return Ok(());
    }
    write_attr(export_file, &index.to_string())?;
    sleep(EXPORT_SETTLE);
    Ok(())
}

struct SysfsOutput {
    line: Line,
    value: File,
}

impl SysfsOutput {
    fn write_level(&mut self, level: &[u8]) -> Result<()> {
        let line = self.line;
        self.value
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.value.write_all(level))
            .map_err(|source| HalError::Io { line, source })
    }
}

impl OutputPin for SysfsOutput {
    fn set_high(&mut self) -> Result<()> {
        self.write_level(b"1")
    }

    fn set_low(&mut self) -> Result<()> {
        self.write_level(b"0")
    }
}

struct SysfsInput {
    line: Line,
    value: File,
}

impl InputPin for SysfsInput {
    fn is_high(&mut self) -> Result<bool> {
        let line = self.line;
        let mut buf = [0u8; 2];
        let n = self
            .value
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.value.read(&mut buf))
            .map_err(|source| HalError::Io { line, source })?;

        match buf.first() {
            Some(b'1') if n > 0 => Ok(true),
            Some(b'0') if n > 0 => Ok(false),
            _ => Err(HalError::InvalidValue {
                line,
                value: String::from_utf8_lossy(&buf[..n]).into_owned(),
            }),
        }
    }
}

struct SysfsPwm {
    line: Line,
    duty_cycle: File,
    period_ns: u64,
}

impl PwmOutput for SysfsPwm {
    fn set_duty(&mut self, duty: f32) -> Result<()> {
        let line = self.line;
        let duty_ns = (self.period_ns as f64 * duty.clamp(0.0, 1.0) as f64).round() as u64;
        self.duty_cycle
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.duty_cycle.write_all(duty_ns.to_string().as_bytes()))
            .map_err(|source| HalError::Io { line, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_tree(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("rover-sysfs-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(root.join("gpio")).unwrap();
        fs::create_dir_all(root.join("pwm")).unwrap();
        root
    }

    #[test]
    fn test_output_reuses_exported_gpio() {
        let root = fake_tree("output");
        let gpio = root.join("gpio");
        // Pretend the kernel already exported GPIO5
        fs::create_dir_all(gpio.join("gpio5")).unwrap();
        fs::write(gpio.join("gpio5/value"), "0").unwrap();

        let hw = SysfsHardware::with_roots(&gpio, root.join("pwm"), 1_000_000);
        let mut pin = hw.output(5).unwrap();
        pin.set_high().unwrap();

        assert_eq!(fs::read_to_string(gpio.join("gpio5/direction")).unwrap(), "low");
        assert_eq!(fs::read_to_string(gpio.join("gpio5/value")).unwrap(), "1");

        hw.release(Line::Gpio(5));
        assert_eq!(fs::read_to_string(gpio.join("unexport")).unwrap(), "5");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_double_claim_is_busy() {
        let root = fake_tree("busy");
        let gpio = root.join("gpio");
        fs::create_dir_all(gpio.join("gpio6")).unwrap();
        fs::write(gpio.join("gpio6/value"), "0").unwrap();

        let hw = SysfsHardware::with_roots(&gpio, root.join("pwm"), 1_000_000);
        let _pin = hw.input(6).unwrap();
        assert!(matches!(hw.input(6), Err(HalError::Busy { .. })));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_missing_gpio_fails_to_claim() {
        let root = fake_tree("missing");
        let hw = SysfsHardware::with_roots(root.join("nope"), root.join("pwm"), 1_000_000);
        assert!(matches!(hw.output(7), Err(HalError::Claim { .. })));
        // A failed claim does not leave the line marked as taken
        assert!(matches!(hw.output(7), Err(HalError::Claim { .. })));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_pwm_duty_in_nanoseconds() {
        let root = fake_tree("pwm");
        let pwm = root.join("pwm");
        fs::create_dir_all(pwm.join("pwmchip0/pwm1")).unwrap();

        let hw = SysfsHardware::with_roots(root.join("gpio"), &pwm, 1_000_000);
        let mut out = hw.pwm(0, 1).unwrap();
        out.set_duty(0.25).unwrap();

        assert_eq!(fs::read_to_string(pwm.join("pwmchip0/pwm1/period")).unwrap(), "1000000");
        assert_eq!(fs::read_to_string(pwm.join("pwmchip0/pwm1/duty_cycle")).unwrap(), "250000");
        assert_eq!(fs::read_to_string(pwm.join("pwmchip0/pwm1/enable")).unwrap(), "1");
        let _ = fs::remove_dir_all(&root);
    }
}
