// Hardware capability layer
//
// Motor and sonar code only talk to these traits. A backend claims lines
// (GPIO pins or PWM channels) and can release them again by identifier, so a
// line can be released from a context that does not own the pin object.

mod sim;
mod sysfs;

use std::fmt;

pub use sim::SimHardware;
pub use sysfs::SysfsHardware;

/// Identifies a claimed hardware line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Line {
    Gpio(u32),
    Pwm { chip: u32, channel: u32 },
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Line::Gpio(pin) => write!(f, "GPIO{}", pin),
            Line::Pwm { chip, channel } => write!(f, "pwmchip{}/pwm{}", chip, channel),
        }
    }
}

/// Error types for line access
#[derive(Debug, thiserror::Error)]
pub enum HalError {
    #[error("IO error on {line}: {source}")]
    Io {
        line: Line,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not claim {line}: {source}")]
    Claim {
        line: Line,
        #[source]
        source: std::io::Error,
    },

    #[error("{line} is already claimed")]
    Busy { line: Line },

    #[error("{line} has been released")]
    Released { line: Line },

    #[error("Unexpected value read from {line}: {value:?}")]
    InvalidValue { line: Line, value: String },
}

pub type Result<T> = std::result::Result<T, HalError>;

/// Digital output line
pub trait OutputPin: Send {
    fn set_high(&mut self) -> Result<()>;
    fn set_low(&mut self) -> Result<()>;

    fn set_level(&mut self, high: bool) -> Result<()> {
        if high { self.set_high() } else { self.set_low() }
    }
}

/// Digital input line
pub trait InputPin: Send {
    fn is_high(&mut self) -> Result<bool>;
}

/// Duty-cycle output
pub trait PwmOutput: Send {
    /// Set duty cycle as a fraction in [0.0, 1.0]
    fn set_duty(&mut self, duty: f32) -> Result<()>;
}

/// Line factory for a platform
///
/// Claiming the same line twice without releasing it is an error.
/// Releasing a line that is not claimed is a no-op.
pub trait Hardware: Send + Sync {
    fn output(&self, pin: u32) -> Result<Box<dyn OutputPin>>;
    fn input(&self, pin: u32) -> Result<Box<dyn InputPin>>;
    fn pwm(&self, chip: u32, channel: u32) -> Result<Box<dyn PwmOutput>>;
    fn release(&self, line: Line);
}
