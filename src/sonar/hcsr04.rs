// HC-SR04 ultrasonic ranging
//
// 10 us trigger pulse, then the echo line stays high for the round-trip time
// of the sound burst. Both edge waits are bounded busy-polls.

use std::hint::spin_loop;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::{DistanceSample, EchoSensor};
use crate::config::{SPEED_OF_SOUND_CM_S, TRIGGER_PULSE};
use crate::hal::{HalError, Hardware, InputPin, Line, OutputPin};

/// Round to the 0.01 cm reporting precision
pub fn round_cm(cm: f64) -> f64 {
    (cm * 100.0).round() / 100.0
}

pub struct Hcsr04 {
    trigger: Box<dyn OutputPin>,
    echo: Box<dyn InputPin>,
    lines: [Line; 2],
    echo_timeout: Duration,
}

impl Hcsr04 {
    /// Claim the trigger (output) and echo (input) lines
    pub fn new(
        hardware: &dyn Hardware,
        trig_pin: u32,
        echo_pin: u32,
        echo_timeout: Duration,
    ) -> Result<Self, HalError> {
        let mut trigger = hardware.output(trig_pin)?;
        let echo = match hardware.input(echo_pin) {
            Ok(pin) => pin,
            Err(e) => {
                hardware.release(Line::Gpio(trig_pin));
                return Err(e);
            }
        };

        if let Err(e) = trigger.set_low() {
            hardware.release(Line::Gpio(trig_pin));
            hardware.release(Line::Gpio(echo_pin));
            return Err(e);
        }

        info!("Ultrasonic sensor initialized: TRIG=GPIO{}, ECHO=GPIO{}", trig_pin, echo_pin);
        Ok(Self {
            trigger,
            echo,
            lines: [Line::Gpio(trig_pin), Line::Gpio(echo_pin)],
            echo_timeout,
        })
    }

    /// One ranging cycle, surfacing line errors
    pub fn try_measure(&mut self) -> Result<DistanceSample, HalError> {
        self.trigger.set_high()?;
        spin_for(TRIGGER_PULSE);
        self.trigger.set_low()?;

        let Some(start) = self.wait_for_level(true)? else {
            return Ok(DistanceSample::Timeout);
        };
        let Some(end) = self.wait_for_level(false)? else {
            return Ok(DistanceSample::Timeout);
        };

        let pulse = end.duration_since(start);
        Ok(DistanceSample::Distance(round_cm(
            pulse.as_secs_f64() * SPEED_OF_SOUND_CM_S / 2.0,
        )))
    }

    /// Spin until the echo line reads `high`; `None` once the bound is exceeded
    fn wait_for_level(&mut self, high: bool) -> Result<Option<Instant>, HalError> {
        let deadline = Instant::now() + self.echo_timeout;
        loop {
            if self.echo.is_high()? == high {
                return Ok(Some(Instant::now()));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            spin_loop();
        }
    }
}

impl EchoSensor for Hcsr04 {
    fn measure(&mut self) -> DistanceSample {
        self.try_measure().unwrap_or_else(|e| {
            debug!("Measurement failed: {}", e);
            DistanceSample::Timeout
        })
    }

    fn lines(&self) -> Vec<Line> {
        self.lines.to_vec()
    }
}

/// Busy-wait; sleeping would overshoot a 10 us pulse by orders of magnitude
fn spin_for(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        spin_loop();
    }
}
