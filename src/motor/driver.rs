// Single DC motor behind an H-bridge
//
// IN1/IN2 select the direction, the PWM enable line sets the speed.
// Direction is derived only from the sign of the command.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::MotorConfig;
use crate::hal::{HalError, Hardware, Line, OutputPin, PwmOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
    Stop,
}

/// Snapshot produced by every actuation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorState {
    pub motor: String,
    pub direction: Direction,
    pub speed: f32,
    pub speed_percent: f32,
}

impl MotorState {
    fn new(motor: &str, direction: Direction, speed: f32) -> Self {
        Self {
            motor: motor.to_string(),
            direction,
            speed,
            speed_percent: (speed * 1000.0).round() / 10.0,
        }
    }
}

/// Clamp a command to [-1, 1]; NaN counts as neutral
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() { 0.0 } else { value.clamp(-1.0, 1.0) }
}

/// High-level driver for one motor
pub struct MotorDriver {
    name: String,
    max_speed: f32,
    enable: Box<dyn PwmOutput>,
    input1: Box<dyn OutputPin>,
    input2: Box<dyn OutputPin>,
    hardware: Arc<dyn Hardware>,
    lines: [Line; 3],
    released: bool,
}

impl MotorDriver {
    /// Claim the motor's lines; any claim failure is fatal for startup
    pub fn new(name: &str, config: &MotorConfig, hardware: Arc<dyn Hardware>) -> Result<Self, HalError> {
        let lines = [
            Line::Pwm {
                chip: config.pwm_chip,
                channel: config.pwm_channel,
            },
            Line::Gpio(config.input1_pin),
            Line::Gpio(config.input2_pin),
        ];

        let enable = hardware.pwm(config.pwm_chip, config.pwm_channel)?;
        let input1 = match hardware.output(config.input1_pin) {
            Ok(pin) => pin,
            Err(e) => {
                hardware.release(lines[0]);
                return Err(e);
            }
        };
        let input2 = match hardware.output(config.input2_pin) {
            Ok(pin) => pin,
            Err(e) => {
                hardware.release(lines[0]);
                hardware.release(lines[1]);
                return Err(e);
            }
        };

        info!(
            "{} initialized: PWM={}, IN1=GPIO{}, IN2=GPIO{}, max={}%",
            name,
            lines[0],
            config.input1_pin,
            config.input2_pin,
            config.max_speed * 100.0
        );

        Ok(Self {
            name: name.to_string(),
            max_speed: config.max_speed,
            enable,
            input1,
            input2,
            hardware,
            lines,
            released: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_speed(&self) -> f32 {
        self.max_speed
    }

    /// Set speed and direction from a value in [-1, 1]
    ///
    /// Out-of-range values are clamped. Line failures are logged, the
    /// returned state is what was commanded.
    pub fn set_speed(&mut self, value: f32) -> MotorState {
        let value = clamp_unit(value);
        let speed = value.abs().min(self.max_speed);

        let (direction, in1, in2, duty) = if value > 0.0 {
            (Direction::Forward, true, false, speed)
        } else if value < 0.0 {
            (Direction::Backward, false, true, speed)
        } else {
            (Direction::Stop, false, false, 0.0)
        };

        if let Err(e) = self.write_lines(in1, in2, duty) {
            warn!("{}: failed to apply {:?} at {:.2}: {}", self.name, direction, speed, e);
        }

        debug!("{}: {:?} at {:.2}", self.name, direction, speed);
        MotorState::new(&self.name, direction, speed)
    }

    fn write_lines(&mut self, in1: bool, in2: bool, duty: f32) -> Result<(), HalError> {
        self.input1.set_level(in1)?;
        self.input2.set_level(in2)?;
        self.enable.set_duty(duty)
    }

    /// Stop the motor
    pub fn stop(&mut self) -> MotorState {
        self.set_speed(0.0)
    }

    /// Stop and release the motor's lines; later calls do nothing
    pub fn cleanup(&mut self) {
        if self.released {
            return;
        }
        self.stop();
        for line in self.lines {
            self.hardware.release(line);
        }
        self.released = true;
        info!("{} released", self.name);
    }
}

impl Drop for MotorDriver {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimHardware;

    fn config(max_speed: f32) -> MotorConfig {
        MotorConfig {
            pwm_chip: 0,
            pwm_channel: 0,
            input1_pin: 5,
            input2_pin: 6,
            max_speed,
        }
    }

    fn driver(max_speed: f32) -> (MotorDriver, SimHardware) {
        let hw = SimHardware::new();
        let motor = MotorDriver::new("test", &config(max_speed), Arc::new(hw.clone())).unwrap();
        (motor, hw)
    }

    #[test]
    fn test_speed_and_direction_follow_sign() {
        let (mut motor, hw) = driver(0.8);

        for v in [-1.0f32, -0.9, -0.5, -0.1, 0.0, 0.1, 0.5, 0.8, 0.95, 1.0] {
            let state = motor.set_speed(v);
            assert_eq!(state.speed, v.abs().min(0.8), "speed for {}", v);
            let expected = if v > 0.0 {
                Direction::Forward
            } else if v < 0.0 {
                Direction::Backward
            } else {
                Direction::Stop
            };
            assert_eq!(state.direction, expected, "direction for {}", v);
            assert_eq!(hw.duty(0, 0), Some(state.speed));
        }
    }

    #[test]
    fn test_direction_lines() {
        let (mut motor, hw) = driver(1.0);

        motor.set_speed(0.5);
        assert_eq!((hw.level(5), hw.level(6)), (Some(true), Some(false)));

        motor.set_speed(-0.5);
        assert_eq!((hw.level(5), hw.level(6)), (Some(false), Some(true)));

        motor.set_speed(0.0);
        assert_eq!((hw.level(5), hw.level(6)), (Some(false), Some(false)));
        assert_eq!(hw.duty(0, 0), Some(0.0));
    }

    #[test]
    fn test_out_of_range_is_clamped() {
        let (mut motor, _hw) = driver(1.0);
        assert_eq!(motor.set_speed(2.0), motor.set_speed(1.0));
        assert_eq!(motor.set_speed(-7.5), motor.set_speed(-1.0));
        assert_eq!(motor.set_speed(f32::NAN).direction, Direction::Stop);
        assert_eq!(motor.set_speed(f32::INFINITY).speed, 1.0);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut motor, _hw) = driver(1.0);
        motor.set_speed(0.7);
        for _ in 0..3 {
            let state = motor.stop();
            assert_eq!(state.speed, 0.0);
            assert_eq!(state.direction, Direction::Stop);
        }
    }

    #[test]
    fn test_speed_percent() {
        let (mut motor, _hw) = driver(1.0);
        assert_eq!(motor.set_speed(0.4567).speed_percent, 45.7);
        assert_eq!(motor.set_speed(-1.0).speed_percent, 100.0);
    }

    #[test]
    fn test_cleanup_releases_once() {
        let (mut motor, hw) = driver(1.0);
        motor.set_speed(1.0);
        motor.cleanup();
        motor.cleanup();
        drop(motor);

        assert_eq!(hw.duty(0, 0), Some(0.0));
        assert_eq!(hw.release_count(Line::Pwm { chip: 0, channel: 0 }), 1);
        assert_eq!(hw.release_count(Line::Gpio(5)), 1);
        assert_eq!(hw.release_count(Line::Gpio(6)), 1);
    }

    #[test]
    fn test_failed_claim_releases_partial_lines() {
        let hw = SimHardware::new();
        hw.refuse(Line::Gpio(6));

        let result = MotorDriver::new("test", &config(1.0), Arc::new(hw.clone()));
        assert!(matches!(result, Err(HalError::Claim { .. })));
        assert!(!hw.is_claimed(Line::Pwm { chip: 0, channel: 0 }));
        assert!(!hw.is_claimed(Line::Gpio(5)));
    }
}
