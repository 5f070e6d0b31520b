// Two-motor vehicle: drive motor (forward/back) and steering motor

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::driver::{clamp_unit, Direction, MotorDriver, MotorState};
use crate::config::Settings;
use crate::hal::{HalError, Hardware};

pub const DRIVE_MOTOR_NAME: &str = "Drive";
pub const STEERING_MOTOR_NAME: &str = "Steering";

/// Operator command, every axis already clamped to [-1, 1]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VehicleCommand {
    pub joystick_x: f32,
    pub joystick_y: f32,
    pub gyro_enabled: bool,
    pub gyro_x: f32,
}

impl VehicleCommand {
    pub fn new(joystick_x: f32, joystick_y: f32, gyro_enabled: bool, gyro_x: f32) -> Self {
        Self {
            joystick_x: clamp_unit(joystick_x),
            joystick_y: clamp_unit(joystick_y),
            gyro_enabled,
            gyro_x: clamp_unit(gyro_x),
        }
    }

    /// Joystick-only command
    pub fn joystick(x: f32, y: f32) -> Self {
        Self::new(x, y, false, 0.0)
    }

    /// Steering value and where it came from
    pub fn steering(&self) -> (f32, SteeringSource) {
        if self.gyro_enabled {
            (self.gyro_x, SteeringSource::Gyro)
        } else {
            (self.joystick_x, SteeringSource::Joy)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SteeringSource {
    #[serde(rename = "GYRO")]
    Gyro,
    #[serde(rename = "JOY")]
    Joy,
}

/// State of both motors after an actuation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub drive: MotorState,
    pub steer: MotorState,
    pub source: SteeringSource,
}

impl VehicleState {
    pub fn is_stopped(&self) -> bool {
        self.drive.speed == 0.0 && self.steer.speed == 0.0
    }
}

pub struct VehicleController {
    drive: MotorDriver,
    steering: MotorDriver,
    source: SteeringSource,
}

impl VehicleController {
    pub fn new(settings: &Settings, hardware: Arc<dyn Hardware>) -> Result<Self, HalError> {
        let drive = MotorDriver::new(DRIVE_MOTOR_NAME, &settings.drive_motor, hardware.clone())?;
        // drive is dropped (and released) if the steering motor cannot be claimed
        let steering = MotorDriver::new(STEERING_MOTOR_NAME, &settings.steering_motor, hardware)?;
        info!("Vehicle controller initialized");

        Ok(Self {
            drive,
            steering,
            source: SteeringSource::Joy,
        })
    }

    /// Apply an operator command to both motors
    pub fn update(&mut self, command: &VehicleCommand) -> VehicleState {
        let drive = self.drive.set_speed(command.joystick_y);
        let (steer_value, source) = command.steering();
        let steer = self.steering.set_speed(steer_value);
        self.source = source;

        info!(
            "Command: drive {} {:>3.0}% | steer {} {:>3.0}% [{:?}]",
            arrow(drive.direction, "^", "v"),
            drive.speed_percent,
            arrow(steer.direction, ">", "<"),
            steer.speed_percent,
            source
        );

        VehicleState { drive, steer, source }
    }

    /// Stop both motors, whatever their current state
    pub fn stop_all(&mut self) -> VehicleState {
        let drive = self.drive.stop();
        let steer = self.steering.stop();
        info!("All motors stopped");

        VehicleState {
            drive,
            steer,
            source: self.source,
        }
    }

    /// Release both drivers' lines
    pub fn cleanup(&mut self) {
        self.drive.cleanup();
        self.steering.cleanup();
        info!("Vehicle controller released");
    }
}

fn arrow(direction: Direction, forward: &'static str, backward: &'static str) -> &'static str {
    match direction {
        Direction::Forward => forward,
        Direction::Backward => backward,
        Direction::Stop => "=",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MotorConfig;
    use crate::hal::{Line, SimHardware};

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.drive_motor.max_speed = 0.9;
        settings.steering_motor.max_speed = 0.6;
        settings
    }

    fn controller() -> (VehicleController, SimHardware) {
        let hw = SimHardware::new();
        let vehicle = VehicleController::new(&settings(), Arc::new(hw.clone())).unwrap();
        (vehicle, hw)
    }

    #[test]
    fn test_joystick_steering() {
        let (mut vehicle, _hw) = controller();
        let state = vehicle.update(&VehicleCommand::new(0.5, -0.3, false, 0.9));

        assert_eq!(state.source, SteeringSource::Joy);
        assert_eq!(state.steer.direction, Direction::Forward);
        assert_eq!(state.steer.speed, 0.5);
        assert_eq!(state.drive.direction, Direction::Backward);
        assert_eq!(state.drive.speed, 0.3);
    }

    #[test]
    fn test_gyro_overrides_joystick_x() {
        let (mut vehicle, _hw) = controller();
        let state = vehicle.update(&VehicleCommand::new(-1.0, 0.0, true, 0.8));

        assert_eq!(state.source, SteeringSource::Gyro);
        assert_eq!(state.steer.direction, Direction::Forward);
        // 0.8 capped by the steering motor's max speed
        assert_eq!(state.steer.speed, 0.6);
        assert_eq!(state.drive.direction, Direction::Stop);
    }

    #[test]
    fn test_max_speed_per_motor() {
        let (mut vehicle, _hw) = controller();
        let state = vehicle.update(&VehicleCommand::joystick(1.0, 1.0));
        assert_eq!(state.drive.speed, 0.9);
        assert_eq!(state.steer.speed, 0.6);
    }

    #[test]
    fn test_command_is_clamped() {
        let command = VehicleCommand::new(3.0, -2.0, true, f32::NAN);
        assert_eq!(command.joystick_x, 1.0);
        assert_eq!(command.joystick_y, -1.0);
        assert_eq!(command.gyro_x, 0.0);
    }

    #[test]
    fn test_stop_all() {
        let (mut vehicle, hw) = controller();
        vehicle.update(&VehicleCommand::joystick(0.4, 1.0));

        let state = vehicle.stop_all();
        assert!(state.is_stopped());
        assert_eq!(state.drive.direction, Direction::Stop);
        assert_eq!(hw.duty(0, 0), Some(0.0));
        assert_eq!(hw.duty(0, 1), Some(0.0));
    }

    #[test]
    fn test_cleanup_releases_all_lines() {
        let (mut vehicle, hw) = controller();
        vehicle.cleanup();

        let s = settings();
        for motor in [&s.drive_motor, &s.steering_motor] {
            assert!(!hw.is_claimed(Line::Pwm {
                chip: motor.pwm_chip,
                channel: motor.pwm_channel
            }));
            assert!(!hw.is_claimed(Line::Gpio(motor.input1_pin)));
            assert!(!hw.is_claimed(Line::Gpio(motor.input2_pin)));
        }
    }

    #[test]
    fn test_shared_pin_fails_startup_and_keeps_nothing() {
        let hw = SimHardware::new();
        let mut settings = settings();
        settings.steering_motor = MotorConfig {
            input1_pin: settings.drive_motor.input2_pin,
            ..settings.steering_motor.clone()
        };

        let result = VehicleController::new(&settings, Arc::new(hw.clone()));
        assert!(matches!(result, Err(HalError::Busy { .. })));
        assert!(!hw.is_claimed(Line::Gpio(settings.drive_motor.input1_pin)));
    }
}
