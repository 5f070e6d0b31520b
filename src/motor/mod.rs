// Motor control for the two-motor vehicle
//
// Provides:
// - H-bridge DC motor driver (direction lines + PWM duty)
// - Vehicle controller mapping operator commands onto drive and steering motors

mod driver;
mod vehicle;

pub use driver::{clamp_unit, Direction, MotorDriver, MotorState};
pub use vehicle::{
    SteeringSource, VehicleCommand, VehicleController, VehicleState, DRIVE_MOTOR_NAME,
    STEERING_MOTOR_NAME,
};
