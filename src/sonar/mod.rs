// Ultrasonic obstacle sensing
//
// Provides:
// - HC-SR04 time-of-flight measurement with bounded busy-waits
// - Background obstacle monitor reporting detect and clear edges

mod hcsr04;
mod monitor;

use crate::hal::Line;

pub use hcsr04::{round_cm, Hcsr04};
pub use monitor::{
    MonitorError, ObstacleEvent, ObstacleMonitor, ObstacleSink, ObstacleState, ObstacleTracker,
};

/// One measurement cycle's result
///
/// `Timeout` means no reading was obtained; it says nothing about obstacles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DistanceSample {
    Distance(f64),
    Timeout,
}

impl DistanceSample {
    pub fn distance(&self) -> Option<f64> {
        match self {
            DistanceSample::Distance(cm) => Some(*cm),
            DistanceSample::Timeout => None,
        }
    }
}

/// A distance sensor the monitor can poll
pub trait EchoSensor: Send + 'static {
    /// Run one measurement cycle; never blocks past the sensor's own bounds
    fn measure(&mut self) -> DistanceSample;

    /// Lines to release when the monitor is cleaned up
    fn lines(&self) -> Vec<Line> {
        Vec::new()
    }
}
