// Background obstacle monitor
//
// A dedicated thread samples the sensor at a fixed cadence and folds the
// readings into Clear/Detected. Edge transitions are posted to a sink (never
// awaited), the current state is published on a watch channel.

use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{DistanceSample, EchoSensor};
use crate::config::{SonarConfig, MONITOR_STOP_TIMEOUT};
use crate::hal::{Hardware, Line};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ObstacleState {
    pub detected: bool,
    pub last_distance: Option<f64>,
}

/// Edge transitions of the obstacle state
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ObstacleEvent {
    Detected { distance_cm: f64 },
    Cleared { distance_cm: f64 },
}

/// Receives edge events from the sampling thread
///
/// `post` runs on the sampling thread and must not block.
pub trait ObstacleSink: Send + 'static {
    fn post(&self, event: ObstacleEvent);
}

impl ObstacleSink for mpsc::UnboundedSender<ObstacleEvent> {
    fn post(&self, event: ObstacleEvent) {
        if self.send(event).is_err() {
            warn!("Obstacle event dropped, receiver closed: {:?}", event);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Failed to spawn sampling thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Sensor unavailable: the previous sampling thread never exited")]
    SensorLost,

    #[error("Sensor lines have been released")]
    Released,
}

/// Clear/Detected state machine over distance samples
#[derive(Debug, Clone)]
pub struct ObstacleTracker {
    threshold_cm: f64,
    state: ObstacleState,
}

impl ObstacleTracker {
    pub fn new(threshold_cm: f64) -> Self {
        Self {
            threshold_cm,
            state: ObstacleState::default(),
        }
    }

    pub fn state(&self) -> ObstacleState {
        self.state
    }

    /// Feed one sample; returns the edge it caused, if any
    ///
    /// Timeouts leave the state untouched.
    pub fn observe(&mut self, sample: DistanceSample) -> Option<ObstacleEvent> {
        let distance_cm = sample.distance()?;
        self.state.last_distance = Some(distance_cm);

        match (self.state.detected, distance_cm <= self.threshold_cm) {
            (false, true) => {
                self.state.detected = true;
                Some(ObstacleEvent::Detected { distance_cm })
            }
            (true, false) => {
                self.state.detected = false;
                Some(ObstacleEvent::Cleared { distance_cm })
            }
            _ => None,
        }
    }
}

/// Everything the sampling thread owns; handed back when the thread exits
struct Sampler<S, K> {
    sensor: S,
    tracker: ObstacleTracker,
    status: watch::Sender<ObstacleState>,
    sink: K,
    interval: Duration,
}

impl<S: EchoSensor, K: ObstacleSink> Sampler<S, K> {
    fn run(mut self, stop: std_mpsc::Receiver<()>) -> Self {
        info!("Obstacle monitoring loop started");

        loop {
            let sample = self.sensor.measure();
            match sample {
                DistanceSample::Distance(cm) => debug!("Distance: {:.2} cm", cm),
                DistanceSample::Timeout => debug!("Echo timeout, sample discarded"),
            }

            if let Some(event) = self.tracker.observe(sample) {
                match event {
                    ObstacleEvent::Detected { distance_cm } => {
                        warn!("Obstacle detected at {} cm", distance_cm)
                    }
                    ObstacleEvent::Cleared { distance_cm } => {
                        info!("Obstacle cleared, distance {} cm", distance_cm)
                    }
                }
                self.sink.post(event);
            }
            self.status.send_replace(self.tracker.state());

            // Stop is checked once per cycle; the wait doubles as the sample interval
            match stop.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!("Obstacle monitoring loop exited");
        self
    }
}

struct Worker<S, K> {
    stop: std_mpsc::Sender<()>,
    done: std_mpsc::Receiver<()>,
    handle: JoinHandle<Sampler<S, K>>,
}

pub struct ObstacleMonitor<S: EchoSensor, K: ObstacleSink> {
    sampler: Option<Sampler<S, K>>,
    worker: Option<Worker<S, K>>,
    status: watch::Receiver<ObstacleState>,
    hardware: Arc<dyn Hardware>,
    lines: Vec<Line>,
    released: bool,
}

impl<S: EchoSensor, K: ObstacleSink> ObstacleMonitor<S, K> {
    pub fn new(sensor: S, config: &SonarConfig, sink: K, hardware: Arc<dyn Hardware>) -> Self {
        let (status_tx, status) = watch::channel(ObstacleState::default());
        let lines = sensor.lines();
        info!("Obstacle threshold: {} cm", config.threshold_cm);

        Self {
            sampler: Some(Sampler {
                sensor,
                tracker: ObstacleTracker::new(config.threshold_cm),
                status: status_tx,
                sink,
                interval: config.sample_interval(),
            }),
            worker: None,
            status,
            hardware,
            lines,
            released: false,
        }
    }

    /// Current obstacle state (read-only view of the loop's state)
    pub fn status(&self) -> ObstacleState {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ObstacleState> {
        self.status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Start the sampling thread; no-op while already running
    pub fn start_monitoring(&mut self) -> Result<(), MonitorError> {
        if self.worker.is_some() {
            return Ok(());
        }
        if self.released {
            return Err(MonitorError::Released);
        }
        let sampler = self.sampler.take().ok_or(MonitorError::SensorLost)?;

        let (stop_tx, stop_rx) = std_mpsc::channel();
        let (done_tx, done_rx) = std_mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("obstacle-monitor".into())
            .spawn(move || {
                let _done = done_tx;
                sampler.run(stop_rx)
            })?;

        self.worker = Some(Worker {
            stop: stop_tx,
            done: done_rx,
            handle,
        });
        info!("Obstacle monitoring started");
        Ok(())
    }

    /// Ask the sampling thread to exit and wait for it, at most 2 s
    ///
    /// No-op when idle. A thread that overruns the wait is left detached.
    pub fn stop_monitoring(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        let _ = worker.stop.send(());
        match worker.done.recv_timeout(MONITOR_STOP_TIMEOUT) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Monitoring loop did not exit within {:?}, detaching it",
                    MONITOR_STOP_TIMEOUT
                );
                return;
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
        }

        match worker.handle.join() {
            Ok(sampler) => self.sampler = Some(sampler),
            Err(_) => warn!("Monitoring loop panicked"),
        }
        info!("Obstacle monitoring stopped");
    }

    /// Stop the loop, then release the sensor lines whatever the loop did
    pub fn cleanup(&mut self) {
        self.stop_monitoring();
        if self.released {
            return;
        }
        for line in &self.lines {
            self.hardware.release(*line);
        }
        self.released = true;
        info!("Ultrasonic sensor lines released");
    }
}

impl<S: EchoSensor, K: ObstacleSink> Drop for ObstacleMonitor<S, K> {
    fn drop(&mut self) {
        self.cleanup();
    }
}
