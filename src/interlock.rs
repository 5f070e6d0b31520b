// Safety interlock: the only owner of the motors
//
// Operator commands, obstacle edges, link loss and watchdog ticks all arrive
// as MotionRequests on one FIFO queue and are applied one at a time, so a
// safety stop can never interleave with a command at sub-operation level.
//
// Between an obstacle detection and the next recovery the interlock stops any
// forward command, steering included. Reversing, with steering, stays available.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::messages::{DirectionSuggestion, Notification, ObstacleDetected, RuntimeHealth};
use crate::motor::{VehicleCommand, VehicleController, VehicleState};
use crate::sonar::{ObstacleEvent, ObstacleSink};

#[derive(Debug, Clone, PartialEq)]
pub enum MotionRequest {
    Command(VehicleCommand),
    Obstacle(ObstacleEvent),
    LinkLost { session: String },
    WatchdogTick,
    Shutdown,
}

/// Result of one applied request
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub state: VehicleState,
    pub health: RuntimeHealth,
    /// To broadcast to every session, in order
    pub notifications: Vec<Notification>,
}

/// Submits requests to the interlock; cheap to clone
#[derive(Clone)]
pub struct MotionHandle {
    tx: mpsc::UnboundedSender<MotionRequest>,
}

pub fn motion_channel() -> (MotionHandle, mpsc::UnboundedReceiver<MotionRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MotionHandle { tx }, rx)
}

impl MotionHandle {
    /// Queue a request; false once the interlock has shut down
    pub fn send(&self, request: MotionRequest) -> bool {
        self.tx.send(request).is_ok()
    }

    pub fn submit(&self, command: VehicleCommand) -> bool {
        self.send(MotionRequest::Command(command))
    }

    pub fn link_lost(&self, session: &str) -> bool {
        self.send(MotionRequest::LinkLost {
            session: session.to_string(),
        })
    }

    pub fn shutdown(&self) -> bool {
        self.send(MotionRequest::Shutdown)
    }
}

// Obstacle edges go straight onto the motion queue from the sampling thread
impl ObstacleSink for MotionHandle {
    fn post(&self, event: ObstacleEvent) {
        if !self.send(MotionRequest::Obstacle(event)) {
            warn!("Interlock gone, obstacle event dropped: {:?}", event);
        }
    }
}

pub struct SafetyInterlock {
    controller: VehicleController,
    command_timeout: Option<Duration>,
    last_command_at: Option<Instant>,
    hold: bool,
    stale: bool,
    moving: bool,
}

impl SafetyInterlock {
    pub fn new(controller: VehicleController, command_timeout: Option<Duration>) -> Self {
        Self {
            controller,
            command_timeout,
            last_command_at: None,
            hold: false,
            stale: false,
            moving: false,
        }
    }

    pub fn is_holding(&self) -> bool {
        self.hold
    }

    pub fn health(&self) -> RuntimeHealth {
        if self.hold {
            RuntimeHealth::ObstacleHold
        } else if self.stale {
            RuntimeHealth::CmdStale
        } else {
            RuntimeHealth::Ok
        }
    }

    /// Apply one request; `None` when nothing was actuated
    pub fn handle(&mut self, request: MotionRequest) -> Option<Outcome> {
        let mut notifications = Vec::new();

        let state = match request {
            MotionRequest::Command(command) => {
                self.last_command_at = Some(Instant::now());
                self.stale = false;
                self.controller.update(&self.restrict(command))
            }
            MotionRequest::Obstacle(ObstacleEvent::Detected { distance_cm }) => {
                warn!("Obstacle at {} cm, stopping", distance_cm);
                self.hold = true;
                let state = self.controller.stop_all();
                notifications.push(Notification::ObstacleDetected(ObstacleDetected::new(distance_cm)));
                notifications.push(Notification::SuggestDirectionChange(DirectionSuggestion::default()));
                state
            }
            MotionRequest::Obstacle(ObstacleEvent::Cleared { distance_cm }) => {
                // Recovery is log-only, clients are not notified
                info!("Path clear ({} cm), forward drive released", distance_cm);
                self.hold = false;
                return None;
            }
            MotionRequest::LinkLost { session } => {
                info!("Session {} disconnected, stopping", session);
                self.controller.stop_all()
            }
            MotionRequest::WatchdogTick => {
                let timeout = self.command_timeout?;
                let age = self.last_command_at?.elapsed();
                if !self.moving || age <= timeout {
                    return None;
                }
                warn!("Command stale ({:?} old), stopping", age);
                self.stale = true;
                self.controller.stop_all()
            }
            MotionRequest::Shutdown => {
                info!("Interlock shutting down");
                self.controller.stop_all()
            }
        };

        self.moving = !state.is_stopped();
        Some(Outcome {
            state,
            health: self.health(),
            notifications,
        })
    }

    /// Forward commands are stopped outright while an obstacle is present
    ///
    /// Steering goes with the drive: a held forward-and-turn command must not
    /// leave the steering motor running. Reverse commands pass unchanged.
    fn restrict(&self, mut command: VehicleCommand) -> VehicleCommand {
        if self.hold && command.joystick_y > 0.0 {
            debug!("Forward drive {:.2} held by obstacle interlock", command.joystick_y);
            command.joystick_y = 0.0;
            command.joystick_x = 0.0;
            command.gyro_x = 0.0;
        }
        command
    }

    /// Drain the request queue until shutdown or until every handle is gone
    ///
    /// Returns self so the owner can tear the motors down.
    pub async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<MotionRequest>,
        outcomes: mpsc::UnboundedSender<Outcome>,
    ) -> Self {
        info!("Interlock running");

        loop {
            let request = requests.recv().await.unwrap_or(MotionRequest::Shutdown);
            let shutdown = matches!(request, MotionRequest::Shutdown);

            if let Some(outcome) = self.handle(request) {
                let _ = outcomes.send(outcome);
            }
            if shutdown {
                break;
            }
        }

        self
    }

    pub fn into_controller(self) -> VehicleController {
        self.controller
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::hal::SimHardware;
    use crate::motor::Direction;
    use std::sync::Arc;

    fn setup(timeout: Option<Duration>) -> (SafetyInterlock, SimHardware) {
        let hw = SimHardware::new();
        let controller = VehicleController::new(&Settings::default(), Arc::new(hw.clone())).unwrap();
        (SafetyInterlock::new(controller, timeout), hw)
    }

    fn detected(distance_cm: f64) -> MotionRequest {
        MotionRequest::Obstacle(ObstacleEvent::Detected { distance_cm })
    }

    fn cleared(distance_cm: f64) -> MotionRequest {
        MotionRequest::Obstacle(ObstacleEvent::Cleared { distance_cm })
    }

    fn forward() -> MotionRequest {
        MotionRequest::Command(VehicleCommand::joystick(0.0, 1.0))
    }

    fn forward_turning() -> MotionRequest {
        MotionRequest::Command(VehicleCommand::joystick(0.7, 1.0))
    }

    fn motors_idle(hw: &SimHardware) -> bool {
        let settings = Settings::default();
        let drive = &settings.drive_motor;
        let steer = &settings.steering_motor;
        hw.duty(drive.pwm_chip, drive.pwm_channel) == Some(0.0)
            && hw.duty(steer.pwm_chip, steer.pwm_channel) == Some(0.0)
    }

    #[test]
    fn test_detection_stops_and_notifies() {
        let (mut interlock, hw) = setup(None);
        interlock.handle(forward());

        let outcome = interlock.handle(detected(18.0)).unwrap();
        assert!(outcome.state.is_stopped());
        assert!(motors_idle(&hw));
        assert_eq!(outcome.health, RuntimeHealth::ObstacleHold);
        assert_eq!(
            outcome.notifications,
            vec![
                Notification::ObstacleDetected(ObstacleDetected::new(18.0)),
                Notification::SuggestDirectionChange(DirectionSuggestion::default()),
            ]
        );
    }

    #[test]
    fn test_stop_wins_in_either_order() {
        // Command admitted first, stop applied after it
        let (mut interlock, hw) = setup(None);
        interlock.handle(forward());
        let last = interlock.handle(detected(15.0)).unwrap();
        assert!(last.state.is_stopped());
        assert!(motors_idle(&hw));

        // Stop first, the racing forward command cannot undo it
        let (mut interlock, hw) = setup(None);
        interlock.handle(detected(15.0));
        let last = interlock.handle(forward()).unwrap();
        assert!(last.state.is_stopped());
        assert!(motors_idle(&hw));
    }

    #[test]
    fn test_forward_turn_stops_both_motors_in_either_order() {
        let (mut interlock, hw) = setup(None);
        interlock.handle(forward_turning());
        let last = interlock.handle(detected(10.0)).unwrap();
        assert!(last.state.is_stopped());
        assert!(motors_idle(&hw));

        let (mut interlock, hw) = setup(None);
        interlock.handle(detected(10.0));
        let last = interlock.handle(forward_turning()).unwrap();
        assert!(last.state.is_stopped(), "{:?}", last.state);
        assert!(motors_idle(&hw));

        // Gyro steering is held the same way
        let gyro = VehicleCommand::new(0.0, 0.8, true, -0.9);
        let last = interlock.handle(MotionRequest::Command(gyro)).unwrap();
        assert!(last.state.is_stopped(), "{:?}", last.state);
        assert!(motors_idle(&hw));
    }

    #[test]
    fn test_reverse_allowed_during_hold() {
        let (mut interlock, _hw) = setup(None);
        interlock.handle(detected(12.0));

        let outcome = interlock
            .handle(MotionRequest::Command(VehicleCommand::joystick(-0.5, -0.6)))
            .unwrap();
        assert_eq!(outcome.state.drive.direction, Direction::Backward);
        assert_eq!(outcome.state.drive.speed, 0.6);
        assert_eq!(outcome.state.steer.direction, Direction::Backward);
        assert!(outcome.notifications.is_empty());
    }

    #[test]
    fn test_clear_releases_hold_without_notification() {
        let (mut interlock, _hw) = setup(None);
        interlock.handle(detected(12.0));
        assert!(interlock.is_holding());

        assert_eq!(interlock.handle(cleared(25.0)), None);
        assert!(!interlock.is_holding());

        let outcome = interlock.handle(forward()).unwrap();
        assert_eq!(outcome.state.drive.direction, Direction::Forward);
        assert_eq!(outcome.health, RuntimeHealth::Ok);
    }

    #[test]
    fn test_link_lost_after_full_forward() {
        let (mut interlock, hw) = setup(None);
        let running = interlock.handle(forward()).unwrap();
        assert_eq!(running.state.drive.speed, 1.0);

        let outcome = interlock
            .handle(MotionRequest::LinkLost {
                session: "car/session/tablet".into(),
            })
            .unwrap();
        assert_eq!(outcome.state.drive.speed, 0.0);
        assert_eq!(outcome.state.steer.speed, 0.0);
        assert!(outcome.notifications.is_empty());
        assert!(motors_idle(&hw));
    }

    #[test]
    fn test_watchdog() {
        let (mut interlock, _hw) = setup(None);
        interlock.handle(forward());
        assert_eq!(interlock.handle(MotionRequest::WatchdogTick), None);

        let (mut interlock, _hw) = setup(Some(Duration::from_millis(10)));
        assert_eq!(interlock.handle(MotionRequest::WatchdogTick), None);
        interlock.handle(forward());
        assert_eq!(interlock.handle(MotionRequest::WatchdogTick), None);

        std::thread::sleep(Duration::from_millis(20));
        let outcome = interlock.handle(MotionRequest::WatchdogTick).unwrap();
        assert!(outcome.state.is_stopped());
        assert_eq!(outcome.health, RuntimeHealth::CmdStale);

        // Already stopped, nothing more to do
        assert_eq!(interlock.handle(MotionRequest::WatchdogTick), None);

        let outcome = interlock.handle(forward()).unwrap();
        assert_eq!(outcome.health, RuntimeHealth::Ok);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_racing_command_and_detection_end_stopped() {
        for i in 0..100 {
            // Alternate straight and turning forward commands
            let steer = if i % 2 == 0 { 0.0 } else { 0.7 };
            let (interlock, hw) = setup(None);
            let (handle, requests) = motion_channel();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(interlock.run(requests, out_tx));

            // Sampling thread and command path post at the same time
            let sonar = handle.clone();
            let poster = std::thread::spawn(move || {
                sonar.post(ObstacleEvent::Detected { distance_cm: 10.0 })
            });
            let operator = handle.clone();
            let commander =
                tokio::spawn(async move { operator.submit(VehicleCommand::joystick(steer, 1.0)) });

            poster.join().unwrap();
            assert!(commander.await.unwrap());

            let first = out_rx.recv().await.unwrap();
            let second = out_rx.recv().await.unwrap();
            assert!(second.state.is_stopped(), "after {:?} then {:?}", first, second);
            assert!(motors_idle(&hw));

            handle.shutdown();
            let interlock = task.await.unwrap();
            interlock.into_controller().cleanup();
        }
    }

    #[tokio::test]
    async fn test_run_exits_when_handles_dropped() {
        let (interlock, hw) = setup(None);
        let (handle, requests) = motion_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(interlock.run(requests, out_tx));

        handle.submit(VehicleCommand::joystick(0.0, 0.8));
        drop(handle);

        let interlock = task.await.unwrap();
        let states: Vec<_> = std::iter::from_fn(|| out_rx.try_recv().ok()).collect();
        assert_eq!(states.len(), 2);
        assert!(states[1].state.is_stopped());
        assert!(motors_idle(&hw));
        drop(interlock);
    }
}
