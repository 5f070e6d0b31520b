// Control channel over zenoh, wired to the safety interlock
//
// Sessions are zenoh liveliness tokens under car/session/*: a token appearing
// is a connect, a token disappearing (client quit, crashed or lost the link)
// is a disconnect and stops the vehicle.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};
use zenoh::sample::SampleKind;

use crate::config::{
    Settings, SESSION_KEY_EXPR, TOPIC_CONTROL_UPDATE, TOPIC_HEALTH, TOPIC_MOTOR_STATE,
    TOPIC_OBSTACLE_DETECTED, TOPIC_SUGGEST_DIRECTION, WATCHDOG_TICK,
};
use crate::hal::Hardware;
use crate::interlock::{motion_channel, MotionHandle, MotionRequest, Outcome, SafetyInterlock};
use crate::messages::{ControlUpdate, Notification};
use crate::motor::{VehicleCommand, VehicleController};
use crate::sonar::{Hcsr04, ObstacleMonitor};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Monitor = ObstacleMonitor<Hcsr04, MotionHandle>;

/// Topic and JSON payload of everything one outcome publishes, in order:
/// notifications first, then motor telemetry and health
fn outbound(outcome: &Outcome) -> serde_json::Result<Vec<(&'static str, String)>> {
    let mut messages = Vec::with_capacity(outcome.notifications.len() + 2);
    for notification in &outcome.notifications {
        let topic = match notification {
            Notification::ObstacleDetected(_) => TOPIC_OBSTACLE_DETECTED,
            Notification::SuggestDirectionChange(_) => TOPIC_SUGGEST_DIRECTION,
        };
        messages.push((topic, notification.to_json()?));
    }
    messages.push((TOPIC_MOTOR_STATE, serde_json::to_string(&outcome.state)?));
    messages.push((TOPIC_HEALTH, serde_json::to_string(&outcome.health)?));
    Ok(messages)
}

/// Parse one control_update payload and queue it; false when it was dropped
fn dispatch_control(payload: &[u8], motion: &MotionHandle) -> bool {
    match ControlUpdate::from_slice(payload) {
        Ok(update) => {
            debug!("control_update: {:?}", update);
            motion.submit(VehicleCommand::from(&update))
        }
        Err(e) => {
            warn!("Failed to parse control_update: {}", e);
            false
        }
    }
}

/// Control sessions, tracked through their liveliness tokens
#[derive(Debug, Default)]
struct Sessions {
    active: HashSet<String>,
}

impl Sessions {
    fn len(&self) -> usize {
        self.active.len()
    }

    fn on_liveliness(&mut self, kind: SampleKind, id: &str, motion: &MotionHandle) {
        match kind {
            SampleKind::Put => {
                if self.active.insert(id.to_string()) {
                    info!("Client connected: {} ({} active)", id, self.active.len());
                }
            }
            SampleKind::Delete => {
                self.active.remove(id);
                info!("Client disconnected: {} ({} active)", id, self.active.len());
                // Never keep driving without a control link
                motion.link_lost(id);
            }
        }
    }
}

/// Publishers for everything the server pushes to clients
struct Broadcaster<'a> {
    obstacle: zenoh::pubsub::Publisher<'a>,
    suggestion: zenoh::pubsub::Publisher<'a>,
    motors: zenoh::pubsub::Publisher<'a>,
    health: zenoh::pubsub::Publisher<'a>,
}

impl Broadcaster<'_> {
    async fn publish(&self, outcome: &Outcome, sessions: usize) -> Result<(), BoxError> {
        for (topic, payload) in outbound(outcome)? {
            let publisher = match topic {
                TOPIC_OBSTACLE_DETECTED => &self.obstacle,
                TOPIC_SUGGEST_DIRECTION => &self.suggestion,
                TOPIC_MOTOR_STATE => &self.motors,
                _ => &self.health,
            };
            publisher.put(payload).await?;
            if topic.starts_with("car/event/") {
                info!("Broadcast {} to {} session(s)", topic, sessions);
            }
        }
        Ok(())
    }
}

/// Claim the hardware, run the control channel until Ctrl+C, tear down
///
/// Motors and sensor are claimed before the channel opens, so a claim
/// failure means no command is ever accepted. They are torn down together,
/// sensor first.
pub async fn run(settings: Settings, hardware: Arc<dyn Hardware>) -> Result<(), BoxError> {
    info!("Claiming motors and ultrasonic sensor...");
    let controller = VehicleController::new(&settings, hardware.clone())?;
    let sensor = Hcsr04::new(
        hardware.as_ref(),
        settings.sonar.trig_pin,
        settings.sonar.echo_pin,
        settings.sonar.echo_timeout(),
    )?;

    let (motion, requests) = motion_channel();
    let (outcome_tx, mut outcomes) = mpsc::unbounded_channel();
    let mut monitor = ObstacleMonitor::new(sensor, &settings.sonar, motion.clone(), hardware);

    let interlock = SafetyInterlock::new(controller, settings.command_timeout());
    let interlock_task = tokio::spawn(interlock.run(requests, outcome_tx));

    let result = serve(&settings, &motion, &mut outcomes, &mut monitor).await;

    info!("Shutting down...");
    // Stopping the sampling thread can wait up to 2 s, keep it off the executor
    if let Err(e) = tokio::task::spawn_blocking(move || monitor.cleanup()).await {
        warn!("Monitor cleanup failed: {}", e);
    }
    motion.shutdown();
    match interlock_task.await {
        Ok(interlock) => interlock.into_controller().cleanup(),
        Err(e) => warn!("Interlock task failed: {}", e),
    }
    info!("Hardware released");

    result
}

async fn serve(
    settings: &Settings,
    motion: &MotionHandle,
    outcomes: &mut mpsc::UnboundedReceiver<Outcome>,
    monitor: &mut Monitor,
) -> Result<(), BoxError> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(settings.zenoh_config()?).await?;

    info!("Setting up publishers and subscribers...");
    let commands = session.declare_subscriber(TOPIC_CONTROL_UPDATE).await?;
    let liveliness = session
        .liveliness()
        .declare_subscriber(SESSION_KEY_EXPR)
        .history(true)
        .await?;
    let broadcaster = Broadcaster {
        obstacle: session.declare_publisher(TOPIC_OBSTACLE_DETECTED).await?,
        suggestion: session.declare_publisher(TOPIC_SUGGEST_DIRECTION).await?,
        motors: session.declare_publisher(TOPIC_MOTOR_STATE).await?,
        health: session.declare_publisher(TOPIC_HEALTH).await?,
    };

    monitor.start_monitoring()?;

    let mut sessions = Sessions::default();
    let watchdog_enabled = settings.command_timeout().is_some();
    let mut watchdog = interval(WATCHDOG_TICK);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Control channel ready");
    info!("Subscribed to: {}, {}", TOPIC_CONTROL_UPDATE, SESSION_KEY_EXPR);
    info!("Publishing to: {}, {}", TOPIC_OBSTACLE_DETECTED, TOPIC_SUGGEST_DIRECTION);
    if let Some(timeout) = settings.command_timeout() {
        info!("Command watchdog: {} ms", timeout.as_millis());
    }

    loop {
        tokio::select! {
            sample = commands.recv_async() => {
                let sample = sample?;
                dispatch_control(&sample.payload().to_bytes(), motion);
            }

            sample = liveliness.recv_async() => {
                let sample = sample?;
                sessions.on_liveliness(sample.kind(), sample.key_expr().as_str(), motion);
            }

            Some(outcome) = outcomes.recv() => {
                if let Err(e) = broadcaster.publish(&outcome, sessions.len()).await {
                    warn!("Failed to publish outcome: {}", e);
                }
            }

            _ = watchdog.tick(), if watchdog_enabled => {
                motion.send(MotionRequest::WatchdogTick);
            }

            _ = &mut shutdown => {
                info!("Ctrl+C received");
                break;
            }
        }
    }

    Ok(())
}
