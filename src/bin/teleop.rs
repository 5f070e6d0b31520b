// Keyboard teleop: W/S drive, A/D steer, R/F speed, Space stop, Q quit
//
// Holds a liveliness token for as long as it runs, so the runtime stops the
// motors when this process exits or loses the link.
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use rover_interlock::config::{
    SESSION_PREFIX, TOPIC_CONTROL_UPDATE, TOPIC_OBSTACLE_DETECTED, TOPIC_SUGGEST_DIRECTION,
};
use rover_interlock::messages::{ControlUpdate, Joystick};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const SPEEDS: [f32; 3] = [0.3, 0.6, 1.0];
const INPUT_TIMEOUT_MS: u64 = 150; // Release the stick after this much time with no input

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let mut config = zenoh::Config::default();
    if let Some(endpoint) = std::env::args().nth(1) {
        config.insert_json5("connect/endpoints", &serde_json::to_string(&[endpoint])?)?;
    }

    info!("Opening Zenoh session...");
    let session = zenoh::open(config).await?;
    let publisher = session.declare_publisher(TOPIC_CONTROL_UPDATE).await?;

    let token_key = format!("{}/{}", SESSION_PREFIX, session.zid());
    let _token = session.liveliness().declare_token(token_key.as_str()).await?;
    info!("Session: {}", token_key);

    for topic in [TOPIC_OBSTACLE_DETECTED, TOPIC_SUGGEST_DIRECTION] {
        let subscriber = session.declare_subscriber(topic).await?;
        tokio::spawn(async move {
            while let Ok(sample) = subscriber.recv_async().await {
                let payload = sample.payload().to_bytes();
                warn!("{}: {}", sample.key_expr(), String::from_utf8_lossy(&payload));
            }
        });
    }

    info!("Controls: W/S=drive, A/D=steer, R/F=speed, Space=stop, Q=quit");
    info!("Speed: LOW");

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut speed_idx: usize = 0;
    let mut stick = Joystick::default();
    let mut last_movement_input = Instant::now();

    loop {
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                match code {
                    KeyCode::Char('w') if pressed => {
                        stick.y = SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('s') if pressed => {
                        stick.y = -SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('a') if pressed => {
                        stick.x = -SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char('d') if pressed => {
                        stick.x = SPEEDS[speed_idx];
                        last_movement_input = Instant::now();
                    }
                    KeyCode::Char(' ') if pressed => stick = Joystick::default(),

                    KeyCode::Char('r') if pressed => {
                        speed_idx = (speed_idx + 1).min(2);
                        print_speed(speed_idx);
                    }
                    KeyCode::Char('f') if pressed => {
                        speed_idx = speed_idx.saturating_sub(1);
                        print_speed(speed_idx);
                    }

                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => {}
                }
            }
        }

        if last_movement_input.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
            stick = Joystick::default();
        }

        let update = ControlUpdate {
            joystick: stick,
            ..ControlUpdate::default()
        };
        publisher.put(serde_json::to_string(&update)?).await?;
    }

    // Leave the rover stopped on the way out
    publisher.put(serde_json::to_string(&ControlUpdate::default())?).await?;

    Ok(())
}

fn print_speed(idx: usize) {
    let label = ["LOW", "MED", "HIGH"][idx];
    info!("Speed: {}", label);
}
