// Topics, timings and startup settings
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// Zenoh topics
pub const TOPIC_CONTROL_UPDATE: &str = "car/cmd/control_update"; // client -> server
pub const TOPIC_OBSTACLE_DETECTED: &str = "car/event/obstacle_detected"; // server -> all sessions
pub const TOPIC_SUGGEST_DIRECTION: &str = "car/event/suggest_direction_change"; // server -> all sessions
pub const TOPIC_MOTOR_STATE: &str = "car/state/motors"; // telemetry
pub const TOPIC_HEALTH: &str = "car/state/health"; // health status

// Liveliness tokens, one per control client: car/session/<id>
pub const SESSION_PREFIX: &str = "car/session";
pub const SESSION_KEY_EXPR: &str = "car/session/*";

// Ultrasonic sensor
pub const SPEED_OF_SOUND_CM_S: f64 = 34_300.0;
pub const TRIGGER_PULSE: Duration = Duration::from_micros(10);
pub const MAX_ECHO_TIMEOUT_MS: u64 = 100; // upper bound on each echo edge wait

// Bounded wait for the sampling thread to exit before lines are released anyway
pub const MONITOR_STOP_TIMEOUT: Duration = Duration::from_secs(2);

// Watchdog check period (only used when a command timeout is configured)
pub const WATCHDOG_TICK: Duration = Duration::from_millis(50);

/// Error types for settings loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// One H-bridge channel: PWM enable line plus two direction inputs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MotorConfig {
    pub pwm_chip: u32,
    pub pwm_channel: u32,
    pub input1_pin: u32,
    pub input2_pin: u32,
    pub max_speed: f32,
}

impl MotorConfig {
    fn drive() -> Self {
        Self {
            pwm_chip: 0,
            pwm_channel: 0, // GPIO12
            input1_pin: 5,
            input2_pin: 6,
            max_speed: 1.0,
        }
    }

    fn steering() -> Self {
        Self {
            pwm_chip: 0,
            pwm_channel: 1, // GPIO13
            input1_pin: 20,
            input2_pin: 21,
            max_speed: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SonarConfig {
    pub trig_pin: u32,
    pub echo_pin: u32,
    pub threshold_cm: f64,
    pub sample_interval_ms: u64,
    pub echo_timeout_ms: u64,
}

impl SonarConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }
}

impl Default for SonarConfig {
    fn default() -> Self {
        Self {
            trig_pin: 16,
            echo_pin: 24,
            threshold_cm: 20.0,
            sample_interval_ms: 100,
            echo_timeout_ms: 100,
        }
    }
}

/// Certificate and key for TLS endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Zenoh endpoints to listen on, e.g. "tcp/0.0.0.0:7447"
    pub listen: Vec<String>,
    /// Zenoh endpoints to connect to (routers or peers)
    pub connect: Vec<String>,
    pub tls: Option<TlsConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: vec!["tcp/0.0.0.0:7447".to_string()],
            connect: Vec::new(),
            tls: None,
        }
    }
}

/// Immutable settings, built once at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub drive_motor: MotorConfig,
    pub steering_motor: MotorConfig,
    pub sonar: SonarConfig,
    pub network: NetworkConfig,
    pub pwm_period_ns: u64,
    /// Stop the motors when no command arrives for this long (disabled when absent)
    pub command_timeout_ms: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            drive_motor: MotorConfig::drive(),
            steering_motor: MotorConfig::steering(),
            sonar: SonarConfig::default(),
            network: NetworkConfig::default(),
            pwm_period_ns: 1_000_000, // 1 kHz
            command_timeout_ms: None,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file; missing keys keep their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_json::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, motor) in [("drive_motor", &self.drive_motor), ("steering_motor", &self.steering_motor)] {
            if !(0.0..=1.0).contains(&motor.max_speed) {
                return Err(ConfigError::Invalid(format!(
                    "{}.max_speed must be within [0, 1], got {}",
                    name, motor.max_speed
                )));
            }
            if motor.input1_pin == motor.input2_pin {
                return Err(ConfigError::Invalid(format!(
                    "{} uses GPIO{} for both direction inputs",
                    name, motor.input1_pin
                )));
            }
        }

        if self.sonar.trig_pin == self.sonar.echo_pin {
            return Err(ConfigError::Invalid("sonar trigger and echo share a pin".into()));
        }
        if !(self.sonar.threshold_cm > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "sonar.threshold_cm must be positive, got {}",
                self.sonar.threshold_cm
            )));
        }
        if self.sonar.sample_interval_ms == 0 {
            return Err(ConfigError::Invalid("sonar.sample_interval_ms must be non-zero".into()));
        }
        if !(1..=MAX_ECHO_TIMEOUT_MS).contains(&self.sonar.echo_timeout_ms) {
            return Err(ConfigError::Invalid(format!(
                "sonar.echo_timeout_ms must be within 1..={}, got {}",
                MAX_ECHO_TIMEOUT_MS, self.sonar.echo_timeout_ms
            )));
        }
        if self.pwm_period_ns == 0 {
            return Err(ConfigError::Invalid("pwm_period_ns must be non-zero".into()));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    /// Zenoh session configuration for the control channel
    pub fn zenoh_config(&self) -> Result<zenoh::Config, Box<dyn std::error::Error + Send + Sync>> {
        let mut config = zenoh::Config::default();
        let network = &self.network;

        if !network.listen.is_empty() {
            config.insert_json5("listen/endpoints", &serde_json::to_string(&network.listen)?)?;
        }
        if !network.connect.is_empty() {
            config.insert_json5("connect/endpoints", &serde_json::to_string(&network.connect)?)?;
        }
        if let Some(tls) = &network.tls {
            config.insert_json5(
                "transport/link/tls/listen_certificate",
                &serde_json::to_string(&tls.cert_path)?,
            )?;
            config.insert_json5(
                "transport/link/tls/listen_private_key",
                &serde_json::to_string(&tls.key_path)?,
            )?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let settings = Settings::from_json(
            r#"{
                "sonar": {"threshold_cm": 35.0},
                "drive_motor": {"pwm_chip": 0, "pwm_channel": 0, "input1_pin": 17, "input2_pin": 27, "max_speed": 0.6}
            }"#,
        )
        .unwrap();
        assert_eq!(settings.sonar.threshold_cm, 35.0);
        assert_eq!(settings.sonar.trig_pin, 16);
        assert_eq!(settings.sonar.echo_pin, 24);
        assert_eq!(settings.drive_motor.max_speed, 0.6);
        assert_eq!(settings.drive_motor.input1_pin, 17);
        assert_eq!(settings.steering_motor, MotorConfig::steering());
        assert_eq!(settings.command_timeout(), None);
    }

    #[test]
    fn test_rejects_out_of_range_max_speed() {
        let err = Settings::from_json(
            r#"{"steering_motor": {"pwm_chip": 0, "pwm_channel": 1, "input1_pin": 20, "input2_pin": 21, "max_speed": 1.5}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_incomplete_motor_entry_is_a_parse_error() {
        let err = Settings::from_json(r#"{"drive_motor": {"max_speed": 0.5}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_rejects_shared_sonar_pin() {
        let err = Settings::from_json(r#"{"sonar": {"trig_pin": 24}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_default_timings() {
        let sonar = SonarConfig::default();
        assert_eq!(sonar.sample_interval(), Duration::from_millis(100));
        assert_eq!(sonar.echo_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_rejects_bad_sonar_timings() {
        for json in [
            r#"{"sonar": {"sample_interval_ms": 0}}"#,
            r#"{"sonar": {"echo_timeout_ms": 0}}"#,
            r#"{"sonar": {"echo_timeout_ms": 250}}"#,
        ] {
            let err = Settings::from_json(json).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{}", json);
        }

        let settings = Settings::from_json(r#"{"sonar": {"echo_timeout_ms": 60, "sample_interval_ms": 50}}"#).unwrap();
        assert_eq!(settings.sonar.echo_timeout(), Duration::from_millis(60));
    }
}
