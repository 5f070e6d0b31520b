// Message types on the control channel

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::motor::VehicleCommand;

// Command from a control client -> runtime
// Every field is optional and a wrong-typed value counts as missing, so any
// JSON object yields some well-defined command.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ControlUpdate {
    #[serde(default, deserialize_with = "lenient_joystick")]
    pub joystick: Joystick,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub gyro_enabled: bool,
    #[serde(default, deserialize_with = "lenient_f32")]
    pub gyro_x: f32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Joystick {
    #[serde(default, deserialize_with = "lenient_f32")]
    pub x: f32,
    #[serde(default, deserialize_with = "lenient_f32")]
    pub y: f32,
}

impl ControlUpdate {
    pub fn from_slice(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

// Clamping happens in VehicleCommand::new
impl From<&ControlUpdate> for VehicleCommand {
    fn from(update: &ControlUpdate) -> Self {
        VehicleCommand::new(
            update.joystick.x,
            update.joystick.y,
            update.gyro_enabled,
            update.gyro_x,
        )
    }
}

fn lenient_f32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_f64().map(|v| v as f32).unwrap_or(0.0))
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_bool().unwrap_or(false))
}

fn lenient_joystick<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Joystick, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// Broadcast when the interlock stops the vehicle for an obstacle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObstacleDetected {
    pub distance: f64,
    pub message: String,
    pub action: String,
}

impl ObstacleDetected {
    pub fn new(distance: f64) -> Self {
        Self {
            distance,
            message: format!("Obstacle detected at {} cm", distance),
            action: "stop".to_string(),
        }
    }
}

/// Broadcast right after ObstacleDetected
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectionSuggestion {
    pub message: String,
    pub suggested_action: String,
}

impl Default for DirectionSuggestion {
    fn default() -> Self {
        Self {
            message: "Change direction to avoid the obstacle".to_string(),
            suggested_action: "reverse_or_turn".to_string(),
        }
    }
}

/// Unsolicited server -> client messages
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    ObstacleDetected(ObstacleDetected),
    SuggestDirectionChange(DirectionSuggestion),
}

impl Notification {
    /// Event name on the control channel
    pub fn event(&self) -> &'static str {
        match self {
            Notification::ObstacleDetected(_) => "obstacle_detected",
            Notification::SuggestDirectionChange(_) => "suggest_direction_change",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Notification::ObstacleDetected(msg) => serde_json::to_string(msg),
            Notification::SuggestDirectionChange(msg) => serde_json::to_string(msg),
        }
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    ObstacleHold,
}
