// In-memory backend for --simulate runs and tests
//
// Records output levels and duty cycles. An echo input linked to a trigger
// output reads high for the round-trip time of the simulated distance,
// starting shortly after each trigger falling edge (HC-SR04 behaviour).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{HalError, Hardware, InputPin, Line, OutputPin, PwmOutput, Result};
use crate::config::SPEED_OF_SOUND_CM_S;

/// Delay between trigger falling edge and echo rising edge
const ECHO_DELAY: Duration = Duration::from_micros(20);

#[derive(Default)]
struct SimState {
    claimed: HashSet<Line>,
    refused: HashSet<Line>,
    releases: HashMap<Line, usize>,
    levels: HashMap<u32, bool>,
    duties: HashMap<(u32, u32), f32>,
    falling_edges: HashMap<u32, Instant>,
    echo_links: HashMap<u32, u32>,
    distance_cm: Option<f64>,
}

#[derive(Clone, Default)]
pub struct SimHardware {
    state: Arc<Mutex<SimState>>,
}

impl SimHardware {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `echo` answer pulses sent on `trigger`
    pub fn link_echo(&self, trigger: u32, echo: u32) {
        self.lock().echo_links.insert(echo, trigger);
    }

    /// Distance reported by linked echo lines; `None` means no echo at all
    pub fn set_distance(&self, distance_cm: Option<f64>) {
        self.lock().distance_cm = distance_cm;
    }

    /// Drive an unlinked input line
    pub fn set_input(&self, pin: u32, high: bool) {
        self.lock().levels.insert(pin, high);
    }

    /// Make the next claims of `line` fail, as a missing device would
    pub fn refuse(&self, line: Line) {
        self.lock().refused.insert(line);
    }

    pub fn level(&self, pin: u32) -> Option<bool> {
        self.lock().levels.get(&pin).copied()
    }

    pub fn duty(&self, chip: u32, channel: u32) -> Option<f32> {
        self.lock().duties.get(&(chip, channel)).copied()
    }

    pub fn is_claimed(&self, line: Line) -> bool {
        self.lock().claimed.contains(&line)
    }

    /// Number of times `line` was released while claimed
    pub fn release_count(&self, line: Line) -> usize {
        self.lock().releases.get(&line).copied().unwrap_or(0)
    }

    fn claim(&self, line: Line) -> Result<()> {
        let mut state = self.lock();
        if state.refused.contains(&line) {
            return Err(HalError::Claim {
                line,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "line refused"),
            });
        }
        if !state.claimed.insert(line) {
            return Err(HalError::Busy { line });
        }
        Ok(())
    }
}

impl Hardware for SimHardware {
    fn output(&self, pin: u32) -> Result<Box<dyn OutputPin>> {
        self.claim(Line::Gpio(pin))?;
        self.lock().levels.insert(pin, false);
        Ok(Box::new(SimOutput {
            hw: self.clone(),
            pin,
        }))
    }

    fn input(&self, pin: u32) -> Result<Box<dyn InputPin>> {
        self.claim(Line::Gpio(pin))?;
        Ok(Box::new(SimInput {
            hw: self.clone(),
            pin,
        }))
    }

    fn pwm(&self, chip: u32, channel: u32) -> Result<Box<dyn PwmOutput>> {
        self.claim(Line::Pwm { chip, channel })?;
        self.lock().duties.insert((chip, channel), 0.0);
        Ok(Box::new(SimPwm {
            hw: self.clone(),
            chip,
            channel,
        }))
    }

    fn release(&self, line: Line) {
        let mut state = self.lock();
        if state.claimed.remove(&line) {
            *state.releases.entry(line).or_insert(0) += 1;
        }
    }
}

struct SimOutput {
    hw: SimHardware,
    pin: u32,
}

impl SimOutput {
    fn write(&mut self, high: bool) -> Result<()> {
        let line = Line::Gpio(self.pin);
        let mut state = self.hw.lock();
        if !state.claimed.contains(&line) {
            return Err(HalError::Released { line });
        }

        let was_high = state.levels.insert(self.pin, high).unwrap_or(false);
        if was_high && !high {
            state.falling_edges.insert(self.pin, Instant::now());
        }
        Ok(())
    }
}

impl OutputPin for SimOutput {
    fn set_high(&mut self) -> Result<()> {
        self.write(true)
    }

    fn set_low(&mut self) -> Result<()> {
        self.write(false)
    }
}

struct SimInput {
    hw: SimHardware,
    pin: u32,
}

impl InputPin for SimInput {
    fn is_high(&mut self) -> Result<bool> {
        let line = Line::Gpio(self.pin);
        let state = self.hw.lock();
        if !state.claimed.contains(&line) {
            return Err(HalError::Released { line });
        }

        let Some(trigger) = state.echo_links.get(&self.pin) else {
            return Ok(state.levels.get(&self.pin).copied().unwrap_or(false));
        };

        let (Some(distance), Some(edge)) = (state.distance_cm, state.falling_edges.get(trigger))
        else {
            return Ok(false);
        };

        let pulse = Duration::from_secs_f64(distance * 2.0 / SPEED_OF_SOUND_CM_S);
        let since_edge = edge.elapsed();
        Ok(since_edge >= ECHO_DELAY && since_edge < ECHO_DELAY + pulse)
    }
}

struct SimPwm {
    hw: SimHardware,
    chip: u32,
    channel: u32,
}

impl PwmOutput for SimPwm {
    fn set_duty(&mut self, duty: f32) -> Result<()> {
        let line = Line::Pwm {
            chip: self.chip,
            channel: self.channel,
        };
        let mut state = self.hw.lock();
        if !state.claimed.contains(&line) {
            return Err(HalError::Released { line });
        }
        state.duties.insert((self.chip, self.channel), duty.clamp(0.0, 1.0));
        Ok(())
    }
}
