//! Mock Hardware Implementations
//!
//! Provides simulated devices for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockMotor` - Motor with speed-limited motion and a move history
//! - `MockTimer` - Preset-time gating timer, also readable as an input
//! - `MockScaler` - Counter that can gate in preset-count mode
//! - `MockInput` - Analog or digital input with a scripted value sequence
//! - `MockRelay` - Shutter relay that records every state change
//! - `MockDigitalOutput` - Output register that records every write

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

use crate::hardware::capabilities::{
    CounterMode, DigitalOutput, InputDevice, Motor, Relay, Triggerable,
};

// =============================================================================
// MockMotor - Simulated Motor
// =============================================================================

#[derive(Debug)]
struct MotorState {
    position: f64,
    motion: Option<Motion>,
    speed: f64,
    fast_mode: bool,
    moves: Vec<f64>,
    aborts: usize,
    fail_at_move: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Motion {
    from: f64,
    to: f64,
    started: Instant,
    duration: Duration,
}

impl Motion {
    fn position_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= self.duration || self.duration.is_zero() {
            return self.to;
        }
        let fraction = elapsed.as_secs_f64() / self.duration.as_secs_f64();
        self.from + (self.to - self.from) * fraction
    }

    fn is_done(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.duration
    }
}

/// Mock motor with speed-limited motion
///
/// `move_absolute` returns immediately; `is_busy` stays true until the
/// simulated travel time has elapsed. Every commanded destination is kept
/// in a history for assertions.
///
/// # Example
///
/// ```rust,ignore
/// let motor = MockMotor::new("m1").with_speed(1000.0);
/// motor.move_absolute(2.0).await?;
/// while motor.is_busy().await? {}
/// assert_eq!(motor.get_position().await?, 2.0);
/// ```
pub struct MockMotor {
    name: String,
    precision: usize,
    units: String,
    state: Arc<RwLock<MotorState>>,
}

impl MockMotor {
    /// Create a mock motor at position 0.0 moving 1000 units/s
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            precision: 3,
            units: "mm".to_string(),
            state: Arc::new(RwLock::new(MotorState {
                position: 0.0,
                motion: None,
                speed: 1000.0,
                fast_mode: false,
                moves: Vec::new(),
                aborts: 0,
                fail_at_move: None,
            })),
        }
    }

    /// Set the initial position
    pub fn with_position(self, position: f64) -> Self {
        if let Ok(mut state) = self.state.try_write() {
            state.position = position;
        }
        self
    }

    /// Set the speed in units per second
    pub fn with_speed(self, speed: f64) -> Self {
        if let Ok(mut state) = self.state.try_write() {
            state.speed = speed;
        }
        self
    }

    /// Set the display precision
    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    /// Set the user units
    pub fn with_units(mut self, units: &str) -> Self {
        self.units = units.to_string();
        self
    }

    /// Make the n-th commanded move (0-based) fail with a controller error
    pub fn failing_at_move(self, index: usize) -> Self {
        if let Ok(mut state) = self.state.try_write() {
            state.fail_at_move = Some(index);
        }
        self
    }

    /// All destinations commanded so far, in order
    pub async fn move_history(&self) -> Vec<f64> {
        self.state.read().await.moves.clone()
    }

    /// Number of soft aborts received
    pub async fn abort_count(&self) -> usize {
        self.state.read().await.aborts
    }

    /// Whether fast mode is currently enabled
    pub async fn fast_mode(&self) -> bool {
        self.state.read().await.fast_mode
    }
}

#[async_trait]
impl Motor for MockMotor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_position(&self) -> Result<f64> {
        let mut state = self.state.write().await;
        let now = Instant::now();
        if let Some(motion) = state.motion {
            state.position = motion.position_at(now);
            if motion.is_done(now) {
                state.motion = None;
            }
        }
        Ok(state.position)
    }

    async fn move_absolute(&self, position: f64) -> Result<()> {
        let mut state = self.state.write().await;
        let index = state.moves.len();
        if state.fail_at_move == Some(index) {
            return Err(anyhow!("{}: controller rejected move to {}", self.name, position));
        }
        state.moves.push(position);

        let now = Instant::now();
        let from = match state.motion {
            Some(motion) => motion.position_at(now),
            None => state.position,
        };
        let distance = (position - from).abs();
        let duration = if state.speed > 0.0 {
            Duration::from_secs_f64(distance / state.speed)
        } else {
            Duration::ZERO
        };
        state.position = from;
        state.motion = Some(Motion {
            from,
            to: position,
            started: now,
            duration,
        });
        Ok(())
    }

    async fn is_busy(&self) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state
            .motion
            .map(|motion| !motion.is_done(Instant::now()))
            .unwrap_or(false))
    }

    async fn soft_abort(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(motion) = state.motion.take() {
            state.position = motion.position_at(Instant::now());
        }
        state.aborts += 1;
        Ok(())
    }

    fn precision(&self) -> usize {
        self.precision
    }

    fn units(&self) -> &str {
        &self.units
    }

    async fn speed(&self) -> Result<f64> {
        Ok(self.state.read().await.speed)
    }

    async fn set_speed(&self, speed: f64) -> Result<()> {
        if speed <= 0.0 {
            return Err(anyhow!("{}: illegal speed {}", self.name, speed));
        }
        self.state.write().await.speed = speed;
        Ok(())
    }

    async fn set_fast_mode(&self, enabled: bool) -> Result<()> {
        self.state.write().await.fast_mode = enabled;
        Ok(())
    }
}

// =============================================================================
// MockTimer - Simulated Gating Timer
// =============================================================================

#[derive(Debug)]
struct TimerState {
    mode: CounterMode,
    started: Option<Instant>,
    preset: f64,
    presets: Vec<f64>,
    stops: usize,
}

/// Mock timer that counts real (tokio) time
///
/// In preset mode `start(seconds)` keeps the timer busy for that long.
/// Reading it returns the elapsed counting time.
pub struct MockTimer {
    name: String,
    gate: String,
    state: Arc<RwLock<TimerState>>,
}

impl MockTimer {
    /// Create a timer on its own gate signal
    pub fn new(name: &str) -> Self {
        Self::on_gate(name, name)
    }

    /// Create a timer wired to the named gate signal
    pub fn on_gate(name: &str, gate: &str) -> Self {
        Self {
            name: name.to_string(),
            gate: gate.to_string(),
            state: Arc::new(RwLock::new(TimerState {
                mode: CounterMode::Counter,
                started: None,
                preset: 0.0,
                presets: Vec::new(),
                stops: 0,
            })),
        }
    }

    /// Every preset passed to `start`, in order
    pub async fn preset_history(&self) -> Vec<f64> {
        self.state.read().await.presets.clone()
    }

    /// Number of explicit stops received
    pub async fn stop_count(&self) -> usize {
        self.state.read().await.stops
    }
}

#[async_trait]
impl Triggerable for MockTimer {
    fn name(&self) -> &str {
        &self.name
    }

    fn gate(&self) -> &str {
        &self.gate
    }

    async fn mode(&self) -> Result<CounterMode> {
        Ok(self.state.read().await.mode)
    }

    async fn set_mode(&self, mode: CounterMode) -> Result<()> {
        self.state.write().await.mode = mode;
        Ok(())
    }

    async fn start(&self, preset: f64) -> Result<()> {
        if !preset.is_finite() || preset < 0.0 {
            return Err(anyhow!("{}: invalid preset {}", self.name, preset));
        }
        let mut state = self.state.write().await;
        state.started = Some(Instant::now());
        state.preset = preset;
        state.presets.push(preset);
        Ok(())
    }

    async fn is_busy(&self) -> Result<bool> {
        let state = self.state.read().await;
        Ok(match (state.mode, state.started) {
            (CounterMode::Preset, Some(started)) => {
                started.elapsed() < Duration::from_secs_f64(state.preset)
            }
            _ => false,
        })
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(started) = state.started {
            state.preset = started.elapsed().as_secs_f64().min(state.preset);
        }
        state.stops += 1;
        Ok(())
    }
}

#[async_trait]
impl InputDevice for MockTimer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn clear(&self) -> Result<()> {
        self.state.write().await.started = None;
        Ok(())
    }

    async fn read(&self) -> Result<f64> {
        let state = self.state.read().await;
        Ok(match state.started {
            Some(started) => started.elapsed().as_secs_f64().min(state.preset),
            None => 0.0,
        })
    }
}

// =============================================================================
// MockScaler - Simulated Counter
// =============================================================================

#[derive(Debug)]
struct ScalerState {
    mode: CounterMode,
    value: f64,
    script: VecDeque<f64>,
    started: Option<Instant>,
    preset: f64,
    clears: usize,
}

/// Mock scaler with scripted readings
///
/// Each `clear` loads the next scripted value, so the n-th measurement reads
/// the n-th script entry. Once the script runs out the scaler reads zero.
/// In preset mode it gates for `preset / rate` seconds and then reads the
/// preset count.
pub struct MockScaler {
    name: String,
    gate: String,
    rate: f64,
    state: Arc<RwLock<ScalerState>>,
}

impl MockScaler {
    /// Create a scaler counting `rate` counts per second on its own gate
    pub fn new(name: &str, rate: f64) -> Self {
        Self::on_gate(name, name, rate)
    }

    /// Create a scaler wired to the named gate signal
    pub fn on_gate(name: &str, gate: &str, rate: f64) -> Self {
        Self {
            name: name.to_string(),
            gate: gate.to_string(),
            rate,
            state: Arc::new(RwLock::new(ScalerState {
                mode: CounterMode::Counter,
                value: 0.0,
                script: VecDeque::new(),
                started: None,
                preset: 0.0,
                clears: 0,
            })),
        }
    }

    /// Readings returned by successive measurements
    pub fn with_script(self, values: impl IntoIterator<Item = f64>) -> Self {
        if let Ok(mut state) = self.state.try_write() {
            state.script = values.into_iter().collect();
        }
        self
    }

    /// Number of times the scaler was cleared
    pub async fn clear_count(&self) -> usize {
        self.state.read().await.clears
    }
}

#[async_trait]
impl Triggerable for MockScaler {
    fn name(&self) -> &str {
        &self.name
    }

    fn gate(&self) -> &str {
        &self.gate
    }

    async fn mode(&self) -> Result<CounterMode> {
        Ok(self.state.read().await.mode)
    }

    async fn set_mode(&self, mode: CounterMode) -> Result<()> {
        self.state.write().await.mode = mode;
        Ok(())
    }

    async fn start(&self, preset: f64) -> Result<()> {
        if !preset.is_finite() {
            return Err(anyhow!("{}: invalid preset {}", self.name, preset));
        }
        let mut state = self.state.write().await;
        state.started = Some(Instant::now());
        state.preset = preset;
        Ok(())
    }

    async fn is_busy(&self) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(started) = state.started else {
            return Ok(false);
        };
        if state.mode != CounterMode::Preset || self.rate <= 0.0 {
            return Ok(false);
        }
        let Ok(gate_time) = Duration::try_from_secs_f64(state.preset / self.rate) else {
            return Err(anyhow!("{}: invalid preset {}", self.name, state.preset));
        };
        let busy = started.elapsed() < gate_time;
        if !busy {
            state.value = state.preset;
            state.started = None;
        }
        Ok(busy)
    }

    async fn stop(&self) -> Result<()> {
        self.state.write().await.started = None;
        Ok(())
    }
}

#[async_trait]
impl InputDevice for MockScaler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.value = state.script.pop_front().unwrap_or(0.0);
        state.clears += 1;
        Ok(())
    }

    async fn read(&self) -> Result<f64> {
        Ok(self.state.read().await.value)
    }

    fn is_counter(&self) -> bool {
        true
    }
}

// =============================================================================
// MockInput - Scripted Input
// =============================================================================

/// Mock input whose successive reads walk a scripted sequence
///
/// The last scripted value repeats once the script is exhausted.
pub struct MockInput {
    name: String,
    precision: usize,
    values: Arc<RwLock<VecDeque<f64>>>,
    reads: Arc<RwLock<usize>>,
}

impl MockInput {
    /// Create an input that always reads `value`
    pub fn constant(name: &str, value: f64) -> Self {
        Self::scripted(name, [value])
    }

    /// Create an input that reads `values` in order
    pub fn scripted(name: &str, values: impl IntoIterator<Item = f64>) -> Self {
        Self {
            name: name.to_string(),
            precision: 3,
            values: Arc::new(RwLock::new(values.into_iter().collect())),
            reads: Arc::new(RwLock::new(0)),
        }
    }

    /// Set the display precision
    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    /// Number of reads performed
    pub async fn read_count(&self) -> usize {
        *self.reads.read().await
    }
}

#[async_trait]
impl InputDevice for MockInput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }

    async fn read(&self) -> Result<f64> {
        *self.reads.write().await += 1;
        let mut values = self.values.write().await;
        let value = if values.len() > 1 {
            values.pop_front()
        } else {
            values.front().copied()
        };
        value.ok_or_else(|| anyhow!("{}: no value available", self.name))
    }

    fn precision(&self) -> usize {
        self.precision
    }
}

// =============================================================================
// MockRelay / MockDigitalOutput
// =============================================================================

/// Mock shutter relay recording each commanded state
#[derive(Default)]
pub struct MockRelay {
    name: String,
    history: Arc<RwLock<Vec<bool>>>,
}

impl MockRelay {
    /// Create a closed relay
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Every state written, in order (`true` = open)
    pub async fn history(&self) -> Vec<bool> {
        self.history.read().await.clone()
    }
}

#[async_trait]
impl Relay for MockRelay {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_open(&self, open: bool) -> Result<()> {
        self.history.write().await.push(open);
        Ok(())
    }
}

/// Mock output register recording each write
#[derive(Default)]
pub struct MockDigitalOutput {
    name: String,
    writes: Arc<RwLock<Vec<u64>>>,
}

impl MockDigitalOutput {
    /// Create an output register
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            writes: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Every value written, in order
    pub async fn writes(&self) -> Vec<u64> {
        self.writes.read().await.clone()
    }
}

#[async_trait]
impl DigitalOutput for MockDigitalOutput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, value: u64) -> Result<()> {
        self.writes.write().await.push(value);
        Ok(())
    }
}
