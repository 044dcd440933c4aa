//! Shared rig for scan engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use daq_scan::hardware::mock::{
    MockDigitalOutput, MockInput, MockMotor, MockRelay, MockScaler, MockTimer,
};
use daq_scan::hardware::{Motor, Relay};
use daq_scan::interrupt::InterruptFlag;
use daq_scan::Records;

/// Gate time of the preset-time measurement used throughout the tests
pub const PRESET: &str = "0.001 t1";

/// Two motors, a timer gating a scripted scaler, and a shutter
pub struct Rig {
    pub m1: Arc<MockMotor>,
    pub m2: Arc<MockMotor>,
    pub timer: Arc<MockTimer>,
    pub s1: Arc<MockScaler>,
    pub shutter: Arc<MockRelay>,
    pub permit: Arc<MockInput>,
    pub fault: Arc<MockInput>,
    pub reset: Arc<MockDigitalOutput>,
}

impl Rig {
    /// `s1` reads `script` on successive measurements
    pub fn new(script: impl IntoIterator<Item = f64>) -> Self {
        Self {
            m1: Arc::new(MockMotor::new("m1")),
            m2: Arc::new(MockMotor::new("m2")),
            timer: Arc::new(MockTimer::new("t1")),
            s1: Arc::new(MockScaler::on_gate("s1", "t1", 1000.0).with_script(script)),
            shutter: Arc::new(MockRelay::new("shutter")),
            permit: Arc::new(MockInput::constant("permit", 1.0)),
            fault: Arc::new(MockInput::constant("fault", 0.0)),
            reset: Arc::new(MockDigitalOutput::new("reset")),
        }
    }

    /// Replace `m1`
    pub fn with_m1(mut self, m1: MockMotor) -> Self {
        self.m1 = Arc::new(m1);
        self
    }

    /// Replace the permit and fault inputs
    pub fn with_handler_inputs(mut self, permit: MockInput, fault: MockInput) -> Self {
        self.permit = Arc::new(permit);
        self.fault = Arc::new(fault);
        self
    }

    pub fn records(&self) -> Arc<Records> {
        self.records_with_m1(self.m1.clone())
    }

    /// Records with `m1` standing in for the rig's first motor
    pub fn records_with_m1(&self, m1: Arc<dyn Motor>) -> Arc<Records> {
        self.assemble(m1, self.shutter.clone())
    }

    /// Records with `shutter` standing in for the rig's shutter
    pub fn records_with_shutter(&self, shutter: Arc<dyn Relay>) -> Arc<Records> {
        self.assemble(self.m1.clone(), shutter)
    }

    fn assemble(&self, m1: Arc<dyn Motor>, shutter: Arc<dyn Relay>) -> Arc<Records> {
        Arc::new(
            Records::new()
                .with_motor(m1)
                .with_motor(self.m2.clone())
                .with_triggerable(self.timer.clone())
                .with_input(self.timer.clone())
                .with_triggerable(self.s1.clone())
                .with_input(self.s1.clone())
                .with_relay(shutter)
                .with_input(self.permit.clone())
                .with_input(self.fault.clone())
                .with_output(self.reset.clone()),
        )
    }
}

/// Shutter that raises an interrupt when it closes for the n-th time.
///
/// Under the per-datapoint shutter policy the shutter closes right after the
/// gate finishes, so the interrupt is pending when the scan next moves.
pub struct InterruptingShutter {
    inner: Arc<MockRelay>,
    interrupt: InterruptFlag,
    at_close: usize,
    abort: bool,
    closes: AtomicUsize,
}

impl InterruptingShutter {
    /// Request a pause on close `at_close` (0-based)
    pub fn pausing(inner: Arc<MockRelay>, interrupt: InterruptFlag, at_close: usize) -> Self {
        Self {
            inner,
            interrupt,
            at_close,
            abort: false,
            closes: AtomicUsize::new(0),
        }
    }

    /// Request an abort on close `at_close` (0-based)
    pub fn aborting(inner: Arc<MockRelay>, interrupt: InterruptFlag, at_close: usize) -> Self {
        Self {
            abort: true,
            ..Self::pausing(inner, interrupt, at_close)
        }
    }
}

#[async_trait]
impl Relay for InterruptingShutter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn set_open(&self, open: bool) -> anyhow::Result<()> {
        self.inner.set_open(open).await?;
        if !open && self.closes.fetch_add(1, Ordering::SeqCst) == self.at_close {
            if self.abort {
                self.interrupt.request_abort();
            } else {
                self.interrupt.request_pause();
            }
        }
        Ok(())
    }
}

/// Motor that raises an interrupt when it is commanded for the n-th time
pub struct InterruptingMotor {
    inner: Arc<MockMotor>,
    interrupt: InterruptFlag,
    at_move: usize,
    abort: bool,
    moves: AtomicUsize,
}

impl InterruptingMotor {
    /// Request a pause on move `at_move` (0-based)
    pub fn pausing(inner: Arc<MockMotor>, interrupt: InterruptFlag, at_move: usize) -> Self {
        Self {
            inner,
            interrupt,
            at_move,
            abort: false,
            moves: AtomicUsize::new(0),
        }
    }

    /// Request an abort on move `at_move` (0-based)
    pub fn aborting(inner: Arc<MockMotor>, interrupt: InterruptFlag, at_move: usize) -> Self {
        Self {
            abort: true,
            ..Self::pausing(inner, interrupt, at_move)
        }
    }
}

#[async_trait]
impl Motor for InterruptingMotor {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_position(&self) -> anyhow::Result<f64> {
        self.inner.get_position().await
    }

    async fn move_absolute(&self, position: f64) -> anyhow::Result<()> {
        self.inner.move_absolute(position).await?;
        if self.moves.fetch_add(1, Ordering::SeqCst) == self.at_move {
            if self.abort {
                self.interrupt.request_abort();
            } else {
                self.interrupt.request_pause();
            }
        }
        Ok(())
    }

    async fn is_busy(&self) -> anyhow::Result<bool> {
        self.inner.is_busy().await
    }

    async fn soft_abort(&self) -> anyhow::Result<()> {
        self.inner.soft_abort().await
    }

    fn precision(&self) -> usize {
        self.inner.precision()
    }

    fn units(&self) -> &str {
        self.inner.units()
    }

    async fn speed(&self) -> anyhow::Result<f64> {
        self.inner.speed().await
    }

    async fn set_speed(&self, speed: f64) -> anyhow::Result<()> {
        self.inner.set_speed(speed).await
    }

    async fn set_fast_mode(&self, enabled: bool) -> anyhow::Result<()> {
        self.inner.set_fast_mode(enabled).await
    }
}

/// Read a file written by a scan
pub async fn read_lines(path: &std::path::Path) -> Vec<String> {
    tokio::fs::read_to_string(path)
        .await
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}
