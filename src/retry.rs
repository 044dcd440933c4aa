//! Pause/abort retry wrapper for blocking scan operations.
//!
//! Moving the motors, waiting for them to stop and acquiring a measurement
//! all run through [`PauseRetry::run`]. A `PauseRequested` result never
//! escapes the wrapper: the injected [`PauseHandler`] decides whether the
//! operation is retried, the scan stops once the motors are at rest, or the
//! motors are soft-aborted and the scan ends as interrupted.

use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{info, warn};

use crate::coordinator::wait_for_motor_array_stop;
use crate::error::{ScanError, ScanResult};
use crate::hardware::{Motor, Triggerable};
use crate::interrupt::{InterruptFlag, PauseDecision, PauseHandler};

/// Blocking operation being protected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrySite {
    /// Issuing absolute moves
    Move,
    /// Waiting for the motors to come to rest
    WaitForStop,
    /// Acquiring (and reading out) a measurement
    Acquire,
}

impl std::fmt::Display for RetrySite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetrySite::Move => write!(f, "move"),
            RetrySite::WaitForStop => write!(f, "wait_for_stop"),
            RetrySite::Acquire => write!(f, "acquire"),
        }
    }
}

/// Retry policy shared by every blocking step of one scan
pub struct PauseRetry {
    scan: String,
    motors: Vec<Arc<dyn Motor>>,
    gating_device: Option<Arc<dyn Triggerable>>,
    handler: Arc<dyn PauseHandler>,
    interrupt: InterruptFlag,
}

impl PauseRetry {
    /// Create the wrapper for a scan moving `motors`
    pub fn new(
        scan: &str,
        motors: Vec<Arc<dyn Motor>>,
        handler: Arc<dyn PauseHandler>,
        interrupt: InterruptFlag,
    ) -> Self {
        Self {
            scan: scan.to_string(),
            motors,
            gating_device: None,
            handler,
            interrupt,
        }
    }

    /// Device stopped after an abort at the acquire site
    pub fn with_gating_device(mut self, device: Option<Arc<dyn Triggerable>>) -> Self {
        self.gating_device = device;
        self
    }

    /// Run `op` against `state` until it completes without a pause.
    ///
    /// Any result other than `PauseRequested` is returned unchanged, after
    /// the site-specific abort action when that result is `Interrupted`.
    pub async fn run<S, F>(&self, site: RetrySite, state: &mut S, mut op: F) -> ScanResult<()>
    where
        F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, ScanResult<()>>,
    {
        loop {
            match op(&mut *state).await {
                Err(ScanError::PauseRequested) => self.resolve_pause(site).await?,
                Err(ScanError::Interrupted) => {
                    self.after_abort(site).await;
                    return Err(ScanError::Interrupted);
                }
                other => return other,
            }
        }
    }

    /// Ask the pause handler how to continue.
    ///
    /// `Ok(())` means the operation should be retried.
    pub async fn resolve_pause(&self, site: RetrySite) -> ScanResult<()> {
        self.interrupt.acknowledge_pause();
        let decision = self.handler.handle_pause(&self.scan).await?;

        match decision {
            PauseDecision::Resume | PauseDecision::PauseAgain => {
                info!(scan = %self.scan, site = %site, "Retrying the last scan step.");
                Ok(())
            }
            PauseDecision::Stop => {
                info!(scan = %self.scan, "Waiting for the motors to stop moving.");
                wait_for_motor_array_stop(&self.motors, &self.interrupt, true).await?;
                Err(ScanError::StopRequested)
            }
            PauseDecision::Abort => {
                info!(scan = %self.scan, "Aborting current motor moves.");
                for motor in &self.motors {
                    if let Err(e) = motor.soft_abort().await {
                        warn!(motor = %motor.name(), error = %e, "Soft abort failed");
                    }
                }
                self.after_abort(site).await;
                Err(ScanError::Interrupted)
            }
        }
    }

    async fn after_abort(&self, site: RetrySite) {
        if site != RetrySite::Acquire {
            return;
        }
        if let Some(device) = &self.gating_device {
            if let Err(e) = device.stop().await {
                warn!(device = %device.name(), error = %e, "Failed to stop measurement device");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockMotor, MockTimer};
    use crate::interrupt::ScriptedPauseHandler;

    struct Attempts {
        count: usize,
        pauses_left: usize,
    }

    impl Attempts {
        async fn step(&mut self) -> ScanResult<()> {
            self.count += 1;
            if self.pauses_left > 0 {
                self.pauses_left -= 1;
                return Err(ScanError::PauseRequested);
            }
            Ok(())
        }
    }

    fn retry_with(
        decisions: Vec<PauseDecision>,
        motor: Arc<MockMotor>,
    ) -> (PauseRetry, Arc<ScriptedPauseHandler>) {
        let handler = Arc::new(ScriptedPauseHandler::new(decisions));
        let retry = PauseRetry::new(
            "scan1",
            vec![motor as Arc<dyn Motor>],
            handler.clone(),
            InterruptFlag::new(),
        );
        (retry, handler)
    }

    #[tokio::test]
    async fn resume_retries_the_operation() {
        let (retry, handler) = retry_with(vec![], Arc::new(MockMotor::new("m1")));
        let mut attempts = Attempts {
            count: 0,
            pauses_left: 2,
        };

        retry
            .run(RetrySite::Move, &mut attempts, |a| Box::pin(a.step()))
            .await
            .unwrap();

        assert_eq!(attempts.count, 3);
        assert_eq!(handler.calls().await, 2);
    }

    #[tokio::test]
    async fn stop_waits_and_reports_stop() {
        let motor = Arc::new(MockMotor::new("m1").with_speed(100.0));
        motor.move_absolute(0.5).await.unwrap();
        let (retry, _) = retry_with(vec![PauseDecision::Stop], motor.clone());
        let mut attempts = Attempts {
            count: 0,
            pauses_left: 1,
        };

        let result = retry
            .run(RetrySite::Move, &mut attempts, |a| Box::pin(a.step()))
            .await;

        assert!(matches!(result, Err(ScanError::StopRequested)));
        assert_eq!(attempts.count, 1);
        assert!(!motor.is_busy().await.unwrap());
    }

    #[tokio::test]
    async fn abort_soft_aborts_motors_and_stops_gate() {
        let motor = Arc::new(MockMotor::new("m1"));
        let timer = Arc::new(MockTimer::new("t1"));
        let (retry, _) = retry_with(vec![PauseDecision::Abort], motor.clone());
        let retry = retry.with_gating_device(Some(timer.clone() as Arc<dyn Triggerable>));
        let mut attempts = Attempts {
            count: 0,
            pauses_left: 1,
        };

        let result = retry
            .run(RetrySite::Acquire, &mut attempts, |a| Box::pin(a.step()))
            .await;

        assert!(matches!(result, Err(ScanError::Interrupted)));
        assert_eq!(motor.abort_count().await, 1);
        assert_eq!(timer.stop_count().await, 1);
    }
}
