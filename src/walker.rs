//! N-dimensional walk over a scan's step grid.
//!
//! Every dimension except the innermost is enumerated by [`StepGrid`], an
//! odometer over the outer step counts with the first dimension changing
//! slowest. For each outer index vector the coordinator runs one innermost
//! line, and the plot section counter advances after the line completes.

use tracing::{debug, info};

use crate::config::EarlyMovePolicy;
use crate::coordinator::ScanRun;
use crate::error::ScanResult;

impl EarlyMovePolicy {
    /// Whether a scan with the `early_move` flag set to `flag` overlaps moves
    pub fn use_early_move(self, flag: bool) -> bool {
        match self {
            EarlyMovePolicy::Prohibit => false,
            EarlyMovePolicy::Require => true,
            EarlyMovePolicy::Allow => flag,
        }
    }
}

/// Odometer over the outer dimensions of a scan, outermost slowest
#[derive(Debug, Clone)]
pub struct StepGrid {
    counts: Vec<usize>,
    next: Option<Vec<usize>>,
}

impl StepGrid {
    /// Enumerate every index vector below `counts`.
    ///
    /// An empty `counts` yields a single empty vector; any zero count yields
    /// nothing.
    pub fn new(counts: &[usize]) -> Self {
        let next = if counts.contains(&0) {
            None
        } else {
            Some(vec![0; counts.len()])
        };
        Self {
            counts: counts.to_vec(),
            next,
        }
    }
}

impl Iterator for StepGrid {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;

        let mut advanced = current.clone();
        for dimension in (0..advanced.len()).rev() {
            advanced[dimension] += 1;
            if advanced[dimension] < self.counts[dimension] {
                self.next = Some(advanced);
                return Some(current);
            }
            advanced[dimension] = 0;
        }
        Some(current)
    }
}

/// Run every innermost line of the scan
pub async fn execute_scan_body(run: &mut ScanRun, early_move: bool) -> ScanResult<()> {
    let counts = run.pattern.counts();
    let Some((_, outer_counts)) = counts.split_last() else {
        return Ok(());
    };

    info!(scan = %run.name, "Moving to start position for scan section.");

    for outer in StepGrid::new(outer_counts) {
        run.state.step_number[..outer.len()].copy_from_slice(&outer);
        debug!(scan = %run.name, step = ?outer, early_move, "Starting innermost line");

        if early_move {
            run.do_early_move_line().await?;
        } else {
            run.do_normal_line().await?;
        }
        run.state.section_number += 1;
    }
    Ok(())
}
