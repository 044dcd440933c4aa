//! Gnuplot plot sink.
//!
//! Streams line-oriented commands to an external helper over its stdin:
//!
//! ```text
//! start_plot;<num_x>;<innermost_index>;<plot_arguments>
//! set title 'Scan = <scan>  Datafile = <file>  <motor> = <pos> <units>'
//! set xlabel '<motor> (<units>)'
//! data <x...> <value...>
//! plot
//! exit
//! ```

use std::process::Stdio;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{format_reading, ResolutionScope};
use crate::error::{ScanError, ScanResult};

/// Helper program the gnuplot sink pipes into when none is configured
pub const DEFAULT_PLOT_COMMAND: &[&str] = &["perl", "-S", "--", "plotgnu.pl"];

type PlotWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Format like C's `%.<significant>g`
pub fn format_g(value: f64, significant: usize) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    if !value.is_finite() {
        return value.to_string();
    }
    let significant = significant.max(1);
    let scientific = format!("{:.*e}", significant - 1, value);
    let (mantissa, exponent) = match scientific.split_once('e') {
        Some((mantissa, exponent)) => (mantissa, exponent.parse::<i32>().unwrap_or(0)),
        None => (scientific.as_str(), 0),
    };

    if exponent < -4 || exponent >= significant as i32 {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_fraction(mantissa), sign, exponent.abs())
    } else {
        let decimals = (significant as i32 - 1 - exponent).max(0) as usize;
        trim_fraction(&format!("{value:.decimals$}")).to_string()
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Pipe to the plotting helper
pub struct GnuplotPlot {
    command: Vec<String>,
    plot_arguments: String,
    continuous: bool,
    injected: Option<PlotWriter>,
    writer: Option<PlotWriter>,
    child: Option<Child>,
    step_count: u64,
}

impl GnuplotPlot {
    /// Plot piping into `command` (program followed by its arguments)
    pub fn new(command: Vec<String>, plot_arguments: &str, continuous: bool) -> Self {
        let command = if command.is_empty() {
            DEFAULT_PLOT_COMMAND.iter().map(|s| s.to_string()).collect()
        } else {
            command
        };
        Self {
            command,
            plot_arguments: plot_arguments.to_string(),
            continuous,
            injected: None,
            writer: None,
            child: None,
            step_count: 0,
        }
    }

    /// Write the command stream into `writer` instead of spawning a helper
    pub fn with_writer(mut self, writer: PlotWriter) -> Self {
        self.injected = Some(writer);
        self
    }

    /// Whether child scans share this plot's section
    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    /// Start the helper; a continuous plot opens its section right away
    pub async fn open(&mut self, scope: &ResolutionScope<'_>) -> ScanResult<()> {
        self.step_count = 0;
        let writer = match self.injected.take() {
            Some(writer) => writer,
            None => self.spawn()?,
        };
        self.writer = Some(writer);

        if self.continuous {
            self.start_section(scope).await?;
        }
        Ok(())
    }

    fn spawn(&mut self) -> ScanResult<PlotWriter> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            ScanError::Configuration("The plot command is empty.".to_string())
        })?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ScanError::DeviceIo(format!(
                    "Unable to start the plotting program '{program}': {e}"
                ))
            })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            ScanError::DeviceIo(format!("The plotting program '{program}' has no stdin."))
        })?;
        debug!(program = %program, "Started plotting program");
        self.child = Some(child);
        Ok(Box::new(stdin))
    }

    async fn send(&mut self, line: &str) -> ScanResult<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            ScanError::DeviceIo("A connection to the plotting program is not active.".to_string())
        })?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send `exit` and wait for the helper to finish
    pub async fn close(&mut self) -> ScanResult<()> {
        if self.writer.is_some() {
            self.send("exit").await?;
        }
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        if let Some(mut child) = self.child.take() {
            let status = child.wait().await?;
            if !status.success() {
                warn!(status = %status, "Plotting program exited abnormally");
            }
        }
        Ok(())
    }

    /// Begin a new plot section with title and X label
    pub async fn start_section(&mut self, scope: &ResolutionScope<'_>) -> ScanResult<()> {
        let innermost = scope.innermost_index();
        let innermost_text = innermost.map_or_else(|| "-1".to_string(), |i| i.to_string());
        let header = format!(
            "start_plot;{};{};{}",
            scope.num_independent_variables(),
            innermost_text,
            self.plot_arguments
        );
        self.send(&header).await?;

        let mut title = format!(
            "set title 'Scan = {}  Datafile = {}",
            scope.scan, scope.datafile_name
        );
        let columns = scope.x_columns();
        if columns.is_empty() {
            title.push_str("   Scaler scan");
        } else {
            for (index, (motor, position)) in columns.iter().enumerate() {
                if Some(index) == innermost {
                    continue;
                }
                title.push_str(&format!(
                    "  {} = {} {}",
                    motor.name(),
                    format_g(*position, motor.precision()),
                    motor.units()
                ));
            }
        }
        title.push('\'');
        self.send(&title).await?;

        if let Some((motor, _)) = innermost.and_then(|i| columns.get(i)) {
            let label = format!("set xlabel '{} ({})'", motor.name(), motor.units());
            self.send(&label).await?;
        }
        Ok(())
    }

    /// Send the current measurement
    pub async fn add_measurement(&mut self, scope: &ResolutionScope<'_>) -> ScanResult<()> {
        let mut line = String::from("data");
        let columns = scope.x_columns();
        if columns.is_empty() {
            line.push_str(&format!(" {:3}", self.step_count));
            self.step_count += 1;
        } else {
            for (_, position) in columns {
                line.push(' ');
                line.push_str(&format_g(position, 6));
            }
        }
        for (device, value) in scope.inputs.iter().zip(scope.readings.iter()) {
            line.push(' ');
            line.push_str(&format_reading(device.as_ref(), *value, scope.normalization));
        }
        self.send(&line).await
    }

    /// Send a row from caller-supplied buffers
    pub async fn add_array(
        &mut self,
        scope: &ResolutionScope<'_>,
        positions: &[f64],
        data: &[f64],
    ) -> ScanResult<()> {
        let mut line = String::from("data");
        if scope.motors.is_empty() {
            line.push_str(&format!(" {:3}", self.step_count));
            self.step_count += 1;
        } else {
            for position in positions {
                line.push(' ');
                line.push_str(&format_g(*position, 6));
            }
        }
        for value in data {
            line.push(' ');
            line.push_str(&format_g(*value, 6));
        }
        self.send(&line).await
    }

    /// Ask the helper to redraw
    pub async fn display(&mut self) -> ScanResult<()> {
        self.send("plot").await
    }

    /// Fix the X range
    pub async fn set_x_range(&mut self, min: f64, max: f64) -> ScanResult<()> {
        let line = format!("set xrange [{}:{}]", format_g(min, 6), format_g(max, 6));
        self.send(&line).await
    }

    /// Fix the Y range
    pub async fn set_y_range(&mut self, min: f64, max: f64) -> ScanResult<()> {
        let line = format!("set yrange [{}:{}]", format_g(min, 6), format_g(max, 6));
        self.send(&line).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockMotor, MockScaler};
    use crate::hardware::{InputDevice, Motor};
    use std::sync::Arc;

    #[test]
    fn format_g_matches_printf() {
        assert_eq!(format_g(1.5, 6), "1.5");
        assert_eq!(format_g(0.0, 6), "0");
        assert_eq!(format_g(100.0, 6), "100");
        assert_eq!(format_g(1234567.0, 6), "1.23457e+06");
        assert_eq!(format_g(0.0001, 6), "0.0001");
        assert_eq!(format_g(0.00001, 6), "1e-05");
        assert_eq!(format_g(2.34567, 3), "2.35");
        assert_eq!(format_g(-0.5, 6), "-0.5");
    }

    #[tokio::test]
    async fn emits_protocol_for_two_axis_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plot.txt");
        let file = tokio::fs::File::create(&path).await.unwrap();

        let motors: Vec<Arc<dyn Motor>> = vec![
            Arc::new(MockMotor::new("m1").with_precision(2)),
            Arc::new(MockMotor::new("m2").with_units("deg")),
        ];
        let inputs: Vec<Arc<dyn InputDevice>> = vec![Arc::new(MockScaler::new("s1", 1.0))];
        let scope = ResolutionScope {
            scan: "grid",
            datafile_name: "grid.001",
            motors: &motors,
            positions: &[1.0, 0.25],
            x_motors: &[],
            x_positions: &[],
            inputs: &inputs,
            readings: &[17.0],
            normalization: None,
            step_number: &[0, 0],
            measurement_number: 0,
            section_number: 0,
        };

        let mut plot = GnuplotPlot::new(Vec::new(), "logy", false).with_writer(Box::new(file));
        plot.open(&scope).await.unwrap();
        plot.start_section(&scope).await.unwrap();
        plot.add_measurement(&scope).await.unwrap();
        plot.display().await.unwrap();
        plot.close().await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "start_plot;2;1;logy",
                "set title 'Scan = grid  Datafile = grid.001  m1 = 1 mm'",
                "set xlabel 'm2 (deg)'",
                "data 1 0.25 17",
                "plot",
                "exit",
            ]
        );
    }

    #[tokio::test]
    async fn scaler_scan_numbers_steps_and_continuous_opens_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plot.txt");
        let file = tokio::fs::File::create(&path).await.unwrap();

        let inputs: Vec<Arc<dyn InputDevice>> = vec![Arc::new(MockScaler::new("s1", 1.0))];
        let scope = ResolutionScope {
            scan: "count",
            datafile_name: "count.001",
            motors: &[],
            positions: &[],
            x_motors: &[],
            x_positions: &[],
            inputs: &inputs,
            readings: &[5.0],
            normalization: None,
            step_number: &[0],
            measurement_number: 0,
            section_number: 0,
        };

        let mut plot = GnuplotPlot::new(Vec::new(), "", true).with_writer(Box::new(file));
        plot.open(&scope).await.unwrap();
        plot.add_measurement(&scope).await.unwrap();
        plot.add_measurement(&scope).await.unwrap();
        plot.close().await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "start_plot;0;-1;",
                "set title 'Scan = count  Datafile = count.001   Scaler scan'",
                "data   0 5",
                "data   1 5",
                "exit",
            ]
        );
    }
}
