//! End-to-end scans against mock hardware
//!
//! These tests drive `ScanEngine::perform_scan` and inspect what reached the
//! devices and the datafiles.

mod common;

use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing_test::traced_test;

use common::{read_lines, Rig, PRESET};
use daq_scan::config::{Axis, EarlyMovePolicy, ScanPattern, ShutterPolicy};
use daq_scan::hardware::mock::MockMotor;
use daq_scan::hardware::{CounterMode, Motor, Triggerable};
use daq_scan::records::{MeasurementCounter, ParentScan};
use daq_scan::sink::text::TextDatafile;
use daq_scan::sink::{DataSink, PlotDriver, PlotSink, ResolutionScope};
use daq_scan::{DriverRegistry, Records, ScanConfig, ScanEngine, ScanError, ScanOutcome};

fn grid(name: &str, datafile: &str) -> ScanConfig {
    ScanConfig::linear(
        name,
        vec![Axis::new("m1", 0.0, 1.0, 2), Axis::new("m2", 0.0, 0.5, 3)],
    )
    .with_inputs(["s1"])
    .with_measurement("preset_time", PRESET)
    .with_datafile("text", datafile)
}

fn path_str(path: &std::path::Path) -> String {
    path.to_str().unwrap().to_string()
}

// =============================================================================
// Walk order and datafiles
// =============================================================================

#[tokio::test]
async fn grid_rows_follow_product_order() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("grid.001");
    let rig = Rig::new((1..=6).map(f64::from));

    let mut engine = ScanEngine::new(grid("grid", &path_str(&first)), rig.records());
    let report = engine.perform_scan().await.unwrap();

    assert_eq!(report.outcome, ScanOutcome::Complete);
    assert_eq!(report.measurements, 6);
    assert_eq!(report.datafiles, vec![path_str(&first)]);
    assert_eq!(report.next_datafile_name, path_str(&dir.path().join("grid.002")));
    assert_eq!(engine.datafile_name(), report.next_datafile_name);

    assert_eq!(
        read_lines(&first).await,
        vec![
            "0.000 0.000 1",
            "0.000 0.500 2",
            "0.000 1.000 3",
            "1.000 0.000 4",
            "1.000 0.500 5",
            "1.000 1.000 6",
        ]
    );
    assert_eq!(rig.m1.move_history().await, vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    assert_eq!(rig.m2.move_history().await, vec![0.0, 0.5, 1.0, 0.0, 0.5, 1.0]);
    assert_eq!(rig.timer.preset_history().await, vec![0.001; 6]);
}

async fn run_grid(early_move: bool) -> (Vec<String>, Vec<f64>, Vec<f64>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("walk.001");
    let rig = Rig::new((1..=6).map(f64::from));

    let config = grid("walk", &path_str(&path))
        .with_early_move(early_move)
        .with_early_move_policy(EarlyMovePolicy::Allow);
    ScanEngine::new(config, rig.records())
        .perform_scan()
        .await
        .unwrap();

    (
        read_lines(&path).await,
        rig.m1.move_history().await,
        rig.m2.move_history().await,
    )
}

#[tokio::test]
async fn early_move_writes_the_same_rows_as_normal_move() {
    let normal = run_grid(false).await;
    let early = run_grid(true).await;
    assert_eq!(normal, early);
}

#[tokio::test]
async fn repeats_write_successive_datafiles() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::new((1..=9).map(f64::from));
    let config = ScanConfig::linear("rep", vec![Axis::new("m1", 2.0, 0.5, 3)])
        .with_inputs(["s1"])
        .with_measurement("preset_time", PRESET)
        .with_datafile("text", &path_str(&dir.path().join("rep.001")))
        .with_num_scans(2);

    let mut engine = ScanEngine::new(config, rig.records());
    let report = engine.perform_scan().await.unwrap();

    assert_eq!(report.repeats_completed, 2);
    assert_eq!(report.measurements, 6);
    assert_eq!(report.datafiles.len(), 2);
    assert_eq!(
        read_lines(&dir.path().join("rep.001")).await,
        vec!["2.000 1", "2.500 2", "3.000 3"]
    );
    assert_eq!(
        read_lines(&dir.path().join("rep.002")).await,
        vec!["2.000 4", "2.500 5", "3.000 6"]
    );

    // A second run continues the numbering
    let again = engine.perform_scan().await.unwrap();
    assert_eq!(again.repeats_completed, 2);
    assert!(dir.path().join("rep.004").exists());
    assert!(engine.datafile_name().ends_with("rep.005"));
}

#[tokio::test]
async fn count_and_list_patterns() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::new([5.0, 6.0, 7.0, 8.0, 9.0]);

    let count = ScanConfig::new("count", ScanPattern::Count { points: 2 })
        .with_inputs(["s1"])
        .with_measurement("preset_time", PRESET)
        .with_datafile("text", &path_str(&dir.path().join("count.001")));
    ScanEngine::new(count, rig.records())
        .perform_scan()
        .await
        .unwrap();
    assert_eq!(read_lines(&dir.path().join("count.001")).await, vec!["5", "6"]);

    let list = ScanConfig::new(
        "list",
        ScanPattern::List {
            motors: vec!["m1".to_string(), "m2".to_string()],
            positions: vec![vec![1.0, -1.0], vec![3.0, 0.25], vec![2.0, 2.0]],
        },
    )
    .with_inputs(["s1"])
    .with_measurement("preset_time", PRESET)
    .with_datafile("text", &path_str(&dir.path().join("list.001")));
    ScanEngine::new(list, rig.records())
        .perform_scan()
        .await
        .unwrap();
    assert_eq!(
        read_lines(&dir.path().join("list.001")).await,
        vec!["1.000 -1.000 7", "3.000 0.250 8", "2.000 2.000 9"]
    );
}

#[tokio::test]
async fn alternate_x_and_normalization() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alt.001");
    let rig = Rig::new([10.0, 20.0]);

    let config = ScanConfig::linear("alt", vec![Axis::new("m1", 0.0, 1.0, 2)])
        .with_inputs(["s1"])
        .with_measurement("preset_time", "0.5 t1")
        .with_datafile("text:x=m2;norm", &path_str(&path));
    ScanEngine::new(config, rig.records())
        .perform_scan()
        .await
        .unwrap();

    // m2 never moves; counts are divided by the 0.5 s gate time
    assert_eq!(read_lines(&path).await, vec!["0.000 20", "0.000 40"]);
}

#[tokio::test]
async fn child_datafile_appends_to_running_parent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outer.001");
    let rig = Rig::new([1.0, 2.0]);
    let records = rig.records();

    let mut text = TextDatafile::new();
    text.open(&path_str(&path)).await.unwrap();
    let parent_counter = MeasurementCounter::new();
    records
        .register_scan(
            "outer",
            ParentScan {
                datafile: Arc::new(Mutex::new(DataSink::Text(text))),
                plot: Arc::new(Mutex::new(PlotSink::None)),
                counter: parent_counter.clone(),
            },
        )
        .await;

    let config = ScanConfig::linear("inner", vec![Axis::new("m2", 0.0, 0.25, 2)])
        .with_inputs(["s1"])
        .with_measurement("preset_time", PRESET)
        .with_datafile("child", "outer");
    let mut engine = ScanEngine::new(config, records.clone());
    let report = engine.perform_scan().await.unwrap();

    assert!(report.datafiles.is_empty());
    assert_eq!(engine.datafile_name(), "outer");
    assert_eq!(parent_counter.get(), 2);
    assert_eq!(read_lines(&path).await, vec!["0.000 1", "0.250 2"]);
    assert!(records.find_parent_scan("inner").await.is_err());
}

// =============================================================================
// Devices around the walk
// =============================================================================

#[tokio::test]
async fn shutter_policies() {
    let rig = Rig::new([]);
    let config = ScanConfig::linear("shut", vec![Axis::new("m1", 0.0, 1.0, 3)])
        .with_inputs(["s1"])
        .with_shutter("shutter", ShutterPolicy::OpenForScan)
        .with_num_scans(2);
    ScanEngine::new(config, rig.records())
        .perform_scan()
        .await
        .unwrap();
    assert_eq!(rig.shutter.history().await, vec![true, false, true, false]);

    let rig = Rig::new([]);
    let config = ScanConfig::linear("shut", vec![Axis::new("m1", 0.0, 1.0, 3)])
        .with_inputs(["s1"])
        .with_shutter("shutter", ShutterPolicy::OpenForDatapoint);
    ScanEngine::new(config, rig.records())
        .perform_scan()
        .await
        .unwrap();
    assert_eq!(rig.shutter.history().await, [true, false].repeat(3));
}

#[tokio::test]
async fn measurement_modes_are_restored() {
    let rig = Rig::new([]);
    let config = ScanConfig::linear("modes", vec![Axis::new("m1", 0.0, 1.0, 2)])
        .with_inputs(["s1"])
        .with_measurement("preset_time", PRESET);
    ScanEngine::new(config, rig.records())
        .perform_scan()
        .await
        .unwrap();

    assert_eq!(rig.timer.mode().await.unwrap(), CounterMode::Counter);
    assert_eq!(rig.s1.mode().await.unwrap(), CounterMode::Counter);
    assert!(!rig.m1.fast_mode().await);
}

/// Triggerable sharing the timer's gate that refuses every mode change
struct Unswitchable;

#[async_trait]
impl Triggerable for Unswitchable {
    fn name(&self) -> &str {
        "stuck"
    }

    fn gate(&self) -> &str {
        "t1"
    }

    async fn mode(&self) -> anyhow::Result<CounterMode> {
        Ok(CounterMode::Counter)
    }

    async fn set_mode(&self, _mode: CounterMode) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("wire fault"))
    }

    async fn start(&self, _preset: f64) -> anyhow::Result<()> {
        Ok(())
    }

    async fn is_busy(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn failed_measurement_configure_leaves_modes_untouched() {
    let rig = Rig::new([]);
    let records = Arc::new(
        Records::new()
            .with_motor(rig.m1.clone())
            .with_triggerable(rig.timer.clone())
            .with_input(rig.timer.clone())
            .with_triggerable(rig.s1.clone())
            .with_input(rig.s1.clone())
            .with_triggerable(Arc::new(Unswitchable)),
    );
    let config = ScanConfig::linear("stuck", vec![Axis::new("m1", 0.0, 1.0, 2)])
        .with_inputs(["s1"])
        .with_measurement("preset_time", PRESET);

    let err = ScanEngine::new(config, records)
        .perform_scan()
        .await
        .unwrap_err();

    assert!(matches!(err, ScanError::DeviceIo(ref msg) if msg.contains("wire fault")));
    assert_eq!(rig.timer.mode().await.unwrap(), CounterMode::Counter);
    assert_eq!(rig.s1.mode().await.unwrap(), CounterMode::Counter);
    assert!(rig.m1.move_history().await.is_empty());
}

#[tokio::test]
async fn k_power_law_from_zero_k_completes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kpl.001");
    let rig = Rig::new([1.0, 2.0, 3.0]);
    let config = ScanConfig::linear("kpl", vec![Axis::new("m1", 0.0, 1.0, 3)])
        .with_inputs(["s1"])
        .with_measurement("k_power_law", "0.001 0 1 -1 t1")
        .with_datafile("text", &path_str(&path));

    let report = ScanEngine::new(config, rig.records())
        .perform_scan()
        .await
        .unwrap();

    assert_eq!(report.outcome, ScanOutcome::Complete);
    assert_eq!(rig.timer.preset_history().await, vec![0.0; 3]);
    assert_eq!(
        read_lines(&path).await,
        vec!["0.000 1", "1.000 2", "2.000 3"]
    );
}

#[tokio::test]
async fn quick_scan_speeds_are_restored_after_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::new([]).with_m1(MockMotor::new("m1").with_speed(1000.0).failing_at_move(1));
    let config = ScanConfig::linear("quick", vec![Axis::new("m1", 0.0, 0.1, 3)])
        .with_inputs(["s1"])
        .with_measurement("preset_time", PRESET)
        .with_datafile("text", &path_str(&dir.path().join("quick.001")))
        .with_quick_scan([("m1".to_string(), 50.0)]);

    let mut engine = ScanEngine::new(config, rig.records());
    let err = engine.perform_scan().await.unwrap_err();

    assert!(matches!(err, ScanError::DeviceIo(_)));
    assert_eq!(err.code(), 9);
    assert_eq!(rig.m1.speed().await.unwrap(), 1000.0);
    assert!(!rig.m1.fast_mode().await);
    assert_eq!(rig.timer.mode().await.unwrap(), CounterMode::Counter);

    // The partial datafile is closed and the next name is ready
    assert_eq!(read_lines(&dir.path().join("quick.001")).await, vec!["0.000 0"]);
    assert!(engine.datafile_name().ends_with("quick.002"));
}

#[tokio::test]
async fn unknown_measurement_type_is_not_found() {
    let rig = Rig::new([]);
    let config = ScanConfig::linear("bad", vec![Axis::new("m1", 0.0, 1.0, 2)])
        .with_measurement("lock_in", "");
    let err = ScanEngine::new(config, rig.records())
        .perform_scan()
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::NotFound(_)));
    assert!(rig.m1.move_history().await.is_empty());
}

// =============================================================================
// Plot sections
// =============================================================================

#[derive(Default)]
struct PlotCalls {
    opens: usize,
    sections: Vec<u64>,
    points: usize,
    closes: usize,
}

struct RecordingPlot(Arc<StdMutex<PlotCalls>>);

#[async_trait]
impl PlotDriver for RecordingPlot {
    async fn open(&mut self, _scope: &ResolutionScope<'_>) -> daq_scan::ScanResult<()> {
        self.0.lock().unwrap().opens += 1;
        Ok(())
    }

    async fn close(&mut self) -> daq_scan::ScanResult<()> {
        self.0.lock().unwrap().closes += 1;
        Ok(())
    }

    async fn start_section(&mut self, scope: &ResolutionScope<'_>) -> daq_scan::ScanResult<()> {
        self.0.lock().unwrap().sections.push(scope.section_number);
        Ok(())
    }

    async fn add_measurement(&mut self, _scope: &ResolutionScope<'_>) -> daq_scan::ScanResult<()> {
        self.0.lock().unwrap().points += 1;
        Ok(())
    }
}

#[tokio::test]
async fn plot_starts_one_section_per_line() {
    let calls = Arc::new(StdMutex::new(PlotCalls::default()));
    let mut registry = DriverRegistry::new();
    let shared = calls.clone();
    registry.register_plot("recorder", move || -> Box<dyn PlotDriver> {
        Box::new(RecordingPlot(shared.clone()))
    });

    let rig = Rig::new([]);
    let config = grid("plotted", "").with_datafile("none", "").with_plot("recorder", "");
    ScanEngine::new(config, rig.records())
        .with_registry(Arc::new(registry))
        .perform_scan()
        .await
        .unwrap();

    let calls = calls.lock().unwrap();
    assert_eq!(calls.opens, 1);
    assert_eq!(calls.sections, vec![0, 1]);
    assert_eq!(calls.points, 6);
    assert_eq!(calls.closes, 1);
}

// =============================================================================
// Logging
// =============================================================================

#[tokio::test]
#[traced_test]
async fn progress_and_completion_are_logged() {
    let rig = Rig::new([3.0, 4.0]);
    let config = ScanConfig::linear("logged", vec![Axis::new("m1", 0.0, 1.0, 2)])
        .with_inputs(["s1"])
        .with_measurement("preset_time", PRESET);
    ScanEngine::new(config, rig.records())
        .perform_scan()
        .await
        .unwrap();

    assert!(logs_contain("0.000 - 3"));
    assert!(logs_contain("1.000 - 4"));
    assert!(logs_contain("Scan 'logged' complete."));
}

#[tokio::test]
#[traced_test]
async fn suppressed_progress_still_reports_completion() {
    let rig = Rig::new([3.0, 4.0]);
    let config = ScanConfig::linear("quiet", vec![Axis::new("m1", 0.0, 1.0, 2)])
        .with_inputs(["s1"])
        .with_measurement("preset_time", PRESET)
        .with_suppress_progress(true);
    ScanEngine::new(config, rig.records())
        .perform_scan()
        .await
        .unwrap();

    assert!(!logs_contain("0.000 - 3"));
    assert!(logs_contain("Scan 'quiet' complete."));
}
