//! Driver tables and the runtime registry of custom drivers.
//!
//! The built-in measurement, datafile and plot variants are closed sets,
//! looked up by name from static tables. Anything else must be registered
//! at runtime under a `custom` factory name, following the same
//! `register` / `create` / `list_types` / `has_type` shape as the storage
//! writer registry.
//!
//! # Description strings
//!
//! Datafile and plot descriptions have the form `typename[:opt=args;...]`:
//!
//! ```
//! use daq_scan::registry::parse_description;
//!
//! let description = parse_description("text:x=m2;normalize_data").unwrap();
//! assert_eq!(description.type_name, "text");
//! assert_eq!(description.options.len(), 2);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ScanError, ScanResult};
use crate::measurement::MeasurementDriver;
use crate::permit::{FaultHandler, PermitHandler, SimpleFault, SimplePermit};
use crate::records::Records;
use crate::sink::datafile::ChildDatafile;
use crate::sink::gnuplot::{GnuplotPlot, DEFAULT_PLOT_COMMAND};
use crate::sink::options::SinkCategory;
use crate::sink::plot::ChildPlot;
use crate::sink::text::TextDatafile;
use crate::sink::{DataSink, DatafileDriver, PlotDriver, PlotSink, SinkOptions};

/// One `name[=args]` option of a description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverOption {
    /// Option keyword as written
    pub name: String,
    /// Text after `=`, if any
    pub args: Option<String>,
}

/// A parsed `typename[:options]` description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverDescription {
    /// Driver type name
    pub type_name: String,
    /// Options in the order written
    pub options: Vec<DriverOption>,
}

/// Split a description into its type name and option list
pub fn parse_description(text: &str) -> ScanResult<DriverDescription> {
    let (type_name, rest) = match text.split_once(':') {
        Some((type_name, rest)) => (type_name.trim(), rest),
        None => (text.trim(), ""),
    };
    if type_name.is_empty() {
        return Err(ScanError::UnparseableArguments(format!(
            "No driver type name found in description '{text}'."
        )));
    }

    let options = rest
        .split(';')
        .map(str::trim)
        .filter(|option| !option.is_empty())
        .map(|option| match option.split_once('=') {
            Some((name, args)) => DriverOption {
                name: name.trim().to_string(),
                args: Some(args.trim().to_string()),
            },
            None => DriverOption {
                name: option.to_string(),
                args: None,
            },
        })
        .collect();

    Ok(DriverDescription {
        type_name: type_name.to_string(),
        options,
    })
}

/// Static table row: a name and the variant tag it selects
#[derive(Debug, Clone, Copy)]
pub struct DriverEntry<T: 'static> {
    /// Name used in configuration
    pub name: &'static str,
    /// Variant selected by the name
    pub tag: T,
}

/// Built-in measurement variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementType {
    /// No gating; every acquisition succeeds immediately
    None,
    /// Gate for a fixed time
    PresetTime,
    /// Gate until a counter reaches a preset
    PresetCount,
    /// Gate for a k-dependent time
    KPowerLaw,
}

/// Built-in datafile variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatafileType {
    /// Discard output
    None,
    /// Plain text
    Text,
    /// Forward to a parent scan
    Child,
}

/// Built-in plot variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlotType {
    /// No plot
    None,
    /// Forward to a parent scan
    Child,
    /// Gnuplot helper process
    Gnuplot,
}

/// Measurement names
pub const MEASUREMENT_TYPES: &[DriverEntry<MeasurementType>] = &[
    DriverEntry {
        name: "none",
        tag: MeasurementType::None,
    },
    DriverEntry {
        name: "preset_time",
        tag: MeasurementType::PresetTime,
    },
    DriverEntry {
        name: "preset_count",
        tag: MeasurementType::PresetCount,
    },
    DriverEntry {
        name: "k_power_law",
        tag: MeasurementType::KPowerLaw,
    },
];

/// Datafile names
pub const DATAFILE_TYPES: &[DriverEntry<DatafileType>] = &[
    DriverEntry {
        name: "none",
        tag: DatafileType::None,
    },
    DriverEntry {
        name: "text",
        tag: DatafileType::Text,
    },
    DriverEntry {
        name: "child",
        tag: DatafileType::Child,
    },
];

/// Plot names
pub const PLOT_TYPES: &[DriverEntry<PlotType>] = &[
    DriverEntry {
        name: "none",
        tag: PlotType::None,
    },
    DriverEntry {
        name: "child",
        tag: PlotType::Child,
    },
    DriverEntry {
        name: "gnuplot",
        tag: PlotType::Gnuplot,
    },
];

/// Look `name` up in a static table
pub fn lookup<T: Copy>(table: &[DriverEntry<T>], name: &str) -> Option<T> {
    table.iter().find(|entry| entry.name == name).map(|entry| entry.tag)
}

/// Driver families known to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverClass {
    /// Measurement drivers
    Measurement,
    /// Datafile drivers
    Datafile,
    /// Plot drivers
    Plot,
    /// Permit handlers
    Permit,
    /// Fault handlers
    Fault,
}

impl std::fmt::Display for DriverClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverClass::Measurement => write!(f, "measurement"),
            DriverClass::Datafile => write!(f, "datafile"),
            DriverClass::Plot => write!(f, "plot"),
            DriverClass::Permit => write!(f, "permit handler"),
            DriverClass::Fault => write!(f, "fault handler"),
        }
    }
}

/// Creates a custom datafile backend
pub type DatafileFactory = Arc<dyn Fn() -> Box<dyn DatafileDriver> + Send + Sync>;
/// Creates a custom plot backend
pub type PlotFactory = Arc<dyn Fn() -> Box<dyn PlotDriver> + Send + Sync>;
/// Creates a custom measurement from its argument string
pub type MeasurementFactory =
    Arc<dyn Fn(&str, &Records) -> ScanResult<Box<dyn MeasurementDriver>> + Send + Sync>;
/// Creates a permit handler; `Ok(None)` means the handler is not needed
pub type PermitFactory =
    Arc<dyn Fn(&str, &Records) -> ScanResult<Option<Box<dyn PermitHandler>>> + Send + Sync>;
/// Creates a fault handler; `Ok(None)` means the handler is not needed
pub type FaultFactory =
    Arc<dyn Fn(&str, &Records) -> ScanResult<Option<Box<dyn FaultHandler>>> + Send + Sync>;

/// Built-in tables plus runtime-registered factories
pub struct DriverRegistry {
    datafiles: HashMap<String, DatafileFactory>,
    plots: HashMap<String, PlotFactory>,
    measurements: HashMap<String, MeasurementFactory>,
    permits: HashMap<String, PermitFactory>,
    faults: HashMap<String, FaultFactory>,
    plot_command: Vec<String>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    /// Registry holding the built-in `simple` permit and fault handlers
    pub fn new() -> Self {
        let mut registry = Self {
            datafiles: HashMap::new(),
            plots: HashMap::new(),
            measurements: HashMap::new(),
            permits: HashMap::new(),
            faults: HashMap::new(),
            plot_command: DEFAULT_PLOT_COMMAND.iter().map(|s| s.to_string()).collect(),
        };

        registry.register_permit("simple", |description, records| {
            Ok(Some(Box::new(SimplePermit::parse(description, records)?)))
        });
        registry.register_fault("simple", |description, records| {
            Ok(Some(Box::new(SimpleFault::parse(description, records)?)))
        });

        registry
    }

    /// Command line used to start the gnuplot helper
    pub fn with_plot_command(mut self, command: Vec<String>) -> Self {
        if !command.is_empty() {
            self.plot_command = command;
        }
        self
    }

    /// Current gnuplot helper command line
    pub fn plot_command(&self) -> &[String] {
        &self.plot_command
    }

    /// Register a custom datafile backend
    pub fn register_datafile<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn() -> Box<dyn DatafileDriver> + Send + Sync + 'static,
    {
        self.datafiles.insert(type_name.to_string(), Arc::new(factory));
    }

    /// Register a custom plot backend
    pub fn register_plot<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn() -> Box<dyn PlotDriver> + Send + Sync + 'static,
    {
        self.plots.insert(type_name.to_string(), Arc::new(factory));
    }

    /// Register a custom measurement
    pub fn register_measurement<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&str, &Records) -> ScanResult<Box<dyn MeasurementDriver>> + Send + Sync + 'static,
    {
        self.measurements
            .insert(type_name.to_string(), Arc::new(factory));
    }

    /// Register a permit handler type
    pub fn register_permit<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&str, &Records) -> ScanResult<Option<Box<dyn PermitHandler>>>
            + Send
            + Sync
            + 'static,
    {
        self.permits.insert(type_name.to_string(), Arc::new(factory));
    }

    /// Register a fault handler type
    pub fn register_fault<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&str, &Records) -> ScanResult<Option<Box<dyn FaultHandler>>> + Send + Sync + 'static,
    {
        self.faults.insert(type_name.to_string(), Arc::new(factory));
    }

    /// Every type name usable for `class`, built-in first, then sorted customs
    pub fn list_types(&self, class: DriverClass) -> Vec<String> {
        fn names<T>(table: &[DriverEntry<T>]) -> Vec<String> {
            table.iter().map(|entry| entry.name.to_string()).collect()
        }
        fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<String> {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            keys
        }

        match class {
            DriverClass::Measurement => {
                let mut types = names(MEASUREMENT_TYPES);
                types.extend(sorted_keys(&self.measurements));
                types
            }
            DriverClass::Datafile => {
                let mut types = names(DATAFILE_TYPES);
                types.extend(sorted_keys(&self.datafiles));
                types
            }
            DriverClass::Plot => {
                let mut types = names(PLOT_TYPES);
                types.extend(sorted_keys(&self.plots));
                types
            }
            DriverClass::Permit => sorted_keys(&self.permits),
            DriverClass::Fault => sorted_keys(&self.faults),
        }
    }

    /// Check whether `type_name` is usable for `class`
    pub fn has_type(&self, class: DriverClass, type_name: &str) -> bool {
        match class {
            DriverClass::Measurement => {
                lookup(MEASUREMENT_TYPES, type_name).is_some()
                    || self.measurements.contains_key(type_name)
            }
            DriverClass::Datafile => {
                lookup(DATAFILE_TYPES, type_name).is_some()
                    || self.datafiles.contains_key(type_name)
            }
            DriverClass::Plot => {
                lookup(PLOT_TYPES, type_name).is_some() || self.plots.contains_key(type_name)
            }
            DriverClass::Permit => self.permits.contains_key(type_name),
            DriverClass::Fault => self.faults.contains_key(type_name),
        }
    }

    fn not_found(&self, class: DriverClass, type_name: &str) -> ScanError {
        ScanError::NotFound(format!(
            "Unknown {class} type '{type_name}'. Available types: [{}]",
            self.list_types(class).join(", ")
        ))
    }

    /// Build the datafile named by `description`.
    ///
    /// For a child datafile `datafile_name` is the parent scan's name.
    pub fn create_datafile(
        &self,
        description: &str,
        datafile_name: &str,
    ) -> ScanResult<(DataSink, SinkOptions)> {
        let parsed = parse_description(description)?;
        let options = SinkOptions::parse(SinkCategory::Datafile, &parsed.options)?;
        let type_name = parsed.type_name.as_str();

        let sink = match lookup(DATAFILE_TYPES, type_name) {
            Some(DatafileType::None) => DataSink::None,
            Some(DatafileType::Text) => DataSink::Text(TextDatafile::new()),
            Some(DatafileType::Child) => DataSink::Child(ChildDatafile::new(datafile_name)),
            None => {
                let factory = self
                    .datafiles
                    .get(type_name)
                    .ok_or_else(|| self.not_found(DriverClass::Datafile, type_name))?;
                DataSink::Custom {
                    type_name: type_name.to_string(),
                    driver: factory(),
                }
            }
        };
        debug!(datafile_type = %type_name, "Created datafile sink");
        Ok((sink, options))
    }

    /// Build the plot named by `description`.
    ///
    /// A child plot's parent is `plot_arguments`, or the datafile name when
    /// no arguments are given.
    pub fn create_plot(
        &self,
        description: &str,
        plot_arguments: &str,
        datafile_name: &str,
    ) -> ScanResult<(PlotSink, SinkOptions)> {
        let parsed = parse_description(description)?;
        let options = SinkOptions::parse(SinkCategory::Plot, &parsed.options)?;
        let type_name = parsed.type_name.as_str();

        let sink = match lookup(PLOT_TYPES, type_name) {
            Some(PlotType::None) => PlotSink::None,
            Some(PlotType::Child) => {
                let parent = if plot_arguments.trim().is_empty() {
                    datafile_name
                } else {
                    plot_arguments.trim()
                };
                PlotSink::Child(ChildPlot::new(parent))
            }
            Some(PlotType::Gnuplot) => PlotSink::Gnuplot(GnuplotPlot::new(
                self.plot_command.clone(),
                plot_arguments,
                options.continuous_plot,
            )),
            None => {
                let factory = self
                    .plots
                    .get(type_name)
                    .ok_or_else(|| self.not_found(DriverClass::Plot, type_name))?;
                PlotSink::Custom {
                    type_name: type_name.to_string(),
                    driver: factory(),
                    continuous: options.continuous_plot,
                }
            }
        };
        debug!(plot_type = %type_name, "Created plot sink");
        Ok((sink, options))
    }

    /// Build a runtime-registered measurement
    pub fn create_measurement(
        &self,
        type_name: &str,
        arguments: &str,
        records: &Records,
    ) -> ScanResult<Box<dyn MeasurementDriver>> {
        let factory = self
            .measurements
            .get(type_name)
            .ok_or_else(|| self.not_found(DriverClass::Measurement, type_name))?;
        factory(arguments, records)
    }

    /// Build a permit handler; `Ok(None)` when it reports itself unneeded
    pub fn create_permit(
        &self,
        type_name: &str,
        description: &str,
        records: &Records,
    ) -> ScanResult<Option<Box<dyn PermitHandler>>> {
        let factory = self
            .permits
            .get(type_name)
            .ok_or_else(|| self.not_found(DriverClass::Permit, type_name))?;
        factory(description, records)
    }

    /// Build a fault handler; `Ok(None)` when it reports itself unneeded
    pub fn create_fault(
        &self,
        type_name: &str,
        description: &str,
        records: &Records,
    ) -> ScanResult<Option<Box<dyn FaultHandler>>> {
        let factory = self
            .faults
            .get(type_name)
            .ok_or_else(|| self.not_found(DriverClass::Fault, type_name))?;
        factory(description, records)
    }
}
