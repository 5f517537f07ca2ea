pub mod config;
pub mod errors;
pub mod graph;
pub mod parameters;
pub mod plugin;
pub mod preset;
pub mod processing;
pub mod units;

pub use config::HostConfig;
pub use errors::{ConfigError, HostError, HostResult, LoadPhase, ParameterError, RenderFault, UnitError};
pub use graph::{AudioGraphBridge, GraphNode, RenderGraph};
pub use parameters::{ParameterDescriptor, ParameterKind, ParameterLayout, ParameterStore, ParameterValue};
pub use plugin::{
    AutomationPath, FaultReport, LoaderSet, PluginDescriptor, PluginHost, PluginInfo, PluginMetadata, PluginState,
    PluginUnit,
};
pub use preset::Preset;
pub use processing::{AudioBuffer, MidiEvent, MidiEventKind, RenderContext};
pub use units::{EqualizerUnit, LogDrumUnit};
