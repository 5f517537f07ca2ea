/*
 * Amapiano Host - Real-time Plugin Host
 * Copyright (c) 2025 MACHIKO LAB
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Plugin Host - lifecycle, automation and render graph wiring
//!
//! ```text
//! Unloaded ─load─▶ Loading ─▶ Ready ─connect─▶ Connected ─disconnect/fault─▶ Disconnected
//!                                                  ▲                               │
//!                                                  └────────────connect────────────┘
//! ```
//! `unload_plugin` returns any state to Unloaded.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use libloading::Library;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::HostConfig;
use crate::errors::{HostError, HostResult, LoadPhase, ParameterError};
use crate::graph::{
    render_graph, AudioGraphBridge, GraphCommand, GraphHandle, GraphNode, ParameterRamp, RenderEvent, RenderGraph,
    RoutingTable, SharedUnit,
};
use crate::parameters::{ParameterDescriptor, ParameterKind, ParameterStore, ParameterValue};
use crate::plugin::api::{PluginDescriptor, PluginMetadata};
use crate::plugin::loader::{LoadedUnit, LoaderSet};
use crate::preset::Preset;

/// Capacity of the fault broadcast channel.
const FAULT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle state of a plugin id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginState {
    Unloaded,
    Loading,
    Ready,
    Connected,
    Disconnected,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginState::Unloaded => "unloaded",
            PluginState::Loading => "loading",
            PluginState::Ready => "ready",
            PluginState::Connected => "connected",
            PluginState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// How an automation request was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutomationPath {
    /// Scheduled as a render-side linear ramp.
    Ramp,
    /// Written straight into the parameter store.
    Immediate,
}

/// A render fault as reported to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultReport {
    pub plugin_id: String,
    pub reason: String,
    pub at_time: f64,
}

/// Snapshot of a hosted plugin for display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub metadata: PluginMetadata,
    pub state: PluginState,
    pub entry_point: String,
    pub digest: String,
    pub fault: Option<String>,
    pub parameters: Vec<ParameterDescriptor>,
}

/// One loaded instance.
///
/// The render side only holds a `Weak` to `unit`. Unloading disposes and drops the
/// unit right away, so the bridge can outlive it until the render thread retires it;
/// such a bridge renders silence. Preset and parameter access go through `parameters`
/// and the cached `presets`, never through the unit lock, which the render thread
/// takes on every block.
struct HostedPlugin {
    metadata: PluginMetadata,
    state: PluginState,
    parameters: Arc<ParameterStore>,
    presets: Vec<Preset>,
    unit: SharedUnit,
    entry_point: String,
    digest: String,
    fault: Option<String>,
    slot: Option<usize>,
    // declared after `unit` so it is unloaded last
    _library: Option<Library>,
}

impl HostedPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            metadata: self.metadata.clone(),
            state: self.state,
            entry_point: self.entry_point.clone(),
            digest: self.digest.clone(),
            fault: self.fault.clone(),
            parameters: self.parameters.layout().descriptors().to_vec(),
        }
    }

    fn invalid_state(&self, operation: &'static str) -> HostError {
        HostError::InvalidState {
            plugin_id: self.metadata.id.clone(),
            state: self.state.to_string(),
            operation,
        }
    }
}

/// Removes the id from the loading table when the load ends, however it ends.
struct LoadingGuard {
    loading: Arc<DashSet<String>>,
    plugin_id: String,
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.loading.remove(&self.plugin_id);
    }
}

/// First half of a load: fetch and compile running on the blocking pool.
pub struct PendingLoad {
    metadata: PluginMetadata,
    task: JoinHandle<HostResult<LoadedUnit>>,
    _guard: LoadingGuard,
}

impl PendingLoad {
    pub fn plugin_id(&self) -> &str {
        &self.metadata.id
    }
}

/// プラグインホスト
///
/// Owns every loaded unit and the control end of the render graph. All methods run on
/// the control side; the matching [`RenderGraph`] is returned from [`PluginHost::new`]
/// and belongs to the render thread.
pub struct PluginHost {
    config: HostConfig,
    loaders: Arc<LoaderSet>,
    instances: DashMap<String, HostedPlugin>,
    loading: Arc<DashSet<String>>,
    routing: Mutex<RoutingTable>,
    graph: GraphHandle,
    faults: broadcast::Sender<FaultReport>,
}

impl PluginHost {
    pub fn new(config: HostConfig, loaders: LoaderSet) -> HostResult<(Self, RenderGraph)> {
        config.validate()?;
        let (graph, render) = render_graph(&config);
        let (faults, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);
        let host = Self {
            routing: Mutex::new(RoutingTable::new(config.max_plugins)),
            config,
            loaders: Arc::new(loaders),
            instances: DashMap::new(),
            loading: Arc::new(DashSet::new()),
            graph,
            faults,
        };
        Ok((host, render))
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn plugin_state(&self, plugin_id: &str) -> PluginState {
        if let Some(plugin) = self.instances.get(plugin_id) {
            return plugin.state;
        }
        if self.loading.contains(plugin_id) {
            return PluginState::Loading;
        }
        PluginState::Unloaded
    }

    pub fn loaded_plugins(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn plugin_info(&self, plugin_id: &str) -> HostResult<PluginInfo> {
        self.instances
            .get(plugin_id)
            .map(|plugin| plugin.info())
            .ok_or_else(|| HostError::not_found(plugin_id))
    }

    /// Start loading `descriptor` on the blocking pool.
    ///
    /// Must be called from within a tokio runtime.
    pub fn begin_load(&self, descriptor: PluginDescriptor) -> HostResult<PendingLoad> {
        let plugin_id = descriptor.id.clone();
        if let Some(plugin) = self.instances.get(&plugin_id) {
            return Err(plugin.invalid_state("load"));
        }
        if !self.loaders.supports(descriptor.format) {
            return Err(HostError::load(
                &plugin_id,
                LoadPhase::Format,
                format!("no loader for format {}", descriptor.format),
            ));
        }
        if !self.loading.insert(plugin_id.clone()) {
            return Err(HostError::InvalidState {
                plugin_id,
                state: PluginState::Loading.to_string(),
                operation: "load",
            });
        }
        let guard = LoadingGuard {
            loading: self.loading.clone(),
            plugin_id: plugin_id.clone(),
        };

        log::info!("Loading plugin {} ({}) from {}", plugin_id, descriptor.format, descriptor.download_url);
        let metadata = PluginMetadata::from_descriptor(&descriptor, self.config.default_polyphony);
        let loaders = self.loaders.clone();
        let task_metadata = metadata.clone();
        let task = tokio::task::spawn_blocking(move || loaders.load(&descriptor, &task_metadata));

        Ok(PendingLoad {
            metadata,
            task,
            _guard: guard,
        })
    }

    /// Finish a load: initialize the unit, apply its defaults and register it as Ready.
    pub async fn complete_load(&self, pending: PendingLoad) -> HostResult<PluginInfo> {
        let PendingLoad {
            metadata,
            task,
            _guard,
        } = pending;
        let plugin_id = metadata.id.clone();

        let loaded = match task.await {
            Ok(result) => result,
            Err(e) => Err(HostError::load(&plugin_id, LoadPhase::Compile, format!("loader task failed: {}", e))),
        }
        .map_err(|e| {
            log::warn!("{}", e);
            e
        })?;

        let LoadedUnit {
            mut unit,
            library,
            digest,
            entry_point,
            defaults,
        } = loaded;

        if let Err(source) = unit.initialize(self.config.sample_rate, self.config.max_block_size) {
            log::warn!("Plugin {} failed to initialize: {}", plugin_id, source);
            unit.dispose();
            return Err(HostError::Initialization { plugin_id, source });
        }

        let parameters = unit.parameters().clone();
        let presets = unit.factory_presets().to_vec();
        let applied = parameters.apply_snapshot(&defaults);
        if applied < defaults.len() {
            log::debug!(
                "Plugin {}: applied {} of {} manifest defaults",
                plugin_id,
                applied,
                defaults.len()
            );
        }

        let plugin = HostedPlugin {
            metadata,
            state: PluginState::Ready,
            parameters,
            presets,
            unit: Arc::new(Mutex::new(unit)),
            entry_point,
            digest,
            fault: None,
            slot: None,
            _library: library,
        };
        let info = plugin.info();
        self.instances.insert(plugin_id.clone(), plugin);
        log::info!("Plugin {} ready (entry point {})", plugin_id, info.entry_point);
        Ok(info)
    }

    /// Load, initialize and register a plugin. On failure nothing is kept.
    pub async fn load_plugin(&self, descriptor: PluginDescriptor) -> HostResult<PluginInfo> {
        let pending = self.begin_load(descriptor)?;
        self.complete_load(pending).await
    }

    /// Wire a Ready or Disconnected plugin between two graph nodes.
    ///
    /// Nodes are `"input"`, `"output"` or the id of another connected plugin.
    pub fn connect_plugin(&self, plugin_id: &str, input_node: &str, output_node: &str) -> HostResult<()> {
        let mut plugin = self
            .instances
            .get_mut(plugin_id)
            .ok_or_else(|| HostError::not_found(plugin_id))?;
        if !matches!(plugin.state, PluginState::Ready | PluginState::Disconnected) {
            return Err(plugin.invalid_state("connect"));
        }
        let input = GraphNode::from(input_node);
        let output = GraphNode::from(output_node);

        if plugin.state == PluginState::Disconnected {
            plugin.unit.lock().reset();
        }
        let bridge = AudioGraphBridge::new(
            plugin_id,
            &plugin.unit,
            plugin.parameters.clone(),
            self.config.channels,
            self.config.max_block_size,
        );

        let mut routing = self.routing.lock();
        let mut batch = self
            .graph
            .reserve(2)
            .ok_or_else(|| HostError::routing(plugin_id, "render command queue is full"))?;
        let (slot, plan) = routing.connect(plugin_id, &input, &output)?;
        batch.push(GraphCommand::Attach {
            slot,
            bridge: Box::new(bridge),
        });
        batch.push(GraphCommand::Plan(Box::new(plan)));

        plugin.state = PluginState::Connected;
        plugin.slot = Some(slot);
        plugin.fault = None;
        log::info!("Connected plugin {}: {} -> {} (slot {})", plugin_id, input, output, slot);
        Ok(())
    }

    /// Detach a Connected plugin from the graph; it stays loaded.
    pub fn disconnect_plugin(&self, plugin_id: &str) -> HostResult<()> {
        let mut plugin = self
            .instances
            .get_mut(plugin_id)
            .ok_or_else(|| HostError::not_found(plugin_id))?;
        if plugin.state != PluginState::Connected {
            return Err(plugin.invalid_state("disconnect"));
        }
        self.detach(plugin_id)?;
        plugin.state = PluginState::Disconnected;
        plugin.slot = None;
        log::info!("Disconnected plugin {}", plugin_id);
        Ok(())
    }

    fn detach(&self, plugin_id: &str) -> HostResult<()> {
        let mut routing = self.routing.lock();
        let mut batch = self
            .graph
            .reserve(2)
            .ok_or_else(|| HostError::routing(plugin_id, "render command queue is full"))?;
        let (slot, plan) = routing.disconnect(plugin_id)?;
        batch.push(GraphCommand::Detach { slot });
        batch.push(GraphCommand::Plan(Box::new(plan)));
        Ok(())
    }

    /// Dispose and forget a plugin in whatever state it is in.
    pub fn unload_plugin(&self, plugin_id: &str) {
        let Some((_, plugin)) = self.instances.remove(plugin_id) else {
            log::debug!("Unload of unknown plugin {} ignored", plugin_id);
            return;
        };
        if plugin.slot.is_some() {
            if let Err(e) = self.detach(plugin_id) {
                // bridge renders silence once the unit is gone; drop the routing anyway
                log::warn!("Unloading {} without a clean detach: {}", plugin_id, e);
                let _ = self.routing.lock().disconnect(plugin_id);
            }
        }
        plugin.unit.lock().dispose();
        drop(plugin);
        log::info!("Unloaded plugin {}", plugin_id);
    }

    fn with_plugin<T>(&self, plugin_id: &str, f: impl FnOnce(&HostedPlugin) -> HostResult<T>) -> HostResult<T> {
        let plugin = self
            .instances
            .get(plugin_id)
            .ok_or_else(|| HostError::not_found(plugin_id))?;
        f(&plugin)
    }

    pub fn set_parameter(
        &self,
        plugin_id: &str,
        param_id: &str,
        value: impl Into<ParameterValue>,
    ) -> HostResult<ParameterValue> {
        self.with_plugin(plugin_id, |plugin| {
            plugin
                .parameters
                .set(param_id, value)
                .map_err(|e| HostError::parameter(plugin_id, e))
        })
    }

    pub fn get_parameter(&self, plugin_id: &str, param_id: &str) -> HostResult<ParameterValue> {
        self.with_plugin(plugin_id, |plugin| {
            plugin
                .parameters
                .get(param_id)
                .map_err(|e| HostError::parameter(plugin_id, e))
        })
    }

    pub fn parameter_snapshot(&self, plugin_id: &str) -> HostResult<BTreeMap<String, ParameterValue>> {
        self.with_plugin(plugin_id, |plugin| Ok(plugin.parameters.snapshot()))
    }

    /// Schedule a parameter change.
    ///
    /// Float parameters of a connected plugin glide to `value` over the configured ramp,
    /// starting at transport time `at_time` or on the next block. Everything else is
    /// written immediately.
    pub fn automate_parameter(
        &self,
        plugin_id: &str,
        param_id: &str,
        value: impl Into<ParameterValue>,
        at_time: Option<f64>,
    ) -> HostResult<AutomationPath> {
        let value = value.into();
        self.with_plugin(plugin_id, |plugin| {
            let layout = plugin.parameters.layout();
            let index = layout
                .index_of(param_id)
                .ok_or_else(|| HostError::parameter(plugin_id, ParameterError::unknown(param_id)))?;
            let descriptor = &layout.descriptors()[index];
            if !descriptor.automatable {
                return Err(HostError::parameter(
                    plugin_id,
                    ParameterError::NotAutomatable {
                        id: param_id.to_string(),
                    },
                ));
            }

            let ramp_samples = self.config.ramp_samples();
            let ramp_slot = match (plugin.state, plugin.slot, &descriptor.kind) {
                (PluginState::Connected, Some(slot), ParameterKind::Float)
                    if self.config.native_ramps && ramp_samples > 0 =>
                {
                    Some(slot)
                }
                _ => None,
            };

            if let Some(slot) = ramp_slot {
                let target = value.as_f64().ok_or_else(|| {
                    HostError::parameter(
                        plugin_id,
                        ParameterError::InvalidType {
                            id: param_id.to_string(),
                            expected: "number",
                            found: value.kind_name(),
                        },
                    )
                })?;
                let ramp = ParameterRamp::new(index, descriptor.clamp_number(target), at_time, ramp_samples);
                match self.graph.send(GraphCommand::Ramp { slot, ramp }) {
                    Ok(()) => {
                        log::debug!("Ramping {}.{} to {} over {} samples", plugin_id, param_id, target, ramp_samples);
                        return Ok(AutomationPath::Ramp);
                    }
                    Err(_) => log::debug!("Command queue full, setting {}.{} immediately", plugin_id, param_id),
                }
            }

            plugin
                .parameters
                .set_index(index, &value)
                .map_err(|e| HostError::parameter(plugin_id, e))?;
            Ok(AutomationPath::Immediate)
        })
    }

    pub fn save_plugin_preset(&self, plugin_id: &str, name: &str) -> HostResult<Preset> {
        self.with_plugin(plugin_id, |plugin| Ok(Preset::new(name, plugin.parameters.snapshot())))
    }

    /// Apply a preset; returns how many of its values were applied.
    pub fn load_plugin_preset(&self, plugin_id: &str, preset: &Preset) -> HostResult<usize> {
        self.with_plugin(plugin_id, |plugin| {
            let applied = plugin.parameters.apply_snapshot(&preset.parameters);
            log::info!("Loaded preset '{}' into {} ({} values)", preset.name, plugin_id, applied);
            Ok(applied)
        })
    }

    pub fn factory_presets(&self, plugin_id: &str) -> HostResult<Vec<Preset>> {
        self.with_plugin(plugin_id, |plugin| Ok(plugin.presets.clone()))
    }

    pub fn load_factory_preset(&self, plugin_id: &str, name: &str) -> HostResult<usize> {
        let preset = self.with_plugin(plugin_id, |plugin| {
            plugin
                .presets
                .iter()
                .find(|preset| preset.name == name)
                .cloned()
                .ok_or_else(|| HostError::Preset {
                    reason: format!("{} has no factory preset named '{}'", plugin_id, name),
                })
        })?;
        self.load_plugin_preset(plugin_id, &preset)
    }

    pub fn subscribe_faults(&self) -> broadcast::Receiver<FaultReport> {
        self.faults.subscribe()
    }

    /// Drain the render → control queue.
    ///
    /// Retired bridges and plans are freed here. Each fault disconnects its plugin and
    /// is broadcast to subscribers. Returns the faults handled.
    pub fn poll_render_events(&self) -> Vec<FaultReport> {
        let mut reports = Vec::new();
        for event in self.graph.drain_events() {
            let fault = match event {
                RenderEvent::Fault(fault) => fault,
                RenderEvent::RetiredBridge(_) | RenderEvent::RetiredPlan(_) => continue,
            };
            let report = FaultReport {
                plugin_id: fault.plugin_id.to_string(),
                reason: fault.reason.to_string(),
                at_time: fault.at_time,
            };
            log::error!("{}", fault);

            if let Some(mut plugin) = self.instances.get_mut(&report.plugin_id) {
                if plugin.state == PluginState::Connected {
                    if let Err(e) = self.detach(&report.plugin_id) {
                        log::warn!("Failed to detach faulted plugin {}: {}", report.plugin_id, e);
                        let _ = self.routing.lock().disconnect(&report.plugin_id);
                    }
                    plugin.state = PluginState::Disconnected;
                    plugin.slot = None;
                }
                plugin.fault = Some(report.reason.clone());
            }

            let _ = self.faults.send(report.clone());
            reports.push(report);
        }
        reports
    }

    /// Poll render events every `period` until the host is dropped.
    pub fn spawn_fault_monitor(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let host: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(host) = host.upgrade() else {
                    break;
                };
                host.poll_render_events();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::api::{PluginCategory, PluginFormat};
    use crate::plugin::manifest::ScriptManifest;
    use crate::plugin::registry::{UnitRegistry, LOG_DRUM_SYNTH, PARAMETRIC_EQ};
    use crate::plugin::source::MemorySource;
    use crate::processing::RenderContext;

    fn test_host() -> (PluginHost, RenderGraph) {
        let source = MemorySource::new()
            .with_artifact("eq.toml", ScriptManifest::new(PARAMETRIC_EQ).to_toml().unwrap())
            .with_artifact(
                "drum.toml",
                ScriptManifest::new(LOG_DRUM_SYNTH)
                    .with_default("tone", 0.7)
                    .to_toml()
                    .unwrap(),
            )
            .with_artifact("broken.toml", "[plugin]\ndefault_export = \"reverb\"\n");
        let loaders = LoaderSet::new(Arc::new(source), Arc::new(UnitRegistry::with_builtin()));
        let config = HostConfig {
            sample_rate: 48000.0,
            max_block_size: 128,
            automation_ramp_ms: 10.0,
            ..HostConfig::default()
        };
        PluginHost::new(config, loaders).unwrap()
    }

    fn eq_descriptor(id: &str) -> PluginDescriptor {
        PluginDescriptor::new(id, "EQ", PluginCategory::Effect, PluginFormat::Interpreted, "eq.toml")
    }

    #[tokio::test]
    async fn test_load_registers_ready_plugin() {
        let (host, _graph) = test_host();
        assert_eq!(host.plugin_state("eq"), PluginState::Unloaded);

        let info = host.load_plugin(eq_descriptor("eq")).await.unwrap();
        assert_eq!(info.state, PluginState::Ready);
        assert_eq!(info.entry_point, PARAMETRIC_EQ);
        assert_eq!(info.digest.len(), 64);
        assert_eq!(host.plugin_state("eq"), PluginState::Ready);
        assert_eq!(host.loaded_plugins(), vec!["eq".to_string()]);
    }

    #[tokio::test]
    async fn test_manifest_defaults_are_applied() {
        let (host, _graph) = test_host();
        let descriptor =
            PluginDescriptor::new("drum", "Drum", PluginCategory::Instrument, PluginFormat::Interpreted, "drum.toml");
        host.load_plugin(descriptor).await.unwrap();
        let tone = host.get_parameter("drum", "tone").unwrap().as_f64().unwrap();
        assert!((tone - 0.7).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_pending_load_reports_loading_state() {
        let (host, _graph) = test_host();
        let pending = host.begin_load(eq_descriptor("eq")).unwrap();
        assert_eq!(pending.plugin_id(), "eq");
        assert_eq!(host.plugin_state("eq"), PluginState::Loading);
        assert!(matches!(
            host.begin_load(eq_descriptor("eq")),
            Err(HostError::InvalidState { .. })
        ));

        host.complete_load(pending).await.unwrap();
        assert_eq!(host.plugin_state("eq"), PluginState::Ready);
        assert!(matches!(
            host.load_plugin(eq_descriptor("eq")).await,
            Err(HostError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_loads_leave_nothing_behind() {
        let (host, _graph) = test_host();

        let missing = PluginDescriptor::new("gone", "Gone", PluginCategory::Effect, PluginFormat::Interpreted, "nope");
        match host.load_plugin(missing).await {
            Err(HostError::PluginLoad { phase, .. }) => assert_eq!(phase, LoadPhase::Fetch),
            other => panic!("Expected fetch failure, got {:?}", other.map(|info| info.state)),
        }
        assert_eq!(host.plugin_state("gone"), PluginState::Unloaded);

        let broken =
            PluginDescriptor::new("broken", "Broken", PluginCategory::Effect, PluginFormat::Interpreted, "broken.toml");
        match host.load_plugin(broken).await {
            Err(HostError::PluginLoad { phase, .. }) => assert_eq!(phase, LoadPhase::EntryPoint),
            other => panic!("Expected entry point failure, got {:?}", other.map(|info| info.state)),
        }
        assert!(host.loaded_plugins().is_empty());
    }

    #[tokio::test]
    async fn test_connect_disconnect_transitions() {
        let (host, mut graph) = test_host();
        host.load_plugin(eq_descriptor("eq")).await.unwrap();

        host.connect_plugin("eq", "input", "output").unwrap();
        assert_eq!(host.plugin_state("eq"), PluginState::Connected);
        assert!(matches!(
            host.connect_plugin("eq", "input", "output"),
            Err(HostError::InvalidState { .. })
        ));

        let input = [0.0f32; 128];
        let mut left = [0.0f32; 128];
        let mut right = [0.0f32; 128];
        graph.render(&[&input, &input], &mut [&mut left, &mut right], &RenderContext::new(48000.0, 128), &[]);
        assert_eq!(graph.attached_bridges(), 1);

        host.disconnect_plugin("eq").unwrap();
        assert_eq!(host.plugin_state("eq"), PluginState::Disconnected);
        assert!(matches!(host.disconnect_plugin("eq"), Err(HostError::InvalidState { .. })));

        // manual reconnect
        host.connect_plugin("eq", "input", "output").unwrap();
        assert_eq!(host.plugin_state("eq"), PluginState::Connected);

        assert!(matches!(
            host.connect_plugin("nobody", "input", "output"),
            Err(HostError::PluginNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_unload_in_any_state() {
        let (host, _graph) = test_host();
        host.load_plugin(eq_descriptor("a")).await.unwrap();
        host.load_plugin(eq_descriptor("b")).await.unwrap();
        host.connect_plugin("b", "input", "output").unwrap();

        host.unload_plugin("a");
        host.unload_plugin("b");
        host.unload_plugin("never-loaded");
        assert!(host.loaded_plugins().is_empty());
        assert_eq!(host.plugin_state("b"), PluginState::Unloaded);

        // slot was released
        host.load_plugin(eq_descriptor("b")).await.unwrap();
        host.connect_plugin("b", "input", "output").unwrap();
    }

    #[tokio::test]
    async fn test_automation_paths() {
        let (host, mut graph) = test_host();
        host.load_plugin(eq_descriptor("eq")).await.unwrap();

        // not connected yet
        assert_eq!(
            host.automate_parameter("eq", "low_gain", 3.0, None).unwrap(),
            AutomationPath::Immediate
        );
        assert_eq!(host.get_parameter("eq", "low_gain").unwrap(), ParameterValue::Number(3.0));

        host.connect_plugin("eq", "input", "output").unwrap();
        assert_eq!(
            host.automate_parameter("eq", "low_gain", 9.0, None).unwrap(),
            AutomationPath::Ramp
        );
        assert_eq!(
            host.automate_parameter("eq", "bypass", true, None).unwrap(),
            AutomationPath::Immediate
        );
        assert!(matches!(
            host.automate_parameter("eq", "shimmer", 1.0, None),
            Err(HostError::Parameter { .. })
        ));

        // 10 ms at 48 kHz is 480 samples: four 128-sample blocks
        let input = [0.0f32; 128];
        let mut left = [0.0f32; 128];
        let mut right = [0.0f32; 128];
        let mut context = RenderContext::new(48000.0, 128);
        graph.render(&[&input, &input], &mut [&mut left, &mut right], &context, &[]);
        let midway = host.get_parameter("eq", "low_gain").unwrap().as_f64().unwrap();
        assert!(midway > 3.0 && midway < 9.0);

        for _ in 0..3 {
            context.advance(128);
            graph.render(&[&input, &input], &mut [&mut left, &mut right], &context, &[]);
        }
        assert_eq!(host.get_parameter("eq", "low_gain").unwrap(), ParameterValue::Number(9.0));
    }

    #[tokio::test]
    async fn test_presets_through_host() {
        let (host, _graph) = test_host();
        host.load_plugin(eq_descriptor("eq")).await.unwrap();

        let names: Vec<String> = host
            .factory_presets("eq")
            .unwrap()
            .into_iter()
            .map(|preset| preset.name)
            .collect();
        assert!(names.contains(&"log-drum boost".to_string()));

        assert_eq!(host.load_factory_preset("eq", "log-drum boost").unwrap(), 17);
        assert_eq!(host.get_parameter("eq", "low_freq").unwrap(), ParameterValue::Number(60.0));
        assert!(matches!(
            host.load_factory_preset("eq", "missing"),
            Err(HostError::Preset { .. })
        ));

        let saved = host.save_plugin_preset("eq", "mine").unwrap();
        host.set_parameter("eq", "low_freq", 200.0).unwrap();
        host.load_plugin_preset("eq", &saved).unwrap();
        assert_eq!(host.parameter_snapshot("eq").unwrap(), saved.parameters);
    }

    #[tokio::test]
    async fn test_presets_leave_unit_lock_to_render_thread() {
        let (host, _graph) = test_host();
        host.load_plugin(eq_descriptor("eq")).await.unwrap();
        let unit = host.instances.get("eq").unwrap().unit.clone();

        // stands in for a render block in progress
        let _render_block = unit.lock();
        assert!(!host.factory_presets("eq").unwrap().is_empty());
        assert_eq!(host.load_factory_preset("eq", "log-drum boost").unwrap(), 17);
        let saved = host.save_plugin_preset("eq", "during render").unwrap();
        assert_eq!(saved.parameter("low_gain"), Some(&ParameterValue::Number(4.0)));
        assert_eq!(host.load_plugin_preset("eq", &saved).unwrap(), 17);
        assert!(unit.is_locked());
    }
}
