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

//! Render graph
//!
//! The control side keeps a [`RoutingTable`] and compiles it into a [`RenderPlan`].
//! Plans, bridges and ramps travel to the render side over a lock-free SPSC queue;
//! retired objects and faults come back over a second one so nothing is freed or
//! logged on the render thread.

pub mod bridge;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use parking_lot::{Mutex, MutexGuard};
use ringbuf::{traits::*, HeapRb};

use crate::config::HostConfig;
use crate::errors::{HostError, HostResult, RenderFault};
use crate::processing::{AudioBuffer, MidiEvent, RenderContext};

pub use bridge::{AudioGraphBridge, ParameterRamp, SharedUnit};

/// Endpoint of a routing edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GraphNode {
    /// Audio handed to `RenderGraph::render`.
    Input,
    /// Audio returned from `RenderGraph::render`.
    Output,
    Plugin(String),
}

impl From<&str> for GraphNode {
    fn from(name: &str) -> Self {
        match name {
            "input" => GraphNode::Input,
            "output" => GraphNode::Output,
            other => GraphNode::Plugin(other.to_string()),
        }
    }
}

impl FromStr for GraphNode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(GraphNode::from(s))
    }
}

impl fmt::Display for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphNode::Input => f.write_str("input"),
            GraphNode::Output => f.write_str("output"),
            GraphNode::Plugin(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Input,
    Slot(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub slot: usize,
    pub sources: Vec<Source>,
}

/// Processing order for one routing state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderPlan {
    pub steps: Vec<PlanStep>,
    pub output_sources: Vec<Source>,
}

/// Control-side routing state: slots and edges between graph nodes.
#[derive(Debug)]
pub struct RoutingTable {
    slots: HashMap<String, usize>,
    free: Vec<usize>,
    edges: Vec<(GraphNode, GraphNode)>,
}

impl RoutingTable {
    pub fn new(max_plugins: usize) -> Self {
        Self {
            slots: HashMap::new(),
            // popped from the back, lowest slot first
            free: (0..max_plugins).rev().collect(),
            edges: Vec::new(),
        }
    }

    pub fn slot_of(&self, plugin_id: &str) -> Option<usize> {
        self.slots.get(plugin_id).copied()
    }

    pub fn routed_plugins(&self) -> usize {
        self.slots.len()
    }

    fn check_node(&self, plugin_id: &str, node: &GraphNode) -> HostResult<()> {
        match node {
            GraphNode::Plugin(other) if other != plugin_id && !self.slots.contains_key(other) => {
                Err(HostError::routing(plugin_id, format!("unknown graph node '{}'", other)))
            }
            _ => Ok(()),
        }
    }

    /// Route `plugin_id` from `input` to `output` and compile the new plan.
    ///
    /// On failure the table is left as it was.
    pub fn connect(&mut self, plugin_id: &str, input: &GraphNode, output: &GraphNode) -> HostResult<(usize, RenderPlan)> {
        if self.slots.contains_key(plugin_id) {
            return Err(HostError::routing(plugin_id, "already routed"));
        }
        if *input == GraphNode::Output {
            return Err(HostError::routing(plugin_id, "the output node cannot feed a plugin"));
        }
        if *output == GraphNode::Input {
            return Err(HostError::routing(plugin_id, "a plugin cannot feed the input node"));
        }
        self.check_node(plugin_id, input)?;
        self.check_node(plugin_id, output)?;

        let slot = self
            .free
            .pop()
            .ok_or_else(|| HostError::routing(plugin_id, "no free graph slot"))?;
        let node = GraphNode::Plugin(plugin_id.to_string());
        self.slots.insert(plugin_id.to_string(), slot);
        self.edges.push((input.clone(), node.clone()));
        self.edges.push((node, output.clone()));

        match self.plan() {
            Ok(plan) => Ok((slot, plan)),
            Err(error) => {
                self.remove(plugin_id);
                Err(error)
            }
        }
    }

    /// Remove `plugin_id` and every edge touching it. Returns its freed slot.
    pub fn disconnect(&mut self, plugin_id: &str) -> HostResult<(usize, RenderPlan)> {
        let slot = self
            .remove(plugin_id)
            .ok_or_else(|| HostError::routing(plugin_id, "not routed"))?;
        Ok((slot, self.plan()?))
    }

    fn remove(&mut self, plugin_id: &str) -> Option<usize> {
        let slot = self.slots.remove(plugin_id)?;
        let node = GraphNode::Plugin(plugin_id.to_string());
        self.edges.retain(|(from, to)| *from != node && *to != node);
        self.free.push(slot);
        Some(slot)
    }

    fn source_of(&self, node: &GraphNode) -> Option<Source> {
        match node {
            GraphNode::Input => Some(Source::Input),
            GraphNode::Plugin(id) => self.slot_of(id).map(Source::Slot),
            GraphNode::Output => None,
        }
    }

    /// Compile the current edges into a processing order.
    pub fn plan(&self) -> HostResult<RenderPlan> {
        let mut order = Vec::with_capacity(self.slots.len());
        let mut visited = HashSet::new();
        let mut temp_visited = HashSet::new();

        let mut plugin_ids: Vec<&str> = self.slots.keys().map(String::as_str).collect();
        plugin_ids.sort_by_key(|id| self.slots[*id]);
        for plugin_id in plugin_ids {
            if !visited.contains(plugin_id) {
                self.visit(plugin_id, &mut visited, &mut temp_visited, &mut order)?;
            }
        }

        let steps = order
            .into_iter()
            .map(|plugin_id| {
                let node = GraphNode::Plugin(plugin_id.to_string());
                PlanStep {
                    slot: self.slots[plugin_id],
                    sources: self
                        .edges
                        .iter()
                        .filter(|(_, to)| *to == node)
                        .filter_map(|(from, _)| self.source_of(from))
                        .collect(),
                }
            })
            .collect();
        let output_sources = self
            .edges
            .iter()
            .filter(|(_, to)| *to == GraphNode::Output)
            .filter_map(|(from, _)| self.source_of(from))
            .collect();

        Ok(RenderPlan { steps, output_sources })
    }

    // upstream plugins are pushed before the plugins they feed
    fn visit<'a>(
        &'a self,
        plugin_id: &'a str,
        visited: &mut HashSet<&'a str>,
        temp_visited: &mut HashSet<&'a str>,
        order: &mut Vec<&'a str>,
    ) -> HostResult<()> {
        if visited.contains(plugin_id) {
            return Ok(());
        }
        if !temp_visited.insert(plugin_id) {
            return Err(HostError::routing(plugin_id, "routing would create a cycle"));
        }

        for (from, to) in &self.edges {
            match (from, to) {
                (GraphNode::Plugin(upstream), GraphNode::Plugin(target)) if target == plugin_id => {
                    self.visit(upstream, visited, temp_visited, order)?;
                }
                _ => {}
            }
        }

        temp_visited.remove(plugin_id);
        visited.insert(plugin_id);
        order.push(plugin_id);
        Ok(())
    }
}

/// Control → render messages.
pub enum GraphCommand {
    Attach { slot: usize, bridge: Box<AudioGraphBridge> },
    Detach { slot: usize },
    Plan(Box<RenderPlan>),
    Ramp { slot: usize, ramp: ParameterRamp },
}

impl fmt::Debug for GraphCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphCommand::Attach { slot, bridge } => f
                .debug_struct("Attach")
                .field("slot", slot)
                .field("plugin_id", &bridge.plugin_id())
                .finish(),
            GraphCommand::Detach { slot } => f.debug_struct("Detach").field("slot", slot).finish(),
            GraphCommand::Plan(plan) => f.debug_tuple("Plan").field(plan).finish(),
            GraphCommand::Ramp { slot, ramp } => f
                .debug_struct("Ramp")
                .field("slot", slot)
                .field("ramp", ramp)
                .finish(),
        }
    }
}

/// Render → control messages.
pub enum RenderEvent {
    Fault(RenderFault),
    RetiredBridge(Box<AudioGraphBridge>),
    RetiredPlan(Box<RenderPlan>),
}

/// Exclusive access to the command queue with room for a known number of commands.
pub struct CommandBatch<'a> {
    producer: MutexGuard<'a, ringbuf::HeapProd<GraphCommand>>,
}

impl CommandBatch<'_> {
    pub fn push(&mut self, command: GraphCommand) {
        // room was checked in `GraphHandle::reserve` and only the consumer frees slots
        let _ = self.producer.try_push(command);
    }
}

/// Control-side ends of the render queues.
pub struct GraphHandle {
    commands: Mutex<ringbuf::HeapProd<GraphCommand>>,
    events: Mutex<ringbuf::HeapCons<RenderEvent>>,
}

impl GraphHandle {
    /// Queue a command; hands it back when the queue is full.
    pub fn send(&self, command: GraphCommand) -> Result<(), GraphCommand> {
        self.commands.lock().try_push(command)
    }

    /// Lock the command queue if it has room for `count` commands.
    pub fn reserve(&self, count: usize) -> Option<CommandBatch<'_>> {
        let producer = self.commands.lock();
        if producer.vacant_len() < count {
            return None;
        }
        Some(CommandBatch { producer })
    }

    pub fn drain_events(&self) -> Vec<RenderEvent> {
        let mut consumer = self.events.lock();
        let mut drained = Vec::new();
        while let Some(event) = consumer.try_pop() {
            drained.push(event);
        }
        drained
    }
}

/// Real-time side of the graph. Call [`RenderGraph::render`] once per block.
pub struct RenderGraph {
    commands: ringbuf::HeapCons<GraphCommand>,
    events: ringbuf::HeapProd<RenderEvent>,
    slots: Vec<Option<Box<AudioGraphBridge>>>,
    plan: Box<RenderPlan>,
    input: AudioBuffer,
    mix: AudioBuffer,
    max_block_size: usize,
}

/// Create both ends of a render graph sized by `config`.
pub fn render_graph(config: &HostConfig) -> (GraphHandle, RenderGraph) {
    let (command_producer, command_consumer) = HeapRb::new(config.command_queue_capacity).split();
    let (event_producer, event_consumer) = HeapRb::new(config.event_queue_capacity).split();

    let handle = GraphHandle {
        commands: Mutex::new(command_producer),
        events: Mutex::new(event_consumer),
    };
    let graph = RenderGraph {
        commands: command_consumer,
        events: event_producer,
        slots: (0..config.max_plugins).map(|_| None).collect(),
        plan: Box::default(),
        input: AudioBuffer::new(config.channels, config.max_block_size),
        mix: AudioBuffer::new(config.channels, config.max_block_size),
        max_block_size: config.max_block_size,
    };
    (handle, graph)
}

impl RenderGraph {
    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    pub fn attached_bridges(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    // a full event queue drops the retired object here
    fn retire(&mut self, event: RenderEvent) {
        let _ = self.events.try_push(event);
    }

    fn apply_commands(&mut self) {
        while let Some(command) = self.commands.try_pop() {
            match command {
                GraphCommand::Attach { slot, bridge } => {
                    if let Some(entry) = self.slots.get_mut(slot) {
                        if let Some(previous) = entry.replace(bridge) {
                            self.retire(RenderEvent::RetiredBridge(previous));
                        }
                    }
                }
                GraphCommand::Detach { slot } => {
                    if let Some(previous) = self.slots.get_mut(slot).and_then(Option::take) {
                        self.retire(RenderEvent::RetiredBridge(previous));
                    }
                }
                GraphCommand::Plan(plan) => {
                    let previous = std::mem::replace(&mut self.plan, plan);
                    self.retire(RenderEvent::RetiredPlan(previous));
                }
                GraphCommand::Ramp { slot, ramp } => {
                    if let Some(Some(bridge)) = self.slots.get_mut(slot) {
                        bridge.schedule_ramp(ramp);
                    }
                }
            }
        }
    }

    /// Render one block.
    ///
    /// The block length is the longest output slice, truncated to the prepared
    /// maximum; samples past it are written as silence. Returns the frames rendered.
    pub fn render(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        context: &RenderContext,
        midi: &[MidiEvent],
    ) -> usize {
        self.apply_commands();

        let requested = outputs.iter().map(|channel| channel.len()).max().unwrap_or(0);
        let frames = requested.min(self.max_block_size);

        let RenderGraph {
            events,
            slots,
            plan,
            input,
            mix,
            ..
        } = self;

        input.set_len(frames);
        input.copy_from_slices(inputs);

        for step in &plan.steps {
            let Some(mut bridge) = slots.get_mut(step.slot).and_then(Option::take) else {
                continue;
            };

            let target = bridge.input_mut();
            target.set_len(frames);
            target.clear();
            for source in &step.sources {
                match source {
                    Source::Input => target.mix_from(input),
                    Source::Slot(upstream) => {
                        if let Some(Some(upstream)) = slots.get(*upstream) {
                            target.mix_from(upstream.output());
                        }
                    }
                }
            }

            if let Some(fault) = bridge.process(context, midi, frames) {
                let _ = events.try_push(RenderEvent::Fault(fault));
            }
            slots[step.slot] = Some(bridge);
        }

        mix.set_len(frames);
        mix.clear();
        for source in &plan.output_sources {
            match source {
                Source::Input => mix.mix_from(input),
                Source::Slot(slot) => {
                    if let Some(Some(bridge)) = slots.get(*slot) {
                        mix.mix_from(bridge.output());
                    }
                }
            }
        }
        mix.copy_to_slices(outputs);
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::plugin::api::{PluginCategory, PluginDescriptor, PluginFormat, PluginMetadata, PluginUnit};
    use crate::units::EqualizerUnit;

    fn node(name: &str) -> GraphNode {
        GraphNode::from(name)
    }

    #[test]
    fn test_node_parsing() {
        assert_eq!("input".parse::<GraphNode>().unwrap(), GraphNode::Input);
        assert_eq!(node("output"), GraphNode::Output);
        assert_eq!(node("eq-1"), GraphNode::Plugin("eq-1".to_string()));
        assert_eq!(node("eq-1").to_string(), "eq-1");
    }

    #[test]
    fn test_chain_plan_orders_upstream_first() {
        let mut table = RoutingTable::new(4);
        let (eq_slot, _) = table.connect("eq", &node("input"), &node("output")).unwrap();
        let (drum_slot, plan) = table.connect("drum", &node("input"), &node("eq")).unwrap();
        assert_eq!((eq_slot, drum_slot), (0, 1));

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].slot, drum_slot);
        assert_eq!(plan.steps[1].slot, eq_slot);
        assert_eq!(plan.steps[1].sources, vec![Source::Input, Source::Slot(drum_slot)]);
        assert_eq!(plan.output_sources, vec![Source::Slot(eq_slot)]);
    }

    #[test]
    fn test_cycle_is_rejected_and_rolled_back() {
        let mut table = RoutingTable::new(4);
        table.connect("a", &node("input"), &node("output")).unwrap();
        table.connect("b", &node("a"), &node("output")).unwrap();
        let before = table.plan().unwrap();

        // c would feed a and read from b: a -> b -> c -> a
        let error = table.connect("c", &node("b"), &node("a")).unwrap_err();
        assert!(matches!(error, HostError::Routing { .. }));
        assert!(error.to_string().contains("cycle"));
        assert_eq!(table.slot_of("c"), None);
        assert_eq!(table.plan().unwrap(), before);
        assert_eq!(table.routed_plugins(), 2);
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let mut table = RoutingTable::new(2);
        assert!(table.connect("a", &node("a"), &node("output")).is_err());
        assert_eq!(table.routed_plugins(), 0);
    }

    #[test]
    fn test_invalid_endpoints() {
        let mut table = RoutingTable::new(2);
        assert!(table.connect("a", &node("output"), &node("output")).is_err());
        assert!(table.connect("a", &node("input"), &node("input")).is_err());
        let error = table.connect("a", &node("input"), &node("ghost")).unwrap_err();
        assert!(error.to_string().contains("ghost"));

        table.connect("a", &node("input"), &node("output")).unwrap();
        assert!(table.connect("a", &node("input"), &node("output")).is_err());
    }

    #[test]
    fn test_slots_are_exhausted_and_reused() {
        let mut table = RoutingTable::new(1);
        table.connect("a", &node("input"), &node("output")).unwrap();
        let error = table.connect("b", &node("input"), &node("output")).unwrap_err();
        assert!(error.to_string().contains("no free graph slot"));

        let (slot, plan) = table.disconnect("a").unwrap();
        assert_eq!(slot, 0);
        assert!(plan.steps.is_empty());
        assert!(plan.output_sources.is_empty());
        assert_eq!(table.connect("b", &node("input"), &node("output")).unwrap().0, 0);
        assert!(table.disconnect("a").is_err());
    }

    fn small_config() -> HostConfig {
        HostConfig {
            sample_rate: 48000.0,
            max_block_size: 64,
            channels: 1,
            max_plugins: 4,
            ..HostConfig::default()
        }
    }

    fn bypassed_eq(id: &str) -> (SharedUnit, AudioGraphBridge) {
        let descriptor = PluginDescriptor::new(id, "EQ", PluginCategory::Effect, PluginFormat::Interpreted, "eq");
        let mut unit = EqualizerUnit::new(PluginMetadata::from_descriptor(&descriptor, 8));
        unit.initialize(48000.0, 64).unwrap();
        unit.parameters().set("bypass", true).unwrap();
        let parameters = unit.parameters().clone();
        let unit: Box<dyn PluginUnit> = Box::new(unit);
        let shared: SharedUnit = Arc::new(parking_lot::Mutex::new(unit));
        let bridge = AudioGraphBridge::new(id, &shared, parameters, 1, 64);
        (shared, bridge)
    }

    #[test]
    fn test_render_routes_through_attached_bridge() {
        let config = small_config();
        let (handle, mut graph) = render_graph(&config);
        let mut table = RoutingTable::new(config.max_plugins);
        let (_unit, bridge) = bypassed_eq("eq");
        let (slot, plan) = table.connect("eq", &node("input"), &node("output")).unwrap();

        handle
            .send(GraphCommand::Attach {
                slot,
                bridge: Box::new(bridge),
            })
            .unwrap();
        handle.send(GraphCommand::Plan(Box::new(plan))).unwrap();

        let input = [0.25f32; 64];
        let mut output = [0.0f32; 64];
        let context = RenderContext::new(48000.0, 64);
        let frames = graph.render(&[&input], &mut [&mut output], &context, &[]);
        assert_eq!(frames, 64);
        assert_eq!(graph.attached_bridges(), 1);
        assert!(output.iter().all(|&s| s == 0.25));

        // the initial empty plan comes back for release
        let events = handle.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], RenderEvent::RetiredPlan(_)));

        let (slot, plan) = table.disconnect("eq").unwrap();
        handle.send(GraphCommand::Detach { slot }).unwrap();
        handle.send(GraphCommand::Plan(Box::new(plan))).unwrap();
        graph.render(&[&input], &mut [&mut output], &context, &[]);
        assert!(output.iter().all(|&s| s == 0.0));
        assert_eq!(graph.attached_bridges(), 0);

        let retired = handle.drain_events();
        assert!(retired.iter().any(|e| matches!(e, RenderEvent::RetiredBridge(b) if b.plugin_id() == "eq")));
    }

    #[test]
    fn test_render_truncates_to_max_block() {
        let config = small_config();
        let (handle, mut graph) = render_graph(&config);
        let mut dry = RenderPlan::default();
        dry.output_sources.push(Source::Input);
        handle.send(GraphCommand::Plan(Box::new(dry))).unwrap();

        let input = [0.5f32; 100];
        let mut output = [9.0f32; 100];
        let frames = graph.render(&[&input], &mut [&mut output], &RenderContext::new(48000.0, 100), &[]);
        assert_eq!(frames, 64);
        assert!(output[..64].iter().all(|&s| s == 0.5));
        assert!(output[64..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_full_command_queue_hands_command_back() {
        let config = HostConfig {
            command_queue_capacity: 4,
            ..small_config()
        };
        let (handle, _graph) = render_graph(&config);
        for _ in 0..4 {
            handle.send(GraphCommand::Detach { slot: 0 }).unwrap();
        }
        match handle.send(GraphCommand::Detach { slot: 1 }) {
            Err(GraphCommand::Detach { slot }) => assert_eq!(slot, 1),
            other => panic!("Expected rejected command, got {:?}", other),
        }
        assert!(handle.reserve(1).is_none());
    }
}
