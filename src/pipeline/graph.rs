//! Pipeline graph and scheduler.
//!
//! Nodes are stored in a flat vector indexed by [`NodeId`]; removing a node
//! leaves a tombstone so ids stay stable. The execution sequence is computed
//! lazily by [`PipelineCompiler`] and cached until the graph changes.
//!
//! Each run:
//! 1. Compile the graph if it changed since the last run.
//! 2. Execute nodes in topological order. Inputs are pulled from the ports
//!    written by upstream nodes and checked against the port specs.
//! 3. Check that every output port was written, then flush the GPU queue.
//! 4. Collect the exports of all sinks.
//! 5. Clear the ports, whether the run succeeded or not.

use crate::gpu::Gpu;
use crate::pipeline::compiled_plan::CompiledPlan;
use crate::pipeline::compiler::PipelineCompiler;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{EdgeId, NodeId, PortRef};
use crate::pipeline::message::Message;
use crate::pipeline::node::{Node, NodeContext};
use crate::pipeline::output::PipelineOutput;
use crate::pipeline::port::{PortSpec, DEFAULT_INPUT, DEFAULT_OUTPUT};
use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, info, trace};

/// An edge from an output port to an input port.
#[derive(Debug, Clone)]
pub struct Edge {
    pub id: EdgeId,
    pub from: PortRef,
    pub to: PortRef,
}

/// A node, or the tombstone of a removed one.
pub(crate) struct NodeSlot {
    pub(crate) name: String,
    node: Option<Box<dyn Node>>,
}

impl NodeSlot {
    pub(crate) fn new(name: String, node: Box<dyn Node>) -> Self {
        Self {
            name,
            node: Some(node),
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        self.node.is_some()
    }

    pub(crate) fn ports(&self) -> &'static [PortSpec] {
        self.node.as_ref().map_or(&[], |node| node.ports())
    }

    pub(crate) fn is_source(&self) -> bool {
        self.node.as_ref().is_some_and(|node| node.is_source())
    }

    pub(crate) fn is_sink(&self) -> bool {
        self.node.as_ref().is_some_and(|node| node.is_sink())
    }
}

/// Lifecycle of a graph: `Unbuilt → Built → Running → Built`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    /// Sequence not computed, or invalidated by a change
    Unbuilt,
    Built,
    Running,
}

/// Resets the busy flag when a run ends, including when its future is dropped.
struct BusyGuard(Rc<Cell<bool>>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// A dataflow graph of GPU nodes.
pub struct PipelineGraph {
    gpu: Gpu,
    nodes: Vec<NodeSlot>,
    edges: Vec<Edge>,
    /// Cached execution plan, valid while its generation matches
    plan: Option<CompiledPlan>,
    /// Bumped on every structural change
    generation: u64,
    initialized: bool,
    busy: Rc<Cell<bool>>,
    /// Messages written during the current run
    ports: HashMap<PortRef, Message>,
}

impl PipelineGraph {
    pub fn new(gpu: &Gpu) -> Self {
        Self {
            gpu: gpu.clone(),
            nodes: Vec::new(),
            edges: Vec::new(),
            plan: None,
            generation: 0,
            initialized: false,
            busy: Rc::new(Cell::new(false)),
            ports: HashMap::new(),
        }
    }

    pub fn gpu(&self) -> &Gpu {
        &self.gpu
    }

    /// Register the initial set of nodes. Can only be called once.
    pub fn init(&mut self, nodes: impl IntoIterator<Item = Box<dyn Node>>) -> PipelineResult<()> {
        if self.initialized {
            return Err(PipelineError::AlreadyInitialized);
        }
        for node in nodes {
            self.add_node(node)?;
        }
        self.initialized = true;
        Ok(())
    }

    /// Add a node and acquire its GPU resources.
    pub fn add_node(&mut self, mut node: Box<dyn Node>) -> PipelineResult<NodeId> {
        let name = node.name().to_string();
        if self.node_id(&name).is_some() {
            return Err(PipelineError::DuplicateNode(name));
        }

        node.init(&self.gpu)?;
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeSlot::new(name, node));
        self.invalidate();
        debug!("Added node {} as {}", self.nodes[id.index()].name, id);
        Ok(id)
    }

    /// Convenience wrapper around [`add_node`](Self::add_node)
    pub fn add<N: Node + 'static>(&mut self, node: N) -> PipelineResult<NodeId> {
        self.add_node(Box::new(node))
    }

    /// Release and remove a node together with its edges.
    pub fn remove_node(&mut self, name: &str) -> PipelineResult<()> {
        let id = self
            .node_id(name)
            .ok_or_else(|| PipelineError::UnknownNode(name.to_string()))?;

        if let Some(mut node) = self.nodes[id.index()].node.take() {
            node.release();
        }
        self.edges.retain(|e| e.from.node != id && e.to.node != id);
        self.invalidate();
        debug!("Removed node {}", name);
        Ok(())
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|slot| slot.is_live() && slot.name == name)
            .map(|index| NodeId(index as u32))
    }

    /// Connect `from.from_port` to `to.to_port`.
    ///
    /// The source port must be an output, the target an input that is not
    /// linked yet, and both must carry the same message kind.
    pub fn connect(
        &mut self,
        from: &str,
        from_port: &str,
        to: &str,
        to_port: &str,
    ) -> PipelineResult<EdgeId> {
        let (from_id, from_spec) = self.port(from, from_port)?;
        let (to_id, to_spec) = self.port(to, to_port)?;

        if !from_spec.is_output() {
            return Err(PipelineError::InvalidEdge(format!(
                "{}.{} is not an output port",
                from, from_port
            )));
        }
        if !to_spec.is_input() {
            return Err(PipelineError::InvalidEdge(format!(
                "{}.{} is not an input port",
                to, to_port
            )));
        }

        let target = PortRef::new(to_id, to_spec.name);
        if self.edges.iter().any(|e| e.to == target) {
            return Err(PipelineError::InvalidEdge(format!(
                "{}.{} is already linked",
                to, to_port
            )));
        }

        if let (Some(produced), Some(expected)) = (from_spec.kind, to_spec.kind) {
            if produced != expected {
                return Err(PipelineError::PortMismatch(format!(
                    "{}.{} produces {} but {}.{} expects {}",
                    from, from_port, produced, to, to_port, expected
                )));
            }
        }

        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Edge {
            id,
            from: PortRef::new(from_id, from_spec.name),
            to: target,
        });
        self.invalidate();
        Ok(id)
    }

    /// Connect the default output of `from` to the default input of `to`.
    pub fn link(&mut self, from: &str, to: &str) -> PipelineResult<EdgeId> {
        self.connect(from, DEFAULT_OUTPUT, to, DEFAULT_INPUT)
    }

    pub fn state(&self) -> GraphState {
        if self.busy.get() {
            GraphState::Running
        } else if self.plan_is_current() {
            GraphState::Built
        } else {
            GraphState::Unbuilt
        }
    }

    /// Validate the graph and compute the execution sequence.
    pub fn build(&mut self) -> PipelineResult<&CompiledPlan> {
        let plan = match self.plan.take() {
            Some(plan) if plan.generation == self.generation => plan,
            _ => {
                let plan = PipelineCompiler::compile(&self.nodes, &self.edges, self.generation)?;
                info!(
                    "Compiled pipeline: {} nodes, {} edges, {} sources, {} sinks in {}us",
                    plan.stats.total_nodes,
                    plan.stats.edges,
                    plan.stats.source_nodes,
                    plan.stats.sink_nodes,
                    plan.stats.compile_time_us
                );
                plan
            }
        };
        Ok(self.plan.insert(plan))
    }

    /// Node names in execution order.
    pub fn sequence(&mut self) -> PipelineResult<Vec<String>> {
        let sequence = self.build()?.sequence.clone();
        Ok(sequence
            .into_iter()
            .map(|id| self.nodes[id.index()].name.clone())
            .collect())
    }

    /// Run every node once and collect the sink exports.
    ///
    /// The graph is validated first; a valid graph then fails with
    /// [`PipelineError::Busy`] while another run is in progress.
    pub async fn run(&mut self) -> PipelineResult<PipelineOutput> {
        let sequence = self.build()?.sequence.clone();
        if self.busy.get() {
            return Err(PipelineError::Busy);
        }

        self.busy.set(true);
        let _guard = BusyGuard(self.busy.clone());

        self.ports.clear();
        let result = self.execute(&sequence).await;
        self.ports.clear();
        result
    }

    /// Drive [`run`](Self::run) on a fresh current-thread runtime.
    pub fn run_blocking(&mut self) -> crate::error::Result<PipelineOutput> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(runtime.block_on(self.run())?)
    }

    /// Release every node's GPU resources and clear the graph.
    pub fn release(&mut self) {
        for slot in self.nodes.iter_mut().rev() {
            if let Some(mut node) = slot.node.take() {
                node.release();
                trace!("Released node {}", slot.name);
            }
        }
        self.nodes.clear();
        self.edges.clear();
        self.ports.clear();
        self.plan = None;
        self.initialized = false;
        self.invalidate();
        debug!("Pipeline released");
    }

    async fn execute(&mut self, sequence: &[NodeId]) -> PipelineResult<PipelineOutput> {
        for &id in sequence {
            let inputs = self.gather_inputs(id)?;

            let gpu = &self.gpu;
            let NodeSlot { name, node } = &mut self.nodes[id.index()];
            let Some(node) = node.as_mut() else {
                continue;
            };
            let ports = node.ports();

            let mut ctx = NodeContext::new(gpu, name, ports, inputs);
            node.run(&mut ctx).await?;
            let outputs = ctx.into_outputs();

            for spec in ports.iter().filter(|p| p.is_output()) {
                let Some((_, message)) = outputs.iter().find(|(port, _)| *port == spec.name) else {
                    return Err(PipelineError::MissingOutput {
                        node: name.clone(),
                        port: spec.name.to_string(),
                    });
                };
                self.ports.insert(PortRef::new(id, spec.name), *message);
            }

            gpu.flush();
            trace!("Ran node {}", name);
        }

        let exports = self
            .nodes
            .iter_mut()
            .filter(|slot| slot.is_sink())
            .filter_map(|slot| {
                let name = slot.name.clone();
                slot.node.as_mut().map(|node| async move {
                    let output = node.export().await?;
                    Ok::<_, PipelineError>((name, output))
                })
            });
        let exports = futures::future::try_join_all(exports).await?;

        let mut output = PipelineOutput::default();
        for (name, data) in exports {
            output.insert(name, data);
        }
        Ok(output)
    }

    /// Messages feeding the input ports of `id`, checked against their specs.
    fn gather_inputs(&self, id: NodeId) -> PipelineResult<Vec<(&'static str, Message)>> {
        let slot = &self.nodes[id.index()];
        let mut inputs = Vec::new();

        for spec in slot.ports().iter().filter(|p| p.is_input()) {
            let target = PortRef::new(id, spec.name);
            let Some(edge) = self.edges.iter().find(|e| e.to == target) else {
                return Err(PipelineError::UnconnectedPort {
                    node: slot.name.clone(),
                    port: spec.name.to_string(),
                });
            };
            let message = self.ports.get(&edge.from).ok_or_else(|| PipelineError::NoInput {
                node: slot.name.clone(),
                port: spec.name.to_string(),
            })?;
            spec.accepts(message)
                .map_err(|message| PipelineError::InvalidMessage {
                    node: slot.name.clone(),
                    port: spec.name.to_string(),
                    message,
                })?;
            inputs.push((spec.name, *message));
        }

        Ok(inputs)
    }

    fn port(&self, node: &str, port: &str) -> PipelineResult<(NodeId, PortSpec)> {
        let id = self
            .node_id(node)
            .ok_or_else(|| PipelineError::UnknownNode(node.to_string()))?;
        let spec = self.nodes[id.index()]
            .ports()
            .iter()
            .find(|spec| spec.name == port)
            .copied()
            .ok_or_else(|| PipelineError::UnknownPort {
                node: node.to_string(),
                port: port.to_string(),
            })?;
        Ok((id, spec))
    }

    fn plan_is_current(&self) -> bool {
        self.plan
            .as_ref()
            .is_some_and(|plan| plan.generation == self.generation)
    }

    fn invalidate(&mut self) {
        self.generation += 1;
    }
}

impl Drop for PipelineGraph {
    fn drop(&mut self) {
        if !self.nodes.is_empty() {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::gpu::TextureHandle;
    use crate::pipeline::message::{ImageFormat, MessageKind};
    use crate::pipeline::output::SinkOutput;
    use crate::types::Vector2;
    use async_trait::async_trait;
    use std::cell::RefCell;

    type Log = Rc<RefCell<Vec<String>>>;

    /// Test node with configurable ports that records when it runs.
    struct Recorder {
        name: &'static str,
        ports: &'static [PortSpec],
        log: Log,
        texture: TextureHandle,
        skip_write: bool,
    }

    #[async_trait(?Send)]
    impl Node for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn ports(&self) -> &'static [PortSpec] {
            self.ports
        }

        async fn run(&mut self, ctx: &mut NodeContext<'_>) -> PipelineResult<()> {
            self.log.borrow_mut().push(self.name.to_string());
            for spec in self.ports.iter().filter(|p| p.is_input()) {
                ctx.read(spec.name)?;
            }
            if !self.skip_write {
                for spec in self.ports.iter().filter(|p| p.is_output()) {
                    ctx.write(spec.name, Message::image(self.texture, ImageFormat::Rgba))?;
                }
            }
            Ok(())
        }

        fn release(&mut self) {
            self.log.borrow_mut().push(format!("release {}", self.name));
        }

        async fn export(&mut self) -> PipelineResult<SinkOutput> {
            Ok(SinkOutput::Vectors(vec![Vector2::new(1.0, 2.0)]))
        }
    }

    const SOURCE: &[PortSpec] = &[PortSpec::output("out").expects(MessageKind::Image)];
    const FILTER: &[PortSpec] = &[
        PortSpec::input("in").expects(MessageKind::Image),
        PortSpec::output("out").expects(MessageKind::Image),
    ];
    const MERGE: &[PortSpec] = &[
        PortSpec::input("a").expects(MessageKind::Image),
        PortSpec::input("b").expects(MessageKind::Image),
    ];
    const SINK: &[PortSpec] = &[PortSpec::input("in").expects(MessageKind::Image)];
    const KEYPOINT_SINK: &[PortSpec] = &[PortSpec::input("in").expects(MessageKind::Keypoints)];

    struct Fixture {
        gpu: Gpu,
        log: Log,
        texture: TextureHandle,
    }

    impl Fixture {
        fn new() -> Self {
            let gpu = Gpu::software(&EngineConfig::default()).unwrap();
            let texture = gpu.create_texture(1, 1).unwrap();
            Self {
                gpu,
                log: Rc::default(),
                texture,
            }
        }

        fn node(&self, name: &'static str, ports: &'static [PortSpec]) -> Box<dyn Node> {
            Box::new(Recorder {
                name,
                ports,
                log: self.log.clone(),
                texture: self.texture,
                skip_write: false,
            })
        }

        fn ran(&self) -> Vec<String> {
            self.log
                .borrow()
                .iter()
                .filter(|entry| !entry.starts_with("release"))
                .cloned()
                .collect()
        }
    }

    #[test]
    fn test_diamond_runs_in_dependency_order() {
        let fx = Fixture::new();
        let mut graph = PipelineGraph::new(&fx.gpu);
        graph
            .init([fx.node("C", MERGE), fx.node("B", FILTER), fx.node("A", SOURCE)])
            .unwrap();
        graph.link("A", "B").unwrap();
        graph.connect("A", "out", "C", "a").unwrap();
        graph.connect("B", "out", "C", "b").unwrap();

        assert_eq!(graph.state(), GraphState::Unbuilt);
        let output = graph.run_blocking().unwrap();

        assert_eq!(fx.ran(), vec!["A", "B", "C"]);
        assert_eq!(graph.state(), GraphState::Built);
        assert_eq!(output.vectors("C").unwrap(), &[Vector2::new(1.0, 2.0)]);
        assert!(graph.ports.is_empty());
    }

    #[test]
    fn test_cycle_fails_before_any_node_runs() {
        let fx = Fixture::new();
        let mut graph = PipelineGraph::new(&fx.gpu);
        graph
            .init([
                fx.node("src", SOURCE),
                fx.node("f1", FILTER),
                fx.node("f2", FILTER),
                fx.node("sink", SINK),
            ])
            .unwrap();
        graph.link("f1", "f2").unwrap();
        graph.link("f2", "f1").unwrap();
        graph.link("f2", "sink").unwrap();

        let err = graph.run_blocking().unwrap_err();
        assert!(err.to_string().contains("Cycle"));
        assert!(fx.ran().is_empty());
    }

    #[test]
    fn test_structural_errors_are_reported_before_busy() {
        let fx = Fixture::new();
        let mut graph = PipelineGraph::new(&fx.gpu);
        graph.init([fx.node("src", SOURCE), fx.node("sink", SINK)]).unwrap();
        graph.busy.set(true);

        assert!(matches!(
            graph.run_blocking().unwrap_err(),
            crate::error::VisionError::Pipeline(PipelineError::UnconnectedPort { .. })
        ));

        graph.link("src", "sink").unwrap();
        assert!(matches!(
            graph.run_blocking().unwrap_err(),
            crate::error::VisionError::Pipeline(PipelineError::Busy)
        ));
        assert!(fx.ran().is_empty());

        graph.busy.set(false);
        assert!(graph.run_blocking().is_ok());
    }

    #[test]
    fn test_construction_errors() {
        let fx = Fixture::new();
        let mut graph = PipelineGraph::new(&fx.gpu);
        graph
            .init([fx.node("src", SOURCE), fx.node("sink", SINK), fx.node("kp", KEYPOINT_SINK)])
            .unwrap();

        assert_eq!(
            graph.init([fx.node("late", SOURCE)]),
            Err(PipelineError::AlreadyInitialized)
        );
        assert_eq!(
            graph.add_node(fx.node("src", SOURCE)),
            Err(PipelineError::DuplicateNode("src".to_string()))
        );
        assert!(matches!(
            graph.link("nope", "sink"),
            Err(PipelineError::UnknownNode(_))
        ));
        assert!(matches!(
            graph.connect("src", "missing", "sink", "in"),
            Err(PipelineError::UnknownPort { .. })
        ));
        assert!(matches!(
            graph.connect("sink", "in", "src", "out"),
            Err(PipelineError::InvalidEdge(_))
        ));
        assert!(matches!(
            graph.link("src", "kp"),
            Err(PipelineError::PortMismatch(_))
        ));

        graph.link("src", "sink").unwrap();
        assert!(matches!(
            graph.link("src", "sink"),
            Err(PipelineError::InvalidEdge(_))
        ));
    }

    #[test]
    fn test_missing_output_is_reported() {
        let fx = Fixture::new();
        let mut graph = PipelineGraph::new(&fx.gpu);
        graph
            .add_node(Box::new(Recorder {
                name: "lazy",
                ports: SOURCE,
                log: fx.log.clone(),
                texture: fx.texture,
                skip_write: true,
            }))
            .unwrap();
        graph.add_node(fx.node("sink", SINK)).unwrap();
        graph.link("lazy", "sink").unwrap();

        let err = graph.run_blocking().unwrap_err();
        assert!(err.to_string().contains("Did you forget to write data?"));
        assert_eq!(fx.ran(), vec!["lazy"]);
        assert!(graph.ports.is_empty());
        assert_ne!(graph.state(), GraphState::Running);
    }

    #[test]
    fn test_remove_node_invalidates_sequence() {
        let fx = Fixture::new();
        let mut graph = PipelineGraph::new(&fx.gpu);
        graph
            .init([fx.node("src", SOURCE), fx.node("f", FILTER), fx.node("sink", SINK)])
            .unwrap();
        graph.link("src", "f").unwrap();
        graph.link("f", "sink").unwrap();
        assert_eq!(graph.sequence().unwrap(), vec!["src", "f", "sink"]);

        graph.remove_node("f").unwrap();
        assert_eq!(graph.state(), GraphState::Unbuilt);
        assert!(fx.log.borrow().contains(&"release f".to_string()));
        assert!(matches!(
            graph.sequence(),
            Err(PipelineError::UnconnectedPort { .. })
        ));

        graph.link("src", "sink").unwrap();
        assert_eq!(graph.sequence().unwrap(), vec!["src", "sink"]);
    }

    #[test]
    fn test_release_runs_in_reverse_and_clears() {
        let fx = Fixture::new();
        let mut graph = PipelineGraph::new(&fx.gpu);
        graph.init([fx.node("src", SOURCE), fx.node("sink", SINK)]).unwrap();
        graph.link("src", "sink").unwrap();

        graph.release();
        assert_eq!(
            *fx.log.borrow(),
            vec!["release sink".to_string(), "release src".to_string()]
        );
        assert!(graph.node_id("src").is_none());
        assert_eq!(graph.build().unwrap_err(), PipelineError::EmptyGraph);

        // can be initialized again
        graph.init([fx.node("src", SOURCE)]).unwrap();
    }
}
