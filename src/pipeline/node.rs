//! Node abstraction for the pipeline.
//!
//! A node declares static ports, acquires GPU resources in [`Node::init`],
//! does its work in [`Node::run`] and frees everything in [`Node::release`].
//! Sinks additionally implement [`Node::export`] to hand their result to the
//! caller of `PipelineGraph::run`.

use crate::gpu::Gpu;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::message::Message;
use crate::pipeline::output::SinkOutput;
use crate::pipeline::port::{PortSpec, DEFAULT_INPUT, DEFAULT_OUTPUT};
use async_trait::async_trait;

/// A pipeline node.
///
/// `run` may suspend (e.g. on an asynchronous texture read); the graph
/// awaits it before running dependent nodes.
#[async_trait(?Send)]
pub trait Node {
    /// Name, unique within a graph.
    fn name(&self) -> &str;

    fn ports(&self) -> &'static [PortSpec];

    /// Acquire GPU resources.
    fn init(&mut self, _gpu: &Gpu) -> PipelineResult<()> {
        Ok(())
    }

    /// Read inputs, invoke kernels, write outputs.
    async fn run(&mut self, ctx: &mut NodeContext<'_>) -> PipelineResult<()>;

    /// Free GPU resources.
    fn release(&mut self) {}

    /// Result of the last run. Only sinks export.
    async fn export(&mut self) -> PipelineResult<SinkOutput> {
        Err(PipelineError::NotExportable(self.name().to_string()))
    }

    fn is_source(&self) -> bool {
        !self.ports().iter().any(PortSpec::is_input)
    }

    fn is_sink(&self) -> bool {
        !self.ports().iter().any(PortSpec::is_output)
    }
}

/// Per-run view of a node's ports.
pub struct NodeContext<'a> {
    gpu: &'a Gpu,
    node: &'a str,
    ports: &'static [PortSpec],
    inputs: Vec<(&'static str, Message)>,
    outputs: Vec<(&'static str, Message)>,
}

impl<'a> NodeContext<'a> {
    pub(crate) fn new(
        gpu: &'a Gpu,
        node: &'a str,
        ports: &'static [PortSpec],
        inputs: Vec<(&'static str, Message)>,
    ) -> Self {
        Self {
            gpu,
            node,
            ports,
            inputs,
            outputs: Vec::new(),
        }
    }

    pub fn gpu(&self) -> &Gpu {
        self.gpu
    }

    pub fn node_name(&self) -> &str {
        self.node
    }

    /// Message pulled into input port `port` for this run.
    pub fn read(&self, port: &str) -> PipelineResult<Message> {
        let spec = self.port(port)?;
        if !spec.is_input() {
            return Err(self.invalid_port(port, "not an input port"));
        }
        self.inputs
            .iter()
            .find(|(name, _)| *name == port)
            .map(|(_, message)| *message)
            .ok_or_else(|| PipelineError::NoInput {
                node: self.node.to_string(),
                port: port.to_string(),
            })
    }

    /// Message on the default input port.
    pub fn input(&self) -> PipelineResult<Message> {
        self.read(DEFAULT_INPUT)
    }

    /// Write `message` to output port `port`, replacing any earlier write.
    pub fn write(&mut self, port: &str, message: Message) -> PipelineResult<()> {
        let spec = *self.port(port)?;
        if !spec.is_output() {
            return Err(self.invalid_port(port, "not an output port"));
        }
        spec.accepts(&message).map_err(|message| PipelineError::InvalidMessage {
            node: self.node.to_string(),
            port: port.to_string(),
            message,
        })?;

        self.outputs.retain(|(name, _)| *name != spec.name);
        self.outputs.push((spec.name, message));
        Ok(())
    }

    /// Write to the default output port.
    pub fn write_output(&mut self, message: Message) -> PipelineResult<()> {
        self.write(DEFAULT_OUTPUT, message)
    }

    pub(crate) fn into_outputs(self) -> Vec<(&'static str, Message)> {
        self.outputs
    }

    fn port(&self, port: &str) -> PipelineResult<&PortSpec> {
        self.ports
            .iter()
            .find(|spec| spec.name == port)
            .ok_or_else(|| PipelineError::UnknownPort {
                node: self.node.to_string(),
                port: port.to_string(),
            })
    }

    fn invalid_port(&self, port: &str, message: &str) -> PipelineError {
        PipelineError::InvalidPort {
            node: self.node.to_string(),
            port: port.to_string(),
            message: message.to_string(),
        }
    }
}
