use crate::pipeline::id::NodeId;

/// Validated execution sequence of a pipeline graph.
#[derive(Debug, Clone, Default)]
pub struct CompiledPlan {
    /// Live nodes in topological order, ties broken by declaration order
    pub sequence: Vec<NodeId>,

    /// Graph generation the plan was computed for
    pub generation: u64,

    /// Compilation statistics
    pub stats: PlanStats,
}

/// Statistics about the compiled plan
#[derive(Debug, Clone, Default)]
pub struct PlanStats {
    /// Number of live nodes
    pub total_nodes: usize,

    /// Number of edges between live nodes
    pub edges: usize,

    /// Number of source nodes (no inputs)
    pub source_nodes: usize,

    /// Number of sink nodes (no outputs)
    pub sink_nodes: usize,

    /// Compilation time in microseconds
    pub compile_time_us: u64,
}

impl CompiledPlan {
    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }
}
