use super::compiled_plan::{CompiledPlan, PlanStats};
use super::error::{PipelineError, PipelineResult};
use super::graph::{Edge, NodeSlot};
use super::id::NodeId;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Validates a pipeline graph and computes its execution sequence
pub(crate) struct PipelineCompiler;

impl PipelineCompiler {
    /// Compile a pipeline graph into an execution plan.
    ///
    /// Checks run in this order, the first failure aborts:
    /// 1. the graph has at least one live node;
    /// 2. every port declares a message kind;
    /// 3. the graph is acyclic;
    /// 4. every input port is connected;
    /// 5. there is at least one source and one sink.
    ///
    /// # Arguments
    /// * `nodes` - All node slots, including tombstones of removed nodes
    /// * `edges` - All edges between live nodes
    /// * `generation` - Graph generation for cache invalidation
    pub(crate) fn compile(nodes: &[NodeSlot], edges: &[Edge], generation: u64) -> PipelineResult<CompiledPlan> {
        let start_time = std::time::Instant::now();

        let live: Vec<usize> = (0..nodes.len()).filter(|&i| nodes[i].is_live()).collect();
        if live.is_empty() {
            return Err(PipelineError::EmptyGraph);
        }

        Self::check_port_kinds(nodes, &live)?;
        let sequence = Self::topological_sort(nodes, edges, &live)?;
        Self::check_connected(nodes, edges, &live)?;

        let sources = live.iter().filter(|&&i| nodes[i].is_source()).count();
        let sinks = live.iter().filter(|&&i| nodes[i].is_sink()).count();
        if sources == 0 {
            return Err(PipelineError::NoSource);
        }
        if sinks == 0 {
            return Err(PipelineError::NoSink);
        }

        let stats = PlanStats {
            total_nodes: live.len(),
            edges: edges.len(),
            source_nodes: sources,
            sink_nodes: sinks,
            compile_time_us: start_time.elapsed().as_micros() as u64,
        };

        Ok(CompiledPlan {
            sequence: sequence.into_iter().map(|i| NodeId(i as u32)).collect(),
            generation,
            stats,
        })
    }

    fn check_port_kinds(nodes: &[NodeSlot], live: &[usize]) -> PipelineResult<()> {
        for &i in live {
            for spec in nodes[i].ports() {
                if spec.kind.is_none() {
                    return Err(PipelineError::InvalidPort {
                        node: nodes[i].name.clone(),
                        port: spec.name.to_string(),
                        message: "no message kind declared, use expects()".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Kahn's algorithm with a min-heap, so independent nodes keep their
    /// declaration order.
    fn topological_sort(nodes: &[NodeSlot], edges: &[Edge], live: &[usize]) -> PipelineResult<Vec<usize>> {
        let n = nodes.len();
        let mut adj = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];

        for edge in edges {
            let from = edge.from.node.index();
            let to = edge.to.node.index();
            if from >= n || to >= n || !nodes[from].is_live() || !nodes[to].is_live() {
                continue;
            }
            adj[from].push(to);
            in_degree[to] += 1;
        }

        let mut heap: BinaryHeap<Reverse<usize>> = live
            .iter()
            .filter(|&&i| in_degree[i] == 0)
            .map(|&i| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(live.len());

        while let Some(Reverse(node)) = heap.pop() {
            order.push(node);
            for &next in &adj[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    heap.push(Reverse(next));
                }
            }
        }

        if order.len() != live.len() {
            let involved: Vec<String> = on_cycle(&adj, &in_degree, live)
                .into_iter()
                .map(|i| nodes[i].name.clone())
                .collect();
            tracing::warn!(
                "Pipeline graph has a cycle: only {} of {} nodes can be scheduled",
                order.len(),
                live.len()
            );
            return Err(PipelineError::CycleDetected(involved));
        }

        Ok(order)
    }

    fn check_connected(nodes: &[NodeSlot], edges: &[Edge], live: &[usize]) -> PipelineResult<()> {
        for &i in live {
            for spec in nodes[i].ports().iter().filter(|p| p.is_input()) {
                let connected = edges
                    .iter()
                    .any(|e| e.to.node.index() == i && e.to.port == spec.name);
                if !connected {
                    return Err(PipelineError::UnconnectedPort {
                        node: nodes[i].name.clone(),
                        port: spec.name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Nodes left over by Kahn's algorithm that lie on a cycle themselves.
///
/// The leftovers also include nodes that are merely fed by a cycle; those are
/// dropped by checking whether each node can reach itself.
fn on_cycle(adj: &[Vec<usize>], in_degree: &[usize], live: &[usize]) -> Vec<usize> {
    let remaining = |i: usize| in_degree[i] > 0;
    live.iter()
        .copied()
        .filter(|&start| remaining(start))
        .filter(|&start| {
            let mut seen = vec![false; adj.len()];
            let mut stack: Vec<usize> = adj[start].iter().copied().filter(|&n| remaining(n)).collect();
            while let Some(node) = stack.pop() {
                if node == start {
                    return true;
                }
                if std::mem::replace(&mut seen[node], true) {
                    continue;
                }
                stack.extend(adj[node].iter().copied().filter(|&n| remaining(n)));
            }
            false
        })
        .collect()
}
