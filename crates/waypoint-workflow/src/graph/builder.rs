use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use waypoint_core::types::WorkflowStep;

use super::edge::{Edge, EdgeTarget};

/// Build the edge list for an ordered step list.
///
/// With no usable parallel ids the result is a plain chain ending in END.
/// Otherwise the parallel steps form a fork-join block between the step
/// before the first of them and the step after the last of them. Unknown
/// parallel ids are ignored; this function never fails.
pub fn build_edges<S: AsRef<str>>(step_ids: &[S], parallel_step_ids: &[S]) -> Vec<Edge> {
    let ids: Vec<&str> = step_ids.iter().map(|s| s.as_ref()).collect();
    if ids.is_empty() {
        return vec![];
    }

    let known: HashSet<&str> = ids.iter().copied().collect();
    let parallel: HashSet<&str> = parallel_step_ids
        .iter()
        .map(|s| s.as_ref())
        .filter(|id| known.contains(id))
        .collect();

    let unknown = unknown_parallel_ids(&known, parallel_step_ids);
    if !unknown.is_empty() {
        warn!(
            unknown = ?unknown,
            valid = parallel.len(),
            "Ignoring parallel step ids that are not part of the workflow"
        );
    }

    let mut edges = Vec::with_capacity(ids.len() + 2 * parallel.len());

    if parallel.is_empty() {
        for pair in ids.windows(2) {
            edges.push(Edge::step(pair[0], pair[1]));
        }
        if let Some(last) = ids.last() {
            edges.push(Edge::end(*last));
        }
        return edges;
    }

    let is_parallel = |id: &str| parallel.contains(id);
    let positions: Vec<usize> = (0..ids.len()).filter(|&i| is_parallel(ids[i])).collect();
    let (first, last) = match (positions.first(), positions.last()) {
        (Some(&f), Some(&l)) => (f, l),
        _ => return edges,
    };

    let predecessor = first.checked_sub(1).map(|i| ids[i]);
    let successor = ids
        .get(last + 1)
        .map(|id| EdgeTarget::Step(id.to_string()))
        .unwrap_or(EdgeTarget::End);

    // Fan-out
    if let Some(pred) = predecessor {
        for &i in &positions {
            edges.push(Edge::step(pred, ids[i]));
        }
    }

    // Fan-in
    for &i in &positions {
        edges.push(Edge {
            from: ids[i].to_string(),
            to: successor.clone(),
        });
    }

    // Remaining chain outside the parallel block
    for pair in ids.windows(2) {
        if !is_parallel(pair[0]) && !is_parallel(pair[1]) {
            edges.push(Edge::step(pair[0], pair[1]));
        }
    }
    if let Some(&tail) = ids.last() {
        if !is_parallel(tail) {
            edges.push(Edge::end(tail));
        }
    }

    edges
}

/// Distinct parallel ids with no matching step, in request order.
fn unknown_parallel_ids<'a, S: AsRef<str>>(
    known: &HashSet<&str>,
    requested: &'a [S],
) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    requested
        .iter()
        .map(|s| s.as_ref())
        .filter(|id| !known.contains(id) && seen.insert(*id))
        .collect()
}

/// One unit of the driver's walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub step_ids: Vec<String>,
    /// Members of a fork-join block; they run concurrently.
    pub parallel: bool,
}

impl Stage {
    pub fn contains(&self, step_id: &str) -> bool {
        self.step_ids.iter().any(|id| id == step_id)
    }
}

/// Step arena with its precomputed edge list.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    steps: Vec<WorkflowStep>,
    index: HashMap<String, usize>,
    parallel: Vec<String>,
    edges: Vec<Edge>,
    stages: Vec<Stage>,
}

impl WorkflowGraph {
    pub fn new(steps: Vec<WorkflowStep>, parallel_step_ids: &[String]) -> Self {
        let index: HashMap<String, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        let step_ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        let parallel_ids: Vec<&str> = parallel_step_ids.iter().map(String::as_str).collect();
        let edges = build_edges(&step_ids, &parallel_ids);

        // Keep only valid ids, in list order, without duplicates
        let parallel: Vec<String> = steps
            .iter()
            .filter(|s| parallel_step_ids.contains(&s.id))
            .map(|s| s.id.clone())
            .collect();

        let mut graph = Self {
            steps,
            index,
            parallel,
            edges,
            stages: vec![],
        };
        graph.stages = graph.compute_stages();
        debug!(
            steps = graph.steps.len(),
            edges = graph.edges.len(),
            stages = graph.stages.len(),
            "Built workflow graph"
        );
        graph
    }

    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.index.get(step_id).map(|&i| &self.steps[i])
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.index.contains_key(step_id)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Parallel step ids that matched a step, in list order.
    pub fn parallel_step_ids(&self) -> &[String] {
        &self.parallel
    }

    pub fn is_parallel(&self, step_id: &str) -> bool {
        self.parallel.iter().any(|id| id == step_id)
    }

    /// Steps with no incoming step edge, in list order.
    pub fn entry_points(&self) -> Vec<&str> {
        self.steps
            .iter()
            .map(|s| s.id.as_str())
            .filter(|id| self.predecessors(id).is_empty())
            .collect()
    }

    pub fn successors(&self, step_id: &str) -> Vec<&EdgeTarget> {
        self.edges
            .iter()
            .filter(|e| e.from == step_id)
            .map(|e| &e.to)
            .collect()
    }

    pub fn predecessors(&self, step_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to.step_id() == Some(step_id))
            .map(|e| e.from.as_str())
            .collect()
    }

    /// Topological stages in execution order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Index of the stage holding `step_id`.
    pub fn stage_of(&self, step_id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.contains(step_id))
    }

    /// Kahn levels with list-order tie-break. Parallel members sharing a
    /// level form one stage placed at its first member; every other step is
    /// its own stage.
    fn compute_stages(&self) -> Vec<Stage> {
        let n = self.steps.len();
        let mut in_degree = vec![0usize; n];
        let mut outgoing: Vec<Vec<usize>> = vec![vec![]; n];
        for edge in &self.edges {
            let (Some(&from), Some(&to)) = (
                self.index.get(&edge.from),
                edge.to.step_id().and_then(|id| self.index.get(id)),
            ) else {
                continue;
            };
            in_degree[to] += 1;
            outgoing[from].push(to);
        }

        let mut level = vec![0usize; n];
        let mut frontier: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0;
        while !frontier.is_empty() {
            let mut next = vec![];
            for &i in &frontier {
                visited += 1;
                for &j in &outgoing[i] {
                    level[j] = level[j].max(level[i] + 1);
                    in_degree[j] -= 1;
                    if in_degree[j] == 0 {
                        next.push(j);
                    }
                }
            }
            next.sort_unstable();
            frontier = next;
        }
        if visited < n {
            // Edges only ever point forward in list order, so this is unreachable.
            warn!(steps = n, visited, "Cycle detected while layering workflow graph");
        }

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| (level[i], i));

        let mut stages: Vec<Stage> = vec![];
        let mut group_at: HashMap<usize, usize> = HashMap::new();
        for i in order {
            let id = self.steps[i].id.clone();
            if self.is_parallel(&id) {
                if let Some(&pos) = group_at.get(&level[i]) {
                    stages[pos].step_ids.push(id);
                    continue;
                }
                group_at.insert(level[i], stages.len());
                stages.push(Stage {
                    step_ids: vec![id],
                    parallel: true,
                });
            } else {
                stages.push(Stage {
                    step_ids: vec![id],
                    parallel: false,
                });
            }
        }
        stages
    }
}
