//! Shape checks for a rule's action graph.
//!
//! Edges are checked one at a time when they are written ([`check_new_edge`])
//! and as a whole when a rule is validated ([`analyze`]). The engine walks
//! the same [`ActionGraph`] the checks run against.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use uuid::Uuid;

use bizflow_shared::{ActionEdge, EdgeType, NewActionEdge, RuleAction};

use super::store::{StoreError, StoreResult};

/// Adjacency view of one rule's edges.
#[derive(Debug, Clone, Default)]
pub struct ActionGraph {
    starts: Vec<Uuid>,
    outgoing: HashMap<Uuid, Vec<ActionEdge>>,
}

impl ActionGraph {
    pub fn build(edges: &[ActionEdge]) -> Self {
        let mut graph = Self::default();
        let mut ordered: Vec<&ActionEdge> = edges.iter().collect();
        ordered.sort_by_key(|e| (e.edge_order, e.created_at));

        for edge in ordered {
            match edge.source_action_id {
                None => graph.starts.push(edge.target_action_id),
                Some(source) => graph.outgoing.entry(source).or_default().push(edge.clone()),
            }
        }
        graph
    }

    /// Target of the start edge, when exactly one exists.
    pub fn start(&self) -> Option<Uuid> {
        match self.starts.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    pub fn start_count(&self) -> usize {
        self.starts.len()
    }

    /// Outgoing edges of `id`, in `edge_order`.
    pub fn successors(&self, id: Uuid) -> &[ActionEdge] {
        self.outgoing.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn reachable_from(&self, from: Uuid) -> HashSet<Uuid> {
        let mut seen = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);
        while let Some(node) = queue.pop_front() {
            for edge in self.successors(node) {
                if seen.insert(edge.target_action_id) {
                    queue.push_back(edge.target_action_id);
                }
            }
        }
        seen
    }

    /// Actions reachable from the start edge; empty when there is no single start.
    pub fn reachable(&self) -> HashSet<Uuid> {
        self.start().map(|s| self.reachable_from(s)).unwrap_or_default()
    }

    /// Number of incoming non-start edges per node, counting only sources in `within`.
    pub fn in_degrees(&self, within: &HashSet<Uuid>) -> HashMap<Uuid, usize> {
        let mut degrees: HashMap<Uuid, usize> = within.iter().map(|id| (*id, 0)).collect();
        for (source, edges) in &self.outgoing {
            if !within.contains(source) {
                continue;
            }
            for edge in edges {
                if let Some(d) = degrees.get_mut(&edge.target_action_id) {
                    *d += 1;
                }
            }
        }
        degrees
    }

    /// Returns the nodes of some cycle, if the graph has one.
    pub fn find_cycle(&self) -> Option<Vec<Uuid>> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        let mut roots: Vec<Uuid> = self.outgoing.keys().copied().collect();
        roots.sort();
        for root in roots {
            if !visited.contains(&root)
                && self.detect_cycle_from(root, &mut visited, &mut rec_stack, &mut path)
            {
                return Some(path);
            }
        }
        None
    }

    fn detect_cycle_from(
        &self,
        node: Uuid,
        visited: &mut HashSet<Uuid>,
        rec_stack: &mut HashSet<Uuid>,
        path: &mut Vec<Uuid>,
    ) -> bool {
        visited.insert(node);
        rec_stack.insert(node);
        path.push(node);

        for edge in self.successors(node) {
            let next = edge.target_action_id;
            if !visited.contains(&next) {
                if self.detect_cycle_from(next, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(&next) {
                if let Some(cycle_start) = path.iter().position(|id| *id == next) {
                    path.drain(0..cycle_start);
                    return true;
                }
            }
        }

        rec_stack.remove(&node);
        path.pop();
        false
    }
}

/// Checks a single edge against the rule's current edges.
///
/// `source` and `target` are the looked-up actions (`None` when the id did
/// not resolve). Must run under the same lock as the insert it guards.
pub fn check_new_edge(
    new: &NewActionEdge,
    source: Option<&RuleAction>,
    target: Option<&RuleAction>,
    existing: &[ActionEdge],
) -> StoreResult<()> {
    match (new.edge_type, new.source_action_id) {
        (EdgeType::Start, Some(_)) => {
            return Err(StoreError::InvalidShape(
                "a start edge must not have a source action".to_string(),
            ));
        }
        (EdgeType::Start, None) => {
            if existing.iter().any(|e| e.edge_type == EdgeType::Start) {
                return Err(StoreError::InvalidShape(
                    "rule already has a start edge".to_string(),
                ));
            }
        }
        (_, None) => {
            return Err(StoreError::InvalidShape(format!(
                "a {} edge requires a source action",
                new.edge_type
            )));
        }
        (_, Some(_)) => {}
    }

    let target = target
        .ok_or_else(|| StoreError::NotFound(format!("Action {}", new.target_action_id)))?;
    if target.automation_rule_id != new.rule_id {
        return Err(StoreError::WrongRule(format!(
            "target action {} belongs to a different rule",
            target.id
        )));
    }

    let Some(source_id) = new.source_action_id else {
        return Ok(());
    };
    let source = source.ok_or_else(|| StoreError::NotFound(format!("Action {}", source_id)))?;
    if source.automation_rule_id != new.rule_id {
        return Err(StoreError::WrongRule(format!(
            "source action {} belongs to a different rule",
            source.id
        )));
    }

    if source_id == target.id {
        return Err(StoreError::InvalidShape(
            "an action cannot be its own successor".to_string(),
        ));
    }
    if existing
        .iter()
        .any(|e| e.source_action_id == Some(source_id) && e.target_action_id == target.id)
    {
        return Err(StoreError::InvalidShape("edge already exists".to_string()));
    }
    if ActionGraph::build(existing).reachable_from(target.id).contains(&source_id) {
        return Err(StoreError::InvalidShape("edge would create a cycle".to_string()));
    }

    Ok(())
}

/// Findings from a whole-graph check. Errors make a rule unrunnable;
/// warnings are surfaced to authors but do not block execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl GraphReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn analyze(actions: &[RuleAction], edges: &[ActionEdge]) -> GraphReport {
    let mut report = GraphReport::default();
    let graph = ActionGraph::build(edges);
    let known: HashMap<Uuid, &RuleAction> = actions.iter().map(|a| (a.id, a)).collect();
    let name = |id: &Uuid| {
        known
            .get(id)
            .map(|a| a.name.clone())
            .unwrap_or_else(|| id.to_string())
    };

    match graph.start_count() {
        0 if !actions.is_empty() => report.errors.push("rule has no start edge".to_string()),
        0 | 1 => {}
        n => report.errors.push(format!("rule has {} start edges", n)),
    }

    for edge in edges {
        for id in edge.source_action_id.iter().chain([&edge.target_action_id]) {
            if !known.contains_key(id) {
                report
                    .errors
                    .push(format!("edge {} references unknown action {}", edge.id, id));
            }
        }
    }

    for action in actions {
        let sequence_count = graph
            .successors(action.id)
            .iter()
            .filter(|e| e.edge_type == EdgeType::Sequence)
            .count();
        if sequence_count > 1 {
            report.errors.push(format!(
                "action '{}' has {} sequence successors; use branch edges to fan out",
                action.name, sequence_count
            ));
        }
    }

    if let Some(cycle) = graph.find_cycle() {
        let names: Vec<String> = cycle.iter().map(name).collect();
        report
            .errors
            .push(format!("cycle detected: {}", names.join(" -> ")));
    }

    if graph.start().is_some() {
        let reachable = graph.reachable();
        for action in actions {
            if !reachable.contains(&action.id) {
                report.warnings.push(format!(
                    "action '{}' is not reachable from the start edge",
                    action.name
                ));
            }
        }
    }

    report
}
