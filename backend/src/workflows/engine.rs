// Workflow Engine - walks a rule's action graph and records what each action did

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use bizflow_shared::{
    ActionEdge, ActionLogEntry, ActionRunStatus, AutomationRule, EntityChangeEvent,
    ExecutionStatus, RuleAction, WorkflowExecution,
};

use super::actions::{render_config, ActionContext, ActionError, ActionRegistry};
use super::dag::{self, ActionGraph, GraphReport};
use super::store::{ExecutionStore, RuleStore, StoreError};

/// One queued run of one rule against one event. Redeliveries carry the
/// same `task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub task_id: Uuid,
    pub rule_id: Uuid,
    pub event: EntityChangeEvent,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempt: u32,
}

impl ExecutionTask {
    pub fn new(rule_id: Uuid, event: EntityChangeEvent) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            rule_id,
            event,
            enqueued_at: Utc::now(),
            attempt: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("simulation exceeded {0:?}")]
    Timeout(Duration),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(err.into())
    }
}

impl EngineError {
    /// Whether the task should stay on the queue for another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(StoreError::Database(_)))
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on actions of one execution running at the same time.
    pub max_branch_concurrency: usize,
    pub simulation_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_branch_concurrency: 8,
            simulation_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of a dry run: what would have happened, nothing persisted.
#[derive(Debug, Clone, Serialize)]
pub struct DryRun {
    pub status: ExecutionStatus,
    pub action_log: Vec<ActionLogEntry>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Live { execution_id: Uuid },
    DryRun,
}

struct NodeResult {
    action_id: Uuid,
    entry: ActionLogEntry,
    output: Option<Value>,
}

struct WalkSummary {
    log: Vec<ActionLogEntry>,
    failed: Vec<String>,
    error: Option<String>,
}

impl WalkSummary {
    fn status(&self) -> ExecutionStatus {
        if self.error.is_some() || !self.failed.is_empty() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        }
    }

    fn error_message(&self) -> Option<String> {
        self.error.clone().or_else(|| {
            (!self.failed.is_empty()).then(|| format!("failed actions: {}", self.failed.join(", ")))
        })
    }
}

pub struct ExecutionEngine {
    rules: Arc<dyn RuleStore>,
    executions: Arc<dyn ExecutionStore>,
    registry: Arc<ActionRegistry>,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        executions: Arc<dyn ExecutionStore>,
        registry: Arc<ActionRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            rules,
            executions,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Runs `task` to a terminal state. A task whose execution already
    /// finished is returned as stored. An unfinished one resumes: actions
    /// whose last logged attempt completed are not invoked again and their
    /// stored output feeds their successors.
    pub async fn execute(&self, task: &ExecutionTask) -> Result<WorkflowExecution, EngineError> {
        let draft = WorkflowExecution {
            id: Uuid::new_v4(),
            task_id: task.task_id,
            automation_rule_id: task.rule_id,
            event_id: task.event.event_id,
            trigger_event: serde_json::to_value(&task.event)?,
            status: ExecutionStatus::Pending,
            action_log: Vec::new(),
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        };
        let execution = self.executions.begin(draft).await?;
        if execution.status.is_terminal() {
            tracing::debug!(
                execution_id = %execution.id,
                task_id = %task.task_id,
                "Execution already finished, skipping redelivery"
            );
            return Ok(execution);
        }

        self.executions.mark_running(execution.id, Utc::now()).await?;
        let prior = completed_entries(&execution.action_log);
        if prior.is_empty() {
            tracing::info!(
                execution_id = %execution.id,
                rule_id = %task.rule_id,
                attempt = task.attempt,
                "Execution started"
            );
        } else {
            tracing::info!(
                execution_id = %execution.id,
                rule_id = %task.rule_id,
                attempt = task.attempt,
                completed = prior.len(),
                "Resuming execution"
            );
        }

        let rule = match self.rules.get_rule(task.rule_id).await {
            Ok(rule) => rule,
            Err(StoreError::NotFound(_)) => {
                return self
                    .finish(execution.id, ExecutionStatus::Failed, Some("rule not found".to_string()))
                    .await;
            }
            Err(e) => return Err(e.into()),
        };
        if !rule.is_active {
            return self
                .finish(execution.id, ExecutionStatus::Failed, Some("rule is inactive".to_string()))
                .await;
        }

        let actions = self.rules.list_actions(rule.id).await?;
        let edges = self.rules.list_edges(rule.id).await?;
        let summary = self
            .walk(
                &rule,
                &actions,
                &edges,
                &task.event,
                Mode::Live { execution_id: execution.id },
                &prior,
            )
            .await?;

        let finished = self
            .finish(execution.id, summary.status(), summary.error_message())
            .await?;
        tracing::info!(
            execution_id = %finished.id,
            rule_id = %rule.id,
            status = %finished.status,
            actions = finished.action_log.len(),
            "Execution finished"
        );
        Ok(finished)
    }

    async fn finish(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        error_message: Option<String>,
    ) -> Result<WorkflowExecution, EngineError> {
        if let Some(reason) = &error_message {
            tracing::warn!(%execution_id, %reason, "Execution failed");
        }
        Ok(self
            .executions
            .finish(execution_id, status, error_message, Utc::now())
            .await?)
    }

    /// Walks the rule's graph without invoking handlers or persisting
    /// anything. Each reachable action is logged with the configuration it
    /// would have received.
    pub async fn simulate(&self, rule: &AutomationRule, event: &EntityChangeEvent) -> Result<DryRun, EngineError> {
        let timeout = self.config.simulation_timeout;
        let run = async {
            let actions = self.rules.list_actions(rule.id).await?;
            let edges = self.rules.list_edges(rule.id).await?;
            self.walk(rule, &actions, &edges, event, Mode::DryRun, &HashMap::new())
                .await
        };

        let summary = tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| EngineError::Timeout(timeout))??;
        Ok(DryRun {
            status: summary.status(),
            error_message: summary.error_message(),
            action_log: summary.log,
        })
    }

    /// Static check of a rule: graph shape plus handler registration and
    /// configuration of every action.
    pub async fn validate(&self, rule_id: Uuid) -> Result<GraphReport, EngineError> {
        let timeout = self.config.simulation_timeout;
        tokio::time::timeout(timeout, self.check_rule(rule_id))
            .await
            .map_err(|_| EngineError::Timeout(timeout))?
    }

    async fn check_rule(&self, rule_id: Uuid) -> Result<GraphReport, EngineError> {
        let actions = self.rules.list_actions(rule_id).await?;
        let edges = self.rules.list_edges(rule_id).await?;
        let mut report = dag::analyze(&actions, &edges);

        for action in &actions {
            match self.registry.resolve(&action.action_type) {
                Ok(handler) => {
                    if let Err(e) = handler.validate_config(&action.action_config) {
                        report.errors.push(format!("action '{}': {}", action.name, e));
                    }
                }
                Err(e) => report.errors.push(format!("action '{}': {}", action.name, e)),
            }
            if !action.is_active {
                report
                    .warnings
                    .push(format!("action '{}' is inactive and will be skipped", action.name));
            }
        }
        Ok(report)
    }

    async fn walk(
        &self,
        rule: &AutomationRule,
        actions: &[RuleAction],
        edges: &[ActionEdge],
        event: &EntityChangeEvent,
        mode: Mode,
        prior: &HashMap<Uuid, ActionLogEntry>,
    ) -> Result<WalkSummary, EngineError> {
        let mut summary = WalkSummary {
            log: Vec::new(),
            failed: Vec::new(),
            error: None,
        };
        if actions.is_empty() {
            return Ok(summary);
        }

        let graph = ActionGraph::build(edges);
        let Some(start) = graph.start() else {
            summary.error = Some(match graph.start_count() {
                0 => "rule has no start edge".to_string(),
                n => format!("rule has {} start edges", n),
            });
            return Ok(summary);
        };

        let by_id: HashMap<Uuid, &RuleAction> = actions.iter().map(|a| (a.id, a)).collect();
        let reachable = graph.reachable();
        let mut waiting = graph.in_degrees(&reachable);
        let mut poisoned: HashSet<Uuid> = HashSet::new();
        let mut resolved: HashSet<Uuid> = HashSet::new();
        let mut outputs: HashMap<Uuid, Value> = HashMap::new();
        let mut ready: VecDeque<Uuid> = VecDeque::from([start]);
        let mut running = FuturesUnordered::new();
        let limit = self.config.max_branch_concurrency.max(1);

        loop {
            while running.len() < limit {
                let Some(id) = ready.pop_front() else { break };

                // Already in the stored log, so not appended again.
                if let Some(entry) = prior.get(&id) {
                    if let Some(output) = &entry.output {
                        outputs.insert(id, output.clone());
                    }
                    summary.log.push(entry.clone());
                    resolved.insert(id);
                    release(&graph, id, false, &mut waiting, &mut poisoned, &mut ready);
                    continue;
                }

                let skip_reason = if poisoned.contains(&id) {
                    Some("upstream action failed")
                } else if by_id.get(&id).is_some_and(|a| !a.is_active) {
                    Some("action is inactive")
                } else {
                    None
                };

                if let Some(reason) = skip_reason {
                    let entry = skipped_entry(id, by_id.get(&id).copied(), reason);
                    let failed_upstream = poisoned.contains(&id);
                    self.record(mode, &mut summary, entry).await?;
                    resolved.insert(id);
                    release(&graph, id, failed_upstream, &mut waiting, &mut poisoned, &mut ready);
                    continue;
                }

                let Some(action) = by_id.get(&id).copied() else {
                    let now = Utc::now();
                    let entry = ActionLogEntry {
                        action_id: id,
                        action_name: id.to_string(),
                        action_type: String::new(),
                        status: ActionRunStatus::Failed,
                        started_at: now,
                        finished_at: now,
                        output: None,
                        error: Some("action not found".to_string()),
                    };
                    summary.failed.push(id.to_string());
                    self.record(mode, &mut summary, entry).await?;
                    resolved.insert(id);
                    release(&graph, id, true, &mut waiting, &mut poisoned, &mut ready);
                    continue;
                };

                running.push(self.run_node(rule.id, action, event, outputs.clone(), mode));
            }

            let Some(done) = running.next().await else { break };
            let failed = done.entry.status == ActionRunStatus::Failed;
            if failed {
                summary.failed.push(done.entry.action_name.clone());
            }
            if let Some(output) = done.output {
                outputs.insert(done.action_id, output);
            }
            self.record(mode, &mut summary, done.entry).await?;
            resolved.insert(done.action_id);
            release(&graph, done.action_id, failed, &mut waiting, &mut poisoned, &mut ready);
        }

        let stuck = reachable.len().saturating_sub(resolved.len());
        if stuck > 0 {
            summary.error = Some(format!("{} actions never became ready; the graph has a cycle", stuck));
        }
        Ok(summary)
    }

    async fn record(&self, mode: Mode, summary: &mut WalkSummary, entry: ActionLogEntry) -> Result<(), EngineError> {
        if let Mode::Live { execution_id } = mode {
            self.executions.append_log(execution_id, entry.clone()).await?;
        }
        summary.log.push(entry);
        Ok(())
    }

    async fn run_node(
        &self,
        rule_id: Uuid,
        action: &RuleAction,
        event: &EntityChangeEvent,
        upstream: HashMap<Uuid, Value>,
        mode: Mode,
    ) -> NodeResult {
        let started_at = Utc::now();
        let execution_id = match mode {
            Mode::Live { execution_id } => Some(execution_id),
            Mode::DryRun => None,
        };
        let ctx = ActionContext {
            event,
            rule_id: Some(rule_id),
            action_id: Some(action.id),
            execution_id,
            upstream: &upstream,
            user_id: event.user_id,
        };

        let result: Result<Value, ActionError> = async {
            let handler = self.registry.resolve(&action.action_type)?;
            let config = render_config(&action.action_config, event);
            match mode {
                Mode::DryRun => {
                    handler.validate_config(&config)?;
                    Ok(json!({ "dry_run": true, "config": config }))
                }
                Mode::Live { .. } => handler.execute(&ctx, &config).await,
            }
        }
        .await;

        let (status, output, error) = match result {
            Ok(output) => (ActionRunStatus::Completed, Some(output), None),
            Err(e) => {
                tracing::warn!(
                    rule_id = %rule_id,
                    action_id = %action.id,
                    action_type = %action.action_type,
                    error = %e,
                    "Action failed"
                );
                (ActionRunStatus::Failed, None, Some(e.to_string()))
            }
        };

        NodeResult {
            action_id: action.id,
            entry: ActionLogEntry {
                action_id: action.id,
                action_name: action.name.clone(),
                action_type: action.action_type.clone(),
                status,
                started_at,
                finished_at: Utc::now(),
                output: output.clone(),
                error,
            },
            output,
        }
    }
}

/// Actions whose most recent logged attempt completed.
fn completed_entries(log: &[ActionLogEntry]) -> HashMap<Uuid, ActionLogEntry> {
    let mut last: HashMap<Uuid, &ActionLogEntry> = HashMap::new();
    for entry in log {
        last.insert(entry.action_id, entry);
    }
    last.into_iter()
        .filter(|(_, entry)| entry.status == ActionRunStatus::Completed)
        .map(|(id, entry)| (id, entry.clone()))
        .collect()
}

fn skipped_entry(id: Uuid, action: Option<&RuleAction>, reason: &str) -> ActionLogEntry {
    let now = Utc::now();
    ActionLogEntry {
        action_id: id,
        action_name: action.map(|a| a.name.clone()).unwrap_or_else(|| id.to_string()),
        action_type: action.map(|a| a.action_type.clone()).unwrap_or_default(),
        status: ActionRunStatus::Skipped,
        started_at: now,
        finished_at: now,
        output: None,
        error: Some(reason.to_string()),
    }
}

/// Marks `id` as resolved for its successors. A successor becomes ready once
/// every reachable predecessor has resolved; it inherits failure from any of them.
fn release(
    graph: &ActionGraph,
    id: Uuid,
    failed: bool,
    waiting: &mut HashMap<Uuid, usize>,
    poisoned: &mut HashSet<Uuid>,
    ready: &mut VecDeque<Uuid>,
) {
    for edge in graph.successors(id) {
        let next = edge.target_action_id;
        if failed {
            poisoned.insert(next);
        }
        if let Some(remaining) = waiting.get_mut(&next) {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                ready.push_back(next);
            }
        }
    }
}
