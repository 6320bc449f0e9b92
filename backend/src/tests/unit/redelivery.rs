use std::collections::HashMap;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use bizflow_shared::{ActionLogEntry, ActionRunStatus, EdgeType, ExecutionStatus, RuleAction, WorkflowExecution};

use crate::tests::fixtures::*;
use crate::tests::TestContext;
use crate::workflows::store::ExecutionStore;
use crate::workflows::triggers::ChangeEvent;
use crate::workflows::{ActionContext, ExecutionTask};

struct Interrupted {
    task: ExecutionTask,
    execution: WorkflowExecution,
    allocate: RuleAction,
    item: Uuid,
}

/// Allocates 3 of 10 units, then logs. The task is started by hand and the
/// allocation runs once, as a worker would have before dying.
async fn allocate_then_interrupt(ctx: &TestContext, log_allocation: bool) -> Interrupted {
    let store = ctx.store.as_ref();
    let inventory = &ctx.seeded.inventory;

    let rule = insert_rule(store, rule_fixture(inventory, trigger_id(true), None))
        .await
        .unwrap();
    let allocate = insert_action(
        store,
        typed_action(rule.id, "reserve", "allocate_inventory", json!({ "quantity": 3 })),
    )
    .await
    .unwrap();
    let notify = insert_action(store, log_action(rule.id, "notify")).await.unwrap();
    insert_edge(store, rule.id, None, allocate.id, EdgeType::Start).await.unwrap();
    insert_edge(store, rule.id, Some(allocate.id), notify.id, EdgeType::Sequence)
        .await
        .unwrap();

    let item = Uuid::new_v4();
    ctx.writer.insert_record(inventory, item, json!({ "quantity": 10 })).await;

    let task = ExecutionTask::new(rule.id, ChangeEvent::updated(inventory, item, json!({}), &[]));
    let execution = store
        .begin(WorkflowExecution {
            id: Uuid::new_v4(),
            task_id: task.task_id,
            automation_rule_id: rule.id,
            event_id: task.event.event_id,
            trigger_event: serde_json::to_value(&task.event).unwrap(),
            status: ExecutionStatus::Pending,
            action_log: Vec::new(),
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    store.mark_running(execution.id, Utc::now()).await.unwrap();

    let upstream = HashMap::new();
    let action_ctx = ActionContext {
        event: &task.event,
        rule_id: Some(rule.id),
        action_id: Some(allocate.id),
        execution_id: Some(execution.id),
        upstream: &upstream,
        user_id: None,
    };
    let started_at = Utc::now();
    let output = ctx
        .state
        .registry
        .resolve("allocate_inventory")
        .unwrap()
        .execute(&action_ctx, &allocate.action_config)
        .await
        .unwrap();
    assert_eq!(output["remaining"], json!(7.0));

    if log_allocation {
        store
            .append_log(
                execution.id,
                ActionLogEntry {
                    action_id: allocate.id,
                    action_name: allocate.name.clone(),
                    action_type: allocate.action_type.clone(),
                    status: ActionRunStatus::Completed,
                    started_at,
                    finished_at: Utc::now(),
                    output: Some(output),
                    error: None,
                },
            )
            .await
            .unwrap();
    }

    Interrupted { task, execution, allocate, item }
}

fn entries_for(execution: &WorkflowExecution, action_id: Uuid) -> Vec<&ActionLogEntry> {
    execution.action_log.iter().filter(|e| e.action_id == action_id).collect()
}

#[tokio::test]
async fn test_redelivery_after_logged_allocation_takes_stock_once() {
    let ctx = TestContext::new().await;
    let run = allocate_then_interrupt(&ctx, true).await;

    let mut redelivered = run.task.clone();
    redelivered.attempt = 1;
    let finished = ctx.state.engine.execute(&redelivered).await.unwrap();

    assert_eq!(finished.id, run.execution.id);
    assert_eq!(finished.status, ExecutionStatus::Completed);
    assert_eq!(entries_for(&finished, run.allocate.id).len(), 1);
    assert_eq!(finished.action_log.len(), 2);
    assert_eq!(finished.action_log[1].action_name, "notify");

    let record = ctx.writer.record(&ctx.seeded.inventory, run.item).await.unwrap();
    assert_eq!(record["quantity"], json!(7.0));
}

#[tokio::test]
async fn test_redelivery_before_allocation_was_logged_takes_stock_once() {
    let ctx = TestContext::new().await;
    let run = allocate_then_interrupt(&ctx, false).await;

    let finished = ctx.state.engine.execute(&run.task).await.unwrap();

    assert_eq!(finished.status, ExecutionStatus::Completed);
    let allocations = entries_for(&finished, run.allocate.id);
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0].output.as_ref().unwrap()["remaining"], json!(7.0));

    let record = ctx.writer.record(&ctx.seeded.inventory, run.item).await.unwrap();
    assert_eq!(record["quantity"], json!(7.0));
}

#[tokio::test]
async fn test_finished_execution_is_returned_unchanged() {
    let ctx = TestContext::new().await;
    let run = allocate_then_interrupt(&ctx, true).await;

    let first = ctx.state.engine.execute(&run.task).await.unwrap();
    let second = ctx.state.engine.execute(&run.task).await.unwrap();
    assert_eq!(first.completed_at, second.completed_at);
    assert_eq!(second.action_log.len(), 2);

    let record = ctx.writer.record(&ctx.seeded.inventory, run.item).await.unwrap();
    assert_eq!(record["quantity"], json!(7.0));
}
