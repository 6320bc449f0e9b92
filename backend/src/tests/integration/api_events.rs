use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::{json, Value};
use uuid::Uuid;

use bizflow_shared::{ActionRunStatus, EdgeType, ExecutionStatus, WorkflowExecution};

use crate::tests::fixtures::*;
use crate::tests::helpers::*;
use crate::tests::TestContext;
use crate::workflows::actions::{ActionContext, ActionError, ActionHandler};
use crate::workflows::store::ExecutionStore;

struct AlwaysFails;

#[async_trait]
impl ActionHandler for AlwaysFails {
    fn description(&self) -> &'static str {
        "Fails every time"
    }

    fn default_config(&self) -> Value {
        json!({})
    }

    fn validate_config(&self, _config: &Value) -> Result<(), ActionError> {
        Ok(())
    }

    async fn execute(&self, _ctx: &ActionContext<'_>, _config: &Value) -> Result<Value, ActionError> {
        Err(ActionError::Failed("supplier API refused the order".to_string()))
    }
}

/// Polls until the rule has a finished execution.
async fn wait_for_execution(ctx: &TestContext, rule_id: Uuid) -> WorkflowExecution {
    for _ in 0..200 {
        let (executions, _) = ctx.store.list_for_rule(rule_id, 0, 10).await.unwrap();
        if let Some(done) = executions.into_iter().find(|e| e.status.is_terminal()) {
            return done;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("execution for rule {rule_id} did not finish");
}

fn status_of(execution: &WorkflowExecution, name: &str) -> ActionRunStatus {
    execution
        .action_log
        .iter()
        .find(|e| e.action_name == name)
        .map(|e| e.status)
        .unwrap_or_else(|| panic!("no log entry for {name}"))
}

#[tokio::test]
async fn test_event_runs_rule_end_to_end() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let store = ctx.store.as_ref();
    let operator = create_test_user(&["operator"], vec![]);
    let inventory = &ctx.seeded.inventory;

    let conditions = json!({
        "logic": "and",
        "conditions": [{ "field": "quantity", "operator": "lt", "value": 5 }]
    });
    let rule = insert_rule(store, rule_fixture(inventory, trigger_id(true), Some(conditions)))
        .await
        .unwrap();
    let flag = insert_action(
        store,
        typed_action(
            rule.id,
            "flag",
            "update_field",
            json!({ "target_entity": "inventory_items", "target_field": "status", "value": "reorder" }),
        ),
    )
    .await
    .unwrap();
    let alert = insert_action(
        store,
        typed_action(
            rule.id,
            "alert",
            "create_alert",
            json!({
                "alert_type": "low_stock",
                "severity": "high",
                "title": "Low stock: {{sku}}",
                "message": "Only {{quantity}} left",
                "recipients": [{ "type": "user", "id": operator.user_id }]
            }),
        ),
    )
    .await
    .unwrap();
    insert_edge(store, rule.id, None, flag.id, EdgeType::Start).await.unwrap();
    insert_edge(store, rule.id, Some(flag.id), alert.id, EdgeType::Sequence).await.unwrap();

    let record_id = Uuid::new_v4();
    ctx.writer
        .insert_record(inventory, record_id, json!({ "sku": "BOLT-10", "quantity": 2 }))
        .await;

    ctx.state.queue.start();
    let (status, body) = post(
        &app,
        "/workflow/events",
        &operator,
        json!({
            "entity": "inventory_items",
            "trigger": "on_update",
            "record_id": record_id,
            "payload": { "sku": "BOLT-10", "quantity": 2 },
            "field_changes": { "quantity": { "old": 7, "new": 2 } }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["task_ids"].as_array().unwrap().len(), 1);

    let execution = wait_for_execution(&ctx, rule.id).await;
    ctx.state.queue.stop().await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.action_log.len(), 2);
    assert_eq!(execution.action_log[0].action_name, "flag");

    let record = ctx.writer.record(inventory, record_id).await.unwrap();
    assert_eq!(record["status"], "reorder");

    let (_, alerts) = get(&app, "/workflow/alerts/mine", &operator).await;
    assert_eq!(alerts["meta"]["total"], 1);
    assert_eq!(alerts["data"][0]["title"], "Low stock: BOLT-10");
    assert_eq!(alerts["data"][0]["source_rule_id"], json!(rule.id));

    let (status, fetched) = get(&app, &format!("/workflow/executions/{}", execution.id), &operator).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["status"], "completed");
}

#[tokio::test]
async fn test_failed_branch_is_isolated() {
    let ctx = TestContext::with_actions(|registry| {
        registry.register("always_fails", Arc::new(AlwaysFails));
    })
    .await;
    let app = ctx.app();
    let store = ctx.store.as_ref();
    let operator = create_test_user(&["operator"], vec![]);

    let rule = insert_rule(store, rule_fixture(&ctx.seeded.purchase_orders, trigger_id(false), None))
        .await
        .unwrap();
    let start = insert_action(store, log_action(rule.id, "start")).await.unwrap();
    let order = insert_action(store, typed_action(rule.id, "order", "always_fails", json!({})))
        .await
        .unwrap();
    let after = insert_action(store, log_action(rule.id, "after order")).await.unwrap();
    let notify = insert_action(store, log_action(rule.id, "notify")).await.unwrap();
    insert_edge(store, rule.id, None, start.id, EdgeType::Start).await.unwrap();
    insert_edge(store, rule.id, Some(start.id), order.id, EdgeType::Branch).await.unwrap();
    insert_edge(store, rule.id, Some(start.id), notify.id, EdgeType::Branch).await.unwrap();
    insert_edge(store, rule.id, Some(order.id), after.id, EdgeType::Sequence).await.unwrap();

    ctx.state.queue.start();
    let (status, _) = post(
        &app,
        "/workflow/events",
        &operator,
        json!({
            "entity_id": ctx.seeded.purchase_orders.id,
            "trigger": "on_create",
            "record_id": Uuid::new_v4(),
            "payload": { "total": 120 }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let execution = wait_for_execution(&ctx, rule.id).await;
    ctx.state.queue.stop().await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(status_of(&execution, "start"), ActionRunStatus::Completed);
    assert_eq!(status_of(&execution, "order"), ActionRunStatus::Failed);
    assert_eq!(status_of(&execution, "notify"), ActionRunStatus::Completed);
    assert_eq!(status_of(&execution, "after order"), ActionRunStatus::Skipped);
    assert!(execution.error_message.unwrap().contains("order"));
}

#[tokio::test]
async fn test_event_for_unknown_entity_is_rejected() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let operator = create_test_user(&["operator"], vec![]);

    let (status, body) = post(
        &app,
        "/workflow/events",
        &operator,
        json!({ "entity": "spaceships", "trigger": "on_create" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["details"]["entity_id"].is_array());
}
