use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use serial_test::serial;
use uuid::Uuid;

use bizflow_shared::{
    ActionLogEntry, ActionRunStatus, AlertSeverity, AlertStatus, BulkResult, EdgeType,
    ExecutionStatus, NewAlert, RecipientRef, RecipientType, WorkflowExecution,
};

use crate::alerts::AlertService;
use crate::services::{EntityWriter, PgEntityWriter};
use crate::tests::containers::PgContext;
use crate::tests::fixtures::*;
use crate::websocket::ConnectionRegistry;
use crate::workflows::store::{ExecutionStore, PgStore, RuleStore, StoreError};

async fn rule_with_actions(ctx: &PgContext, names: &[&str]) -> (Uuid, Vec<Uuid>) {
    let entity = ctx.entity("procurement", "purchase_orders").await;
    let rule = insert_rule(&ctx.store, rule_fixture(&entity, trigger_id(true), None))
        .await
        .unwrap();
    let mut ids = Vec::new();
    for name in names {
        ids.push(insert_action(&ctx.store, log_action(rule.id, name)).await.unwrap().id);
    }
    (rule.id, ids)
}

fn draft(rule_id: Uuid, task_id: Uuid) -> WorkflowExecution {
    WorkflowExecution {
        id: Uuid::new_v4(),
        task_id,
        automation_rule_id: rule_id,
        event_id: Uuid::new_v4(),
        trigger_event: json!({ "trigger": "on_update" }),
        status: ExecutionStatus::Pending,
        action_log: Vec::new(),
        error_message: None,
        started_at: None,
        completed_at: None,
        created_at: Utc::now(),
    }
}

fn completed(action_id: Uuid, name: &str) -> ActionLogEntry {
    ActionLogEntry {
        action_id,
        action_name: name.to_string(),
        action_type: "log_message".to_string(),
        status: ActionRunStatus::Completed,
        started_at: Utc::now(),
        finished_at: Utc::now(),
        output: Some(json!({ "logged": name })),
        error: None,
    }
}

#[tokio::test]
#[serial]
async fn test_pg_second_start_edge_is_rejected() {
    let ctx = PgContext::new().await;
    let (rule, actions) = rule_with_actions(&ctx, &["a", "b"]).await;

    insert_edge(&ctx.store, rule, None, actions[0], EdgeType::Start).await.unwrap();
    let err = insert_edge(&ctx.store, rule, None, actions[1], EdgeType::Start)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidShape(_)));
    assert_eq!(ctx.store.list_edges(rule).await.unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn test_pg_edge_to_another_rules_action_is_rejected() {
    let ctx = PgContext::new().await;
    let (rule, actions) = rule_with_actions(&ctx, &["a"]).await;
    let (_, foreign) = rule_with_actions(&ctx, &["elsewhere"]).await;

    let err = insert_edge(&ctx.store, rule, Some(actions[0]), foreign[0], EdgeType::Sequence)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::WrongRule(_)));
}

#[tokio::test]
#[serial]
async fn test_pg_cycle_is_rejected() {
    let ctx = PgContext::new().await;
    let (rule, ids) = rule_with_actions(&ctx, &["a", "b", "c"]).await;
    let (a, b, c) = (ids[0], ids[1], ids[2]);

    insert_edge(&ctx.store, rule, None, a, EdgeType::Start).await.unwrap();
    insert_edge(&ctx.store, rule, Some(a), b, EdgeType::Sequence).await.unwrap();
    insert_edge(&ctx.store, rule, Some(b), c, EdgeType::Sequence).await.unwrap();

    let err = insert_edge(&ctx.store, rule, Some(c), a, EdgeType::Sequence)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidShape(ref m) if m.contains("cycle")));
    let err = insert_edge(&ctx.store, rule, Some(b), b, EdgeType::Sequence)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidShape(_)));
}

#[tokio::test]
#[serial]
async fn test_pg_begin_is_keyed_by_task_and_log_survives_restart() {
    let ctx = PgContext::new().await;
    let (rule, ids) = rule_with_actions(&ctx, &["a", "b"]).await;
    let task_id = Uuid::new_v4();

    let first = ctx.store.begin(draft(rule, task_id)).await.unwrap();
    let again = ctx.store.begin(draft(rule, task_id)).await.unwrap();
    assert_eq!(first.id, again.id);

    ctx.store.mark_running(first.id, Utc::now()).await.unwrap();
    ctx.store.append_log(first.id, completed(ids[0], "a")).await.unwrap();
    ctx.store.append_log(first.id, completed(ids[1], "b")).await.unwrap();

    // A second worker picking the task up keeps what the first one logged.
    ctx.store.mark_running(first.id, Utc::now()).await.unwrap();
    let resumed = ctx.store.begin(draft(rule, task_id)).await.unwrap();
    assert_eq!(resumed.status, ExecutionStatus::Running);
    let names: Vec<&str> = resumed.action_log.iter().map(|e| e.action_name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(resumed.action_log[1].output, Some(json!({ "logged": "b" })));

    let done = ctx
        .store
        .finish(first.id, ExecutionStatus::Completed, None, Utc::now())
        .await
        .unwrap();
    assert!(done.completed_at.is_some());
    let (listed, total) = ctx.store.list_for_rule(rule, 0, 10).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(listed[0].status, ExecutionStatus::Completed);
}

fn alert_for(recipients: Vec<RecipientRef>) -> NewAlert {
    NewAlert {
        alert_type: "low_stock".to_string(),
        severity: AlertSeverity::High,
        title: "Reorder".to_string(),
        message: "Stock is low".to_string(),
        context: None,
        source_entity_name: Some("inventory_items".to_string()),
        source_entity_id: None,
        source_rule_id: None,
        source_key: None,
        expires_at: None,
        recipients,
    }
}

fn alert_service(ctx: &PgContext) -> AlertService {
    let store = Arc::new(PgStore::new(ctx.pool.clone()));
    AlertService::new(store.clone(), store, Arc::new(ConnectionRegistry::new()))
}

#[tokio::test]
#[serial]
async fn test_pg_bulk_acknowledge_counts_role_alerts_and_skips_others() {
    let ctx = PgContext::new().await;
    let service = alert_service(&ctx);
    let me = Uuid::new_v4();
    let role = Uuid::new_v4();
    ctx.assign_role(me, role).await;

    let direct = service
        .create(alert_for(vec![RecipientRef { recipient_type: RecipientType::User, id: me }]))
        .await
        .unwrap();
    let via_role = service
        .create(alert_for(vec![RecipientRef { recipient_type: RecipientType::Role, id: role }]))
        .await
        .unwrap();
    let theirs = service
        .create(alert_for(vec![RecipientRef {
            recipient_type: RecipientType::User,
            id: Uuid::new_v4(),
        }]))
        .await
        .unwrap();

    let viewer = service.viewer(me, &[]).await.unwrap();
    let ids = [direct.id, via_role.id, theirs.id, Uuid::new_v4()];
    let result = service.acknowledge_selected(&viewer, &ids, None).await.unwrap();
    assert_eq!(result, BulkResult { count: 2, skipped: 2 });

    let stored = service.get(&viewer, via_role.id).await.unwrap();
    assert_eq!(stored.status, AlertStatus::Acknowledged);
    assert_eq!(stored.acknowledged_by, Some(me));
}

#[tokio::test]
#[serial]
async fn test_pg_acknowledge_is_idempotent_and_dismissed_is_skipped() {
    let ctx = PgContext::new().await;
    let service = alert_service(&ctx);
    let me = Uuid::new_v4();
    let mine = vec![RecipientRef { recipient_type: RecipientType::User, id: me }];
    let first = service.create(alert_for(mine.clone())).await.unwrap();
    let second = service.create(alert_for(mine)).await.unwrap();
    let viewer = service.viewer(me, &[]).await.unwrap();

    for _ in 0..2 {
        let result = service.acknowledge_selected(&viewer, &[first.id], None).await.unwrap();
        assert_eq!(result, BulkResult { count: 1, skipped: 0 });
    }

    let result = service.dismiss_selected(&viewer, &[second.id], Some("handled".to_string())).await.unwrap();
    assert_eq!(result, BulkResult { count: 1, skipped: 0 });
    let result = service.acknowledge_selected(&viewer, &[second.id], None).await.unwrap();
    assert_eq!(result, BulkResult { count: 0, skipped: 1 });
}

#[tokio::test]
#[serial]
async fn test_pg_writer_converts_json_to_column_types_and_applies_keyed_adjust_once() {
    let ctx = PgContext::new().await;
    sqlx::query("CREATE SCHEMA IF NOT EXISTS inventory")
        .execute(&ctx.pool)
        .await
        .unwrap();
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS inventory.inventory_items \
         (id UUID PRIMARY KEY, quantity INTEGER NOT NULL, status TEXT)",
    )
    .execute(&ctx.pool)
    .await
    .unwrap();
    let entity = ctx.entity("inventory", "inventory_items").await;
    let item = Uuid::new_v4();
    sqlx::query("INSERT INTO inventory.inventory_items (id, quantity) VALUES ($1, 10)")
        .bind(item)
        .execute(&ctx.pool)
        .await
        .unwrap();

    let writer = PgEntityWriter::new(ctx.pool.clone());
    writer.set_field(&entity, item, "status", &json!("reserved")).await.unwrap();
    writer.set_field(&entity, item, "quantity", &json!(12)).await.unwrap();

    let key = format!("{}:{}", Uuid::new_v4(), Uuid::new_v4());
    assert_eq!(writer.adjust_field_once(&key, &entity, item, "quantity", -3.0, true).await.unwrap(), 9.0);
    assert_eq!(writer.adjust_field_once(&key, &entity, item, "quantity", -3.0, true).await.unwrap(), 9.0);
    assert!(writer.adjust_field(&entity, item, "quantity", -20.0, true).await.is_err());

    let (quantity, status): (i32, String) =
        sqlx::query_as("SELECT quantity, status FROM inventory.inventory_items WHERE id = $1")
            .bind(item)
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
    assert_eq!(quantity, 9);
    assert_eq!(status, "reserved");
}
