use axum::http::StatusCode;
use serde_json::json;
use uuid::Uuid;

use bizflow_shared::{AlertSeverity, NewAlert, RecipientRef, RecipientType};

use crate::tests::helpers::*;
use crate::tests::TestContext;

fn alert_to(recipient_type: RecipientType, id: Uuid, severity: AlertSeverity) -> NewAlert {
    NewAlert {
        alert_type: "low_stock".to_string(),
        severity,
        title: "Reorder point reached".to_string(),
        message: "Stock is below the reorder point".to_string(),
        context: Some(json!({ "quantity": 2 })),
        source_entity_name: Some("inventory_items".to_string()),
        source_entity_id: None,
        source_rule_id: None,
        source_key: None,
        expires_at: None,
        recipients: vec![RecipientRef { recipient_type, id }],
    }
}

async fn seed(ctx: &TestContext, recipient_type: RecipientType, id: Uuid, severity: AlertSeverity) -> Uuid {
    ctx.state
        .alerts
        .create(alert_to(recipient_type, id, severity))
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_mine_includes_role_alerts_and_filters() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let role = Uuid::new_v4();
    let operator = create_test_user(&["operator"], vec![]);
    ctx.roles.assign(operator.user_id, role).await;

    seed(&ctx, RecipientType::User, operator.user_id, AlertSeverity::Low).await;
    seed(&ctx, RecipientType::Role, role, AlertSeverity::Critical).await;
    seed(&ctx, RecipientType::User, Uuid::new_v4(), AlertSeverity::Critical).await;

    let (status, body) = get(&app, "/workflow/alerts/mine", &operator).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 2);
    // highest severity first
    assert_eq!(body["data"][0]["severity"], "critical");

    let (_, body) = get(&app, "/workflow/alerts/mine?severity=low,medium", &operator).await;
    assert_eq!(body["meta"]["total"], 1);

    let (status, body) = get(&app, "/workflow/alerts/mine?status=snoozed", &operator).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["details"]["status"].is_array());
}

#[tokio::test]
async fn test_bulk_acknowledge_counts_and_skips() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let operator = create_test_user(&["operator"], vec![]);

    let (k, m) = (3, 2);
    let mut ids = Vec::new();
    for _ in 0..k {
        ids.push(seed(&ctx, RecipientType::User, operator.user_id, AlertSeverity::High).await);
    }
    for _ in 0..m {
        ids.push(seed(&ctx, RecipientType::User, Uuid::new_v4(), AlertSeverity::High).await);
    }
    // repeated ids are counted once
    ids.push(ids[0]);

    let (status, body) = post(
        &app,
        "/workflow/alerts/acknowledge-selected",
        &operator,
        json!({ "ids": ids, "notes": "on it" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "count": k, "skipped": m }));

    let (_, body) = get(&app, "/workflow/alerts/mine?status=acknowledged", &operator).await;
    assert_eq!(body["meta"]["total"], k);
    assert_eq!(body["data"][0]["notes"], "on it");
}

#[tokio::test]
async fn test_acknowledging_twice_counts_once_each_time() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let operator = create_test_user(&["operator"], vec![]);
    let id = seed(&ctx, RecipientType::User, operator.user_id, AlertSeverity::Medium).await;
    let uri = format!("/workflow/alerts/{id}/acknowledge");

    let (status, first) = post(&app, &uri, &operator, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let (_, second) = post(&app, &uri, &operator, json!({})).await;

    assert_eq!(first, json!({ "count": 1, "skipped": 0 }));
    assert_eq!(second, json!({ "count": 1, "skipped": 0 }));

    let (_, alert) = get(&app, &format!("/workflow/alerts/{id}"), &operator).await;
    assert_eq!(alert["status"], "acknowledged");
    assert_eq!(alert["acknowledged_by"], json!(operator.user_id));
}

#[tokio::test]
async fn test_dismiss_all_then_acknowledge_is_skipped() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let operator = create_test_user(&["operator"], vec![]);
    let id = seed(&ctx, RecipientType::User, operator.user_id, AlertSeverity::Low).await;
    seed(&ctx, RecipientType::User, operator.user_id, AlertSeverity::Low).await;

    let (status, body) = post(&app, "/workflow/alerts/dismiss-all", &operator, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);

    let (_, body) = post(&app, &format!("/workflow/alerts/{id}/acknowledge"), &operator, json!({})).await;
    assert_eq!(body, json!({ "count": 0, "skipped": 1 }));

    let (_, body) = get(&app, "/workflow/alerts/mine", &operator).await;
    assert_eq!(body["meta"]["total"], 0);
}

#[tokio::test]
async fn test_other_users_alert_is_not_found() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let operator = create_test_user(&["operator"], vec![]);
    let id = seed(&ctx, RecipientType::User, Uuid::new_v4(), AlertSeverity::Low).await;

    let (status, _) = get(&app, &format!("/workflow/alerts/{id}"), &operator).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
