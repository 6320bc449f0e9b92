use axum::http::{Method, StatusCode};
use serde_json::json;

use bizflow_shared::EdgeType;

use crate::tests::fixtures::*;
use crate::tests::helpers::*;
use crate::tests::TestContext;
use crate::workflows::store::RuleStore;

#[tokio::test]
async fn test_create_and_get_rule() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let admin = create_admin_user();

    let (status, body) = post(
        &app,
        "/workflow/rules",
        &admin,
        rule_body(&ctx.seeded.inventory, trigger_id(true)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["created_by"], json!(admin.user_id));
    let id = id_of(&body);

    let (status, body) = get(&app, &format!("/workflow/rules/{id}"), &admin).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entity_id"], json!(ctx.seeded.inventory.id));
}

#[tokio::test]
async fn test_rule_requires_authentication_and_table_permission() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let viewer = create_test_user(&["viewer"], vec![]);

    let (status, body) = send(&app, Method::GET, "/workflow/rules", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHENTICATED");

    let (status, _) = get(&app, "/workflow/rules", &viewer).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post(
        &app,
        "/workflow/rules",
        &viewer,
        rule_body(&ctx.seeded.inventory, trigger_id(true)),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "PERMISSION_DENIED");
}

#[tokio::test]
async fn test_create_rule_reports_field_errors() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let admin = create_admin_user();

    let mut body = rule_body(&ctx.seeded.inventory, uuid::Uuid::new_v4());
    body["name"] = json!("  ");
    body["trigger_conditions"] = json!({ "logic": "xor", "conditions": [] });

    let (status, body) = post(&app, "/workflow/rules", &admin, body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_ARGUMENT");
    let details = body["details"].as_object().unwrap();
    assert!(details.contains_key("name"));
    assert!(details.contains_key("trigger_type_id"));
    assert!(details.contains_key("trigger_conditions"));
}

#[tokio::test]
async fn test_delete_deactivates_rule() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let admin = create_admin_user();
    let rule = insert_rule(ctx.store.as_ref(), rule_fixture(&ctx.seeded.inventory, trigger_id(true), None))
        .await
        .unwrap();

    let (status, _) = send(&app, Method::DELETE, &format!("/workflow/rules/{}", rule.id), Some(&admin), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let stored = ctx.store.get_rule(rule.id).await.unwrap();
    assert!(!stored.is_active);

    let (status, body) = get(&app, "/workflow/rules?is_active=false", &admin).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 1);
}

#[tokio::test]
async fn test_activation_reports_cascade() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let admin = create_admin_user();
    let store = ctx.store.as_ref();

    let rule = writer_rule(store, &ctx.seeded.purchase_orders, &ctx.seeded.inventory, false)
        .await
        .unwrap();
    let downstream = insert_rule(store, rule_fixture(&ctx.seeded.inventory, trigger_id(true), None))
        .await
        .unwrap();

    let (status, body) = send(
        &app,
        Method::PATCH,
        &format!("/workflow/rules/{}/active", rule.id),
        Some(&admin),
        Some(json!({ "is_active": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rule"]["is_active"], true);
    let cascade = body["cascade"].as_array().unwrap();
    assert_eq!(cascade.len(), 1);
    assert_eq!(cascade[0]["rule"]["id"], json!(downstream.id));
    assert_eq!(cascade[0]["via_action_name"], "touch");
}

#[tokio::test]
async fn test_dry_run_reports_match_and_plan() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let admin = create_admin_user();
    let store = ctx.store.as_ref();

    let conditions = json!({
        "logic": "and",
        "conditions": [{ "field": "quantity", "operator": "lt", "value": 10 }]
    });
    let rule = insert_rule(store, rule_fixture(&ctx.seeded.inventory, trigger_id(true), Some(conditions)))
        .await
        .unwrap();
    let action = insert_action(store, log_action(rule.id, "notify")).await.unwrap();
    insert_edge(store, rule.id, None, action.id, EdgeType::Start).await.unwrap();

    let uri = format!("/workflow/rules/{}/test", rule.id);
    let (status, body) = post(&app, &uri, &admin, json!({ "payload": { "quantity": 3 } })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["matched"], true);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["action_log"][0]["output"]["dry_run"], true);

    let (status, body) = post(&app, &uri, &admin, json!({ "payload": { "quantity": 30 } })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["matched"], false);

    // nothing was persisted
    let (_, history) = get(&app, &format!("/workflow/rules/{}/executions", rule.id), &admin).await;
    assert_eq!(history["meta"]["total"], 0);
}

#[tokio::test]
async fn test_validate_endpoint() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let admin = create_admin_user();
    let store = ctx.store.as_ref();

    let rule = insert_rule(store, rule_fixture(&ctx.seeded.inventory, trigger_id(true), None))
        .await
        .unwrap();
    insert_action(store, log_action(rule.id, "dangling")).await.unwrap();

    let (status, body) = post(&app, &format!("/workflow/rules/{}/validate", rule.id), &admin, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], false);
    assert!(body["errors"][0].as_str().unwrap().contains("start edge"));
}

#[tokio::test]
async fn test_unknown_rule_is_not_found() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let admin = create_admin_user();

    let (status, body) = get(&app, &format!("/workflow/rules/{}", uuid::Uuid::new_v4()), &admin).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}
