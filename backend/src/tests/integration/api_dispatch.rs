use axum::http::StatusCode;
use serde_json::json;
use uuid::Uuid;

use crate::error::ACTION_DENIED;
use crate::tests::helpers::*;
use crate::tests::TestContext;
use crate::workflows::store::ActionPermissionStore;

#[tokio::test]
async fn test_unknown_and_unpermitted_types_look_the_same() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let caller = create_test_user(&["viewer"], vec![Uuid::new_v4()]);

    let (unknown_status, unknown) =
        post(&app, "/workflow/actions/unknown_type/execute", &caller, json!({})).await;
    let (denied_status, denied) = post(
        &app,
        "/workflow/actions/allocate_inventory/execute",
        &caller,
        json!({ "config": { "quantity": 1 } }),
    )
    .await;

    assert_eq!(unknown_status, StatusCode::FORBIDDEN);
    assert_eq!(denied_status, StatusCode::FORBIDDEN);
    assert_eq!(unknown["code"], "PERMISSION_DENIED");
    assert_eq!(unknown["code"], denied["code"]);
    assert_eq!(unknown["message"], denied["message"]);
    assert_eq!(unknown["message"], ACTION_DENIED);
    assert!(unknown.get("details").is_none());
}

#[tokio::test]
async fn test_granted_but_unregistered_type_is_still_denied() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let role = Uuid::new_v4();
    ctx.store.grant(role, "teleport").await.unwrap();
    let caller = create_test_user(&["viewer"], vec![role]);

    let (status, body) = post(&app, "/workflow/actions/teleport/execute", &caller, json!({})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], ACTION_DENIED);
}

#[tokio::test]
async fn test_action_list_follows_grants() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let role = Uuid::new_v4();
    let caller = create_test_user(&["viewer"], vec![role]);

    let (status, body) = get(&app, "/workflow/actions", &caller).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    ctx.store.grant(role, "log_message").await.unwrap();
    let (_, body) = get(&app, "/workflow/actions", &caller).await;
    let types: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["action_type"].as_str())
        .collect();
    assert_eq!(types, vec!["log_message"]);
}

#[tokio::test]
async fn test_permitted_execution_reports_outcome() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let role = Uuid::new_v4();
    ctx.store.grant(role, "log_message").await.unwrap();
    ctx.store.grant(role, "allocate_inventory").await.unwrap();
    let caller = create_test_user(&["viewer"], vec![role]);

    let (status, body) = post(
        &app,
        "/workflow/actions/log_message/execute",
        &caller,
        json!({ "config": { "message": "hello {{name}}" }, "payload": { "name": "ops" } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["output"]["logged"], "hello ops");

    // handler failures are reported in the body, not as an HTTP error
    let (status, body) = post(
        &app,
        "/workflow/actions/allocate_inventory/execute",
        &caller,
        json!({ "config": { "quantity": 1, "item_id": Uuid::new_v4() } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_running() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let role = Uuid::new_v4();
    ctx.store.grant(role, "allocate_inventory").await.unwrap();
    let caller = create_test_user(&["viewer"], vec![role]);

    let (status, body) = post(
        &app,
        "/workflow/actions/allocate_inventory/execute",
        &caller,
        json!({ "config": { "quantity": -4 } }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_ARGUMENT");
}
