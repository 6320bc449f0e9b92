use axum::http::{Method, StatusCode};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::tests::fixtures::*;
use crate::tests::helpers::*;
use crate::tests::TestContext;

async fn rule_with_actions(ctx: &TestContext, names: &[&str]) -> (Uuid, Vec<Uuid>) {
    let rule = insert_rule(ctx.store.as_ref(), rule_fixture(&ctx.seeded.inventory, trigger_id(true), None))
        .await
        .unwrap();
    let mut ids = Vec::new();
    for name in names {
        let action = insert_action(ctx.store.as_ref(), log_action(rule.id, name)).await.unwrap();
        ids.push(action.id);
    }
    (rule.id, ids)
}

fn edge(source: Option<Uuid>, target: Uuid, edge_type: &str) -> Value {
    json!({ "source_action_id": source, "target_action_id": target, "edge_type": edge_type })
}

#[tokio::test]
async fn test_create_action_validates_type_and_config() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let admin = create_admin_user();
    let (rule_id, _) = rule_with_actions(&ctx, &[]).await;
    let uri = format!("/workflow/rules/{rule_id}/actions");

    let (status, body) = post(
        &app,
        &uri,
        &admin,
        json!({ "name": "log", "action_type": "log_message", "action_config": { "message": "hi" } }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["automation_rule_id"], json!(rule_id));
    assert_eq!(body["is_active"], true);

    let (status, body) = post(&app, &uri, &admin, json!({ "name": "x", "action_type": "teleport" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["details"]["action_type"].is_array());

    let (status, body) = post(
        &app,
        &uri,
        &admin,
        json!({ "name": "loud", "action_type": "log_message", "action_config": { "message": "m", "level": "loud" } }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["details"]["action_config"].is_array());
}

#[tokio::test]
async fn test_action_from_template_merges_defaults() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let admin = create_admin_user();
    let (rule_id, _) = rule_with_actions(&ctx, &[]).await;

    let (status, template) = post(
        &app,
        "/workflow/templates",
        &admin,
        json!({
            "name": "Warn the log",
            "action_type": "log_message",
            "default_config": { "message": "stock changed", "level": "warn" }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = post(
        &app,
        &format!("/workflow/rules/{rule_id}/actions"),
        &admin,
        json!({ "name": "from template", "template_id": template["id"], "action_config": { "message": "override" } }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["action_type"], "log_message");
    assert_eq!(body["action_config"]["message"], "override");
    assert_eq!(body["action_config"]["level"], "warn");
    assert_eq!(body["template_id"], template["id"]);
}

#[tokio::test]
async fn test_second_start_edge_is_invalid_argument() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let admin = create_admin_user();
    let (rule_id, ids) = rule_with_actions(&ctx, &["a", "b"]).await;
    let uri = format!("/workflow/rules/{rule_id}/edges");

    let (status, _) = post(&app, &uri, &admin, edge(None, ids[0], "start")).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = post(&app, &uri, &admin, edge(None, ids[1], "start")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_ARGUMENT");
}

#[tokio::test]
async fn test_cross_rule_edge_is_aborted() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let admin = create_admin_user();
    let (rule_id, mine) = rule_with_actions(&ctx, &["mine"]).await;
    let (_, theirs) = rule_with_actions(&ctx, &["theirs"]).await;

    let (status, body) = post(
        &app,
        &format!("/workflow/rules/{rule_id}/edges"),
        &admin,
        edge(Some(mine[0]), theirs[0], "sequence"),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ABORTED");

    // the action is addressed through the wrong rule
    let (status, _) = send(
        &app,
        Method::PUT,
        &format!("/workflow/rules/{rule_id}/actions/{}", theirs[0]),
        Some(&admin),
        Some(json!({ "name": "renamed" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_cycle_is_rejected_and_edges_can_be_cleared() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let admin = create_admin_user();
    let (rule_id, ids) = rule_with_actions(&ctx, &["a", "b"]).await;
    let uri = format!("/workflow/rules/{rule_id}/edges");

    post(&app, &uri, &admin, edge(None, ids[0], "start")).await;
    let (status, _) = post(&app, &uri, &admin, edge(Some(ids[0]), ids[1], "sequence")).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = post(&app, &uri, &admin, edge(Some(ids[1]), ids[0], "sequence")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("cycle"));

    let (status, body) = send(&app, Method::DELETE, &uri, Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 2);

    let (_, edges) = get(&app, &uri, &admin).await;
    assert_eq!(edges, json!([]));
}

#[tokio::test]
async fn test_delete_action_drops_its_edges() {
    let ctx = TestContext::new().await;
    let app = ctx.app();
    let admin = create_admin_user();
    let (rule_id, ids) = rule_with_actions(&ctx, &["a", "b"]).await;
    let uri = format!("/workflow/rules/{rule_id}/edges");
    post(&app, &uri, &admin, edge(None, ids[0], "start")).await;
    post(&app, &uri, &admin, edge(Some(ids[0]), ids[1], "sequence")).await;

    let (status, _) = send(
        &app,
        Method::DELETE,
        &format!("/workflow/rules/{rule_id}/actions/{}", ids[1]),
        Some(&admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, edges) = get(&app, &uri, &admin).await;
    assert_eq!(edges.as_array().unwrap().len(), 1);
}
