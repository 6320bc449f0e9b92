use bizflow_shared::EdgeType;

use crate::tests::fixtures::*;
use crate::tests::TestContext;
use crate::workflows::store::{RuleStore, StoreError};

#[tokio::test]
async fn test_second_start_edge_is_rejected_until_edges_are_cleared() {
    let ctx = TestContext::new().await;
    let store = ctx.store.as_ref();
    let rule = insert_rule(store, rule_fixture(&ctx.seeded.inventory, trigger_id(true), None))
        .await
        .unwrap();
    let first = insert_action(store, log_action(rule.id, "first")).await.unwrap();
    let second = insert_action(store, log_action(rule.id, "second")).await.unwrap();

    insert_edge(store, rule.id, None, first.id, EdgeType::Start)
        .await
        .unwrap();
    let err = insert_edge(store, rule.id, None, second.id, EdgeType::Start)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidShape(_)));

    assert_eq!(store.delete_all_edges(rule.id).await.unwrap(), 1);
    tokio_test::assert_ok!(insert_edge(store, rule.id, None, second.id, EdgeType::Start).await);
}

#[tokio::test]
async fn test_edge_to_another_rules_action_is_refused() {
    let ctx = TestContext::new().await;
    let store = ctx.store.as_ref();
    let rule = insert_rule(store, rule_fixture(&ctx.seeded.inventory, trigger_id(true), None))
        .await
        .unwrap();
    let other = insert_rule(store, rule_fixture(&ctx.seeded.products, trigger_id(true), None))
        .await
        .unwrap();
    let mine = insert_action(store, log_action(rule.id, "mine")).await.unwrap();
    let theirs = insert_action(store, log_action(other.id, "theirs")).await.unwrap();

    let err = insert_edge(store, rule.id, Some(mine.id), theirs.id, EdgeType::Sequence)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::WrongRule(_)));
    assert!(store.list_edges(rule.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_closing_a_cycle_is_refused() {
    let ctx = TestContext::new().await;
    let store = ctx.store.as_ref();
    let rule = insert_rule(store, rule_fixture(&ctx.seeded.inventory, trigger_id(true), None))
        .await
        .unwrap();
    let a = insert_action(store, log_action(rule.id, "a")).await.unwrap();
    let b = insert_action(store, log_action(rule.id, "b")).await.unwrap();
    let c = insert_action(store, log_action(rule.id, "c")).await.unwrap();

    insert_edge(store, rule.id, None, a.id, EdgeType::Start).await.unwrap();
    insert_edge(store, rule.id, Some(a.id), b.id, EdgeType::Sequence).await.unwrap();
    insert_edge(store, rule.id, Some(b.id), c.id, EdgeType::Sequence).await.unwrap();

    let err = insert_edge(store, rule.id, Some(c.id), a.id, EdgeType::Sequence)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidShape(_)));
    assert_eq!(store.list_edges(rule.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_validate_warns_about_unreachable_actions() {
    let ctx = TestContext::new().await;
    let store = ctx.store.as_ref();
    let rule = insert_rule(store, rule_fixture(&ctx.seeded.inventory, trigger_id(true), None))
        .await
        .unwrap();
    let start = insert_action(store, log_action(rule.id, "start")).await.unwrap();
    insert_action(store, log_action(rule.id, "orphan")).await.unwrap();
    insert_edge(store, rule.id, None, start.id, EdgeType::Start).await.unwrap();

    let report = ctx.state.engine.validate(rule.id).await.unwrap();
    assert!(report.is_valid());
    assert!(report.warnings.iter().any(|w| w.contains("orphan")));
}
