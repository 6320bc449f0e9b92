use std::collections::HashSet;

use serde_json::json;
use uuid::Uuid;

use bizflow_shared::EdgeType;

use crate::tests::fixtures::*;
use crate::tests::TestContext;

#[tokio::test]
async fn test_cascade_lists_active_downstream_rules_only() {
    let ctx = TestContext::new().await;
    let store = ctx.store.as_ref();
    let seeded = &ctx.seeded;

    // A: purchase order updates write inventory_items
    let a = writer_rule(store, &seeded.purchase_orders, &seeded.inventory, true)
        .await
        .unwrap();
    // R, S listen to inventory updates; T does too but is inactive
    let r = insert_rule(store, rule_fixture(&seeded.inventory, trigger_id(true), None))
        .await
        .unwrap();
    let s = writer_rule(store, &seeded.inventory, &seeded.products, true)
        .await
        .unwrap();
    let mut t = rule_fixture(&seeded.inventory, trigger_id(true), None);
    t.is_active = false;
    insert_rule(store, t).await.unwrap();
    // creation of inventory rows is a different trigger
    insert_rule(store, rule_fixture(&seeded.inventory, trigger_id(false), None))
        .await
        .unwrap();

    let impacts = ctx.state.cascade.analyze(&a).await.unwrap();
    let ids: HashSet<Uuid> = impacts.iter().map(|i| i.rule.id).collect();
    assert_eq!(ids, HashSet::from([r.id, s.id]));
    assert!(impacts.iter().all(|i| i.target_entity == "inventory_items"));
}

#[tokio::test]
async fn test_rule_writing_its_own_entity_is_not_listed() {
    let ctx = TestContext::new().await;
    let store = ctx.store.as_ref();

    let own = writer_rule(store, &ctx.seeded.products, &ctx.seeded.products, true)
        .await
        .unwrap();
    let impacts = ctx.state.cascade.analyze(&own).await.unwrap();
    assert!(impacts.is_empty());
}

#[tokio::test]
async fn test_inactive_actions_do_not_cascade() {
    let ctx = TestContext::new().await;
    let store = ctx.store.as_ref();
    let seeded = &ctx.seeded;

    let rule = insert_rule(store, rule_fixture(&seeded.purchase_orders, trigger_id(true), None))
        .await
        .unwrap();
    let mut allocate = typed_action(rule.id, "allocate", "allocate_inventory", json!({ "quantity": 2 }));
    allocate.is_active = false;
    let allocate = insert_action(store, allocate).await.unwrap();
    insert_edge(store, rule.id, None, allocate.id, EdgeType::Start)
        .await
        .unwrap();
    insert_rule(store, rule_fixture(&seeded.inventory, trigger_id(true), None))
        .await
        .unwrap();

    assert!(ctx.state.cascade.analyze(&rule).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_product_writer_triggers_sibling_product_rule_only() {
    let ctx = TestContext::new().await;
    let store = ctx.store.as_ref();
    let products = &ctx.seeded.products;

    // R listens to product updates and itself writes products
    let r = writer_rule(store, products, products, true).await.unwrap();
    let s = insert_rule(store, rule_fixture(products, trigger_id(true), None))
        .await
        .unwrap();
    let mut t = rule_fixture(products, trigger_id(true), None);
    t.is_active = false;
    let t = insert_rule(store, t).await.unwrap();

    let impacts = ctx.state.cascade.analyze(&r).await.unwrap();
    let ids: Vec<Uuid> = impacts.iter().map(|i| i.rule.id).collect();
    assert_eq!(ids, vec![s.id]);
    assert!(!ids.contains(&r.id));
    assert!(!ids.contains(&t.id));
    assert_eq!(impacts[0].target_entity, "products");
}
