pub mod cascade_scenarios;
pub mod pg_store;
pub mod redelivery;
pub mod redis_queue;
pub mod rule_graph;
