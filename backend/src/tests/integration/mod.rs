pub mod api_alerts;
pub mod api_dispatch;
pub mod api_events;
pub mod api_graph;
pub mod api_rules;
