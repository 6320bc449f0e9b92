// Workflow Automation Engine
//
// Change events select active rules, each rule's action graph is run by the
// engine off a durable queue, and actions may raise alerts for users.

pub mod actions;
pub mod builtin_actions;
pub mod cascade;
pub mod catalog;
pub mod conditions;
pub mod dag;
pub mod engine;
pub mod queue;
pub mod redis_broker;
pub mod store;
pub mod triggers;

pub use actions::{ActionContext, ActionError, ActionHandler, ActionRegistry};
pub use cascade::{CascadeAnalyzer, CascadeImpact};
pub use catalog::ReferenceCatalog;
pub use engine::{EngineConfig, EngineError, ExecutionEngine, ExecutionTask};
pub use queue::{Broker, MemoryBroker, QueueError, QueueManager};
pub use redis_broker::RedisBroker;
pub use triggers::TriggerEvaluator;
