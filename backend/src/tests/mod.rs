pub mod helpers;
pub mod integration;
pub mod unit;

// Common test utilities and shared test setup
use std::sync::{Arc, Once};
use std::time::Duration;

use axum::Router;
use bizflow_shared::{Entity, EntityType};

use crate::alerts::{MemoryAlertStore, MemoryRoleDirectory};
use crate::config::{Config, QueueConfig};
use crate::services::{LogEmailSender, MemoryEntityWriter};
use crate::workflows::actions::ActionRegistry;
use crate::workflows::queue::MemoryBroker;
use crate::workflows::store::MemoryStore;
use crate::{assemble_with, build_router, AppState, Backends};

pub const TEST_JWT_SECRET: &str = "test_secret_key_for_testing_only";

static TRACING: Once = Once::new();

/// Routes log output through the test harness; `RUST_LOG` widens it.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Reference data seeded before the catalog is loaded.
pub struct Seeded {
    pub table_type: EntityType,
    pub inventory: Entity,
    pub purchase_orders: Entity,
    pub products: Entity,
}

/// A fully assembled in-memory application.
pub struct TestContext {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub roles: Arc<MemoryRoleDirectory>,
    pub writer: Arc<MemoryEntityWriter>,
    pub seeded: Seeded,
}

pub fn test_config() -> Config {
    Config {
        server_addr: "127.0.0.1:0".to_string(),
        database_url: None,
        redis_url: None,
        jwt_secret: TEST_JWT_SECRET.to_string(),
        admin_role: "admin".to_string(),
        table_grants: "viewer:*:read;operator:workflow.alerts:read,update;operator:workflow.executions:create,read".to_string(),
        queue: QueueConfig {
            name: "test:executions".to_string(),
            workers: 2,
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
        },
        cascade_include_self: false,
        simulation_timeout: Duration::from_secs(5),
        smtp: None,
    }
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_actions(|_| {}).await
    }

    /// Builds the context with extra action handlers registered.
    pub async fn with_actions(extend: impl FnOnce(&mut ActionRegistry)) -> Self {
        init_test_tracing();
        let store = Arc::new(MemoryStore::new());
        let table_type = store.add_entity_type("table").await;
        let seeded = Seeded {
            inventory: store.add_entity("inventory_items", "inventory", table_type.id).await,
            purchase_orders: store.add_entity("purchase_orders", "procurement", table_type.id).await,
            products: store.add_entity("products", "catalog", table_type.id).await,
            table_type,
        };

        let roles = Arc::new(MemoryRoleDirectory::new());
        let writer = Arc::new(MemoryEntityWriter::new());
        let backends = Backends {
            rules: store.clone(),
            executions: store.clone(),
            action_permissions: store.clone(),
            catalog: store.clone(),
            alert_store: Arc::new(MemoryAlertStore::new()),
            roles: roles.clone(),
            entity_writer: writer.clone(),
            email: Arc::new(LogEmailSender),
            broker: Arc::new(MemoryBroker::new()),
            db_pool: None,
        };

        let state = assemble_with(test_config(), backends, extend)
            .await
            .expect("Failed to assemble test state");
        state.connections.open();
        state.queue.initialize().await.expect("Failed to declare test queue");

        Self {
            state,
            store,
            roles,
            writer,
            seeded,
        }
    }

    pub fn app(&self) -> Router {
        build_router(self.state.clone())
    }
}
