use axum::{
    http::Method,
    routing::get,
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod alerts;
mod auth;
mod config;
mod database;
mod error;
mod handlers;
mod pagination;
mod services;
mod validation;
mod websocket;
mod workflows;

#[cfg(test)]
mod tests;

use alerts::{AlertService, AlertStore, MemoryAlertStore, MemoryRoleDirectory, RoleDirectory};
use auth::{JwtKeys, RoleTablePermissions, TablePermissions};
use config::Config;
use services::{EmailSender, EntityWriter, LogEmailSender, MemoryEntityWriter, PgEntityWriter, SmtpEmailSender};
use websocket::ConnectionRegistry;
use workflows::actions::ActionRegistry;
use workflows::builtin_actions::{register_builtin, BuiltinDeps};
use workflows::cascade::CascadeAnalyzer;
use workflows::catalog::ReferenceCatalog;
use workflows::engine::{EngineConfig, ExecutionEngine};
use workflows::queue::{Broker, MemoryBroker, QueueManager};
use workflows::redis_broker::RedisBroker;
use workflows::store::{
    ActionPermissionStore, CatalogStore, ExecutionStore, MemoryStore, PgStore, RuleStore,
};
use workflows::triggers::TriggerEvaluator;

pub struct AppState {
    pub config: Config,
    pub jwt: JwtKeys,
    pub table_permissions: Arc<dyn TablePermissions>,
    pub connections: Arc<ConnectionRegistry>,
    pub catalog: Arc<ReferenceCatalog>,
    pub rules: Arc<dyn RuleStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub action_permissions: Arc<dyn ActionPermissionStore>,
    pub registry: Arc<ActionRegistry>,
    pub evaluator: Arc<TriggerEvaluator>,
    pub engine: Arc<ExecutionEngine>,
    pub queue: Arc<QueueManager>,
    pub cascade: Arc<CascadeAnalyzer>,
    pub alerts: Arc<AlertService>,
    pub db_pool: Option<sqlx::PgPool>,
}

/// The storage and delivery collaborators the state is assembled from.
pub struct Backends {
    pub rules: Arc<dyn RuleStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub action_permissions: Arc<dyn ActionPermissionStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub alert_store: Arc<dyn AlertStore>,
    pub roles: Arc<dyn RoleDirectory>,
    pub entity_writer: Arc<dyn EntityWriter>,
    pub email: Arc<dyn EmailSender>,
    pub broker: Arc<dyn Broker>,
    pub db_pool: Option<sqlx::PgPool>,
}

impl Backends {
    /// Everything in process.
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            rules: store.clone(),
            executions: store.clone(),
            action_permissions: store.clone(),
            catalog: store,
            alert_store: Arc::new(MemoryAlertStore::new()),
            roles: Arc::new(MemoryRoleDirectory::new()),
            entity_writer: Arc::new(MemoryEntityWriter::new()),
            email: Arc::new(LogEmailSender),
            broker: Arc::new(MemoryBroker::new()),
            db_pool: None,
        }
    }

    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut backends = match &config.database_url {
            Some(url) => {
                let pool = database::create_pool(url).await?;
                database::migrate(&pool).await?;
                let store = Arc::new(PgStore::new(pool.clone()));
                Self {
                    rules: store.clone(),
                    executions: store.clone(),
                    action_permissions: store.clone(),
                    catalog: store.clone(),
                    alert_store: store.clone(),
                    roles: store,
                    entity_writer: Arc::new(PgEntityWriter::new(pool.clone())),
                    email: Arc::new(LogEmailSender),
                    broker: Arc::new(MemoryBroker::new()),
                    db_pool: Some(pool),
                }
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory storers");
                Self::in_memory()
            }
        };

        if let Some(url) = &config.redis_url {
            backends.broker = Arc::new(RedisBroker::connect(url, &config.queue.name).await?);
        } else {
            tracing::warn!("REDIS_URL not set, using in-memory execution queue");
        }

        if let Some(smtp) = config.smtp.as_ref().filter(|s| s.is_configured()) {
            backends.email = Arc::new(SmtpEmailSender::new(smtp));
        }

        Ok(backends)
    }
}

pub async fn assemble(config: Config, backends: Backends) -> anyhow::Result<Arc<AppState>> {
    assemble_with(config, backends, |_| {}).await
}

/// Wires the state; `extend` may register further action handlers.
pub async fn assemble_with(
    config: Config,
    backends: Backends,
    extend: impl FnOnce(&mut ActionRegistry),
) -> anyhow::Result<Arc<AppState>> {
    let connections = Arc::new(ConnectionRegistry::new());
    let alerts = Arc::new(AlertService::new(
        backends.alert_store,
        backends.roles,
        connections.clone(),
    ));
    let catalog = Arc::new(ReferenceCatalog::load(backends.catalog.as_ref()).await?);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let mut registry = ActionRegistry::new();
    register_builtin(
        &mut registry,
        BuiltinDeps {
            alerts: alerts.clone(),
            catalog: catalog.clone(),
            entity_writer: backends.entity_writer,
            email: backends.email,
            http,
        },
    );
    extend(&mut registry);
    let registry = Arc::new(registry);

    let evaluator = Arc::new(TriggerEvaluator::new(catalog.clone(), backends.rules.clone()));
    let engine = Arc::new(ExecutionEngine::new(
        backends.rules.clone(),
        backends.executions.clone(),
        registry.clone(),
        EngineConfig {
            simulation_timeout: config.simulation_timeout,
            ..Default::default()
        },
    ));
    let queue = Arc::new(QueueManager::new(
        backends.broker,
        engine.clone(),
        evaluator.clone(),
        config.queue.clone(),
    ));
    let cascade = Arc::new(CascadeAnalyzer::new(
        backends.rules.clone(),
        registry.clone(),
        catalog.clone(),
        config.cascade_include_self,
    ));

    let table_permissions: Arc<dyn TablePermissions> = Arc::new(
        RoleTablePermissions::new(config.admin_role.clone()).with_grants(&config.table_grants),
    );

    tracing::info!(
        action_types = registry.types().len(),
        entities = catalog.entities().len(),
        "Workflow engine assembled"
    );

    Ok(Arc::new(AppState {
        jwt: JwtKeys::from_secret(&config.jwt_secret),
        config,
        table_permissions,
        connections,
        catalog,
        rules: backends.rules,
        executions: backends.executions,
        action_permissions: backends.action_permissions,
        registry,
        evaluator,
        engine,
        queue,
        cascade,
        alerts,
        db_pool: backends.db_pool,
    }))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Workflow Automation API v1.0.0" }))
        .merge(handlers::health_routes())
        .nest("/workflow", handlers::workflow_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bizflow_backend=debug"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;
    let server_addr = config.server_addr.clone();
    let backends = Backends::from_config(&config).await?;
    let state = assemble(config, backends).await?;

    state.connections.open();
    state.queue.initialize().await?;
    state.queue.start();

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&server_addr).await?;
    tracing::info!("Server running on {}", server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.connections.close();
    state.queue.stop().await;
    tracing::info!("Shutdown complete");

    Ok(())
}
