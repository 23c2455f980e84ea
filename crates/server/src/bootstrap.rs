use std::sync::Arc;

use axum::{middleware, Router};
use insureflow_core::audit::{AuditSink, TracingAuditSink};
use insureflow_core::config::{AppConfig, ConfigError, LoadOptions};
use insureflow_core::flows::{FlowEngine, FlowEngineDeps, FlowRegistry, RegistryError};
use insureflow_core::integrations::{GatewaySettings, IntegrationGateway};
use insureflow_core::store::{EscalationQueue, SessionLocks, SessionStore};
use insureflow_core::{ApplicationError, EscalationService, FlowMenuAnswerSource};
use insureflow_db::{connect_with_config, migrations, DbPool, SqlEscalationQueue, SqlSessionStore};
use insureflow_integrations::{build_clients, BuildError};
use thiserror::Error;
use tracing::info;

use crate::api::{self, ApiState};
use crate::auth::{self, ApiKeys};
use crate::health;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: Arc<FlowEngine>,
    pub escalation: Arc<EscalationService>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("flow registry failed to load: {0}")]
    Registry(#[from] RegistryError),
    #[error("integration clients could not be built: {0}")]
    Integrations(#[from] BuildError),
    #[error("flow engine could not be built: {0}")]
    Engine(#[source] ApplicationError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let registry = Arc::new(FlowRegistry::load(&config.flows)?);
    info!(
        event_name = "system.bootstrap.flows_loaded",
        correlation_id = "bootstrap",
        flow_count = registry.len(),
        "flow registry loaded"
    );

    let clients = build_clients(&config.integrations)?;
    let gateway = IntegrationGateway::new(clients, GatewaySettings::from(&config.integrations));

    let store: Arc<dyn SessionStore> = Arc::new(SqlSessionStore::new(db_pool.clone()));
    let queue = config.escalation.queue_enabled.then(|| {
        Arc::new(SqlEscalationQueue::new(db_pool.clone())) as Arc<dyn EscalationQueue>
    });
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let escalation = Arc::new(EscalationService::new(
        store.clone(),
        queue,
        Arc::new(SessionLocks::default()),
        audit.clone(),
    ));

    let engine = FlowEngine::new(
        FlowEngineDeps {
            store,
            registry: registry.clone(),
            gateway,
            escalation: escalation.clone(),
            answers: Arc::new(FlowMenuAnswerSource::new(registry)),
            audit,
        },
        &config.flows,
    )
    .map_err(BootstrapError::Engine)?;

    Ok(Application { config, db_pool, engine: Arc::new(engine), escalation })
}

impl Application {
    /// The full HTTP surface: API routes behind the key check, `/health` open.
    pub fn router(&self) -> Router {
        let keys = ApiKeys::new(self.config.api.api_keys.clone());
        api::router(ApiState::new(self.engine.clone(), self.escalation.clone()))
            .layer(middleware::from_fn_with_state(keys, auth::require_api_key))
            .merge(health::router(self.db_pool.clone()))
    }
}
