//! Credential and session security core.
//!
//! Password verification, access/refresh credential issuance, refresh
//! rotation with reuse detection, and per-resource authorization. No
//! transport: the surrounding service owns HTTP, storage schema migration
//! timing and audit persistence.

pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod utils;

use std::sync::Arc;

use service_core::error::AppError;

use crate::config::CoreConfig;
use crate::services::{
    AuditSink, CoreError, Database, GrantStore, MemoryStore, PermissionEngine, SessionFacade,
    SubjectStore, TokenIssuer, TokenStore,
};
use crate::utils::CredentialVerifier;

/// The store implementations the core runs against.
#[derive(Clone)]
pub struct Stores {
    pub subjects: Arc<dyn SubjectStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub grants: Arc<dyn GrantStore>,
}

impl Stores {
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            subjects: store.clone(),
            tokens: store.clone(),
            grants: store,
        }
    }

    pub fn database(db: Database) -> Self {
        let db = Arc::new(db);
        Self {
            subjects: db.clone(),
            tokens: db.clone(),
            grants: db,
        }
    }
}

/// Assembled core: sessions and permissions sharing one set of stores.
#[derive(Clone)]
pub struct AuthCore {
    pub sessions: SessionFacade,
    pub permissions: PermissionEngine,
}

impl AuthCore {
    pub fn build(
        config: &CoreConfig,
        stores: Stores,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, CoreError> {
        let verifier = CredentialVerifier::new(&config.password.work_factor())?;
        let issuer = TokenIssuer::new(&config.jwt)?;

        let sessions = SessionFacade::new(
            stores.subjects.clone(),
            stores.tokens,
            verifier,
            issuer,
            config.password.policy.clone(),
            audit.clone(),
        );
        let permissions = PermissionEngine::new(stores.grants, stores.subjects, audit);

        tracing::info!(
            service = %config.service_name,
            environment = ?config.environment,
            "Auth core initialized"
        );

        Ok(Self {
            sessions,
            permissions,
        })
    }

    /// Connect to PostgreSQL, apply migrations and build on top of it.
    pub async fn connect(config: &CoreConfig, audit: Arc<dyn AuditSink>) -> Result<Self, CoreError> {
        let db_config = config
            .database
            .as_ref()
            .ok_or_else(|| CoreError::Config("database section is missing".to_string()))?;
        let pool = db::create_pool(db_config).await?;
        db::run_migrations(&pool).await?;
        Self::build(config, Stores::database(Database::new(pool)), audit)
    }
}

/// Initialize tracing from the core configuration.
pub fn init_tracing(config: &CoreConfig) -> Result<(), AppError> {
    service_core::observability::init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )
}
