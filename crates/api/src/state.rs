//! Application state

use std::sync::Arc;

use glowdesk_billing::BillingService;
use reqwest::Client;
use sqlx::PgPool;

use crate::{auth::AuthState, config::Config};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub billing: Arc<BillingService>,
    pub auth: AuthState,
}

impl AppState {
    pub fn new(pool: PgPool, config: &Config, billing: BillingService) -> Self {
        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        let auth = AuthState::new(
            config.supabase_url.clone(),
            config.supabase_anon_key.clone(),
            config.supabase_jwt_secret.clone(),
            http_client,
        );

        Self {
            pool,
            billing: Arc::new(billing),
            auth,
        }
    }
}
