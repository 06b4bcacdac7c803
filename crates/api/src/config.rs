//! Configuration for the API server.

use glowdesk_billing::StripeConfig;

/// Number of founder seats seeded into an empty database
pub const DEFAULT_FOUNDER_MAX_SPOTS: i32 = 100;

/// API server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL
    pub database_url: String,
    /// Address the HTTP server binds to
    pub bind_address: String,
    /// Stripe keys, webhook secret and portal return base URL
    pub stripe: StripeConfig,
    /// Supabase project URL for token verification via the auth API
    pub supabase_url: String,
    pub supabase_anon_key: String,
    /// Shared secret for verifying Supabase access tokens locally
    pub supabase_jwt_secret: Option<String>,
    /// Founder seats, only applied when the offer row does not exist yet
    pub founder_max_spots: i32,
    pub allowed_origins: Vec<String>,
    pub run_migrations: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Database
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        // Server
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        // Stripe
        let stripe = StripeConfig::from_env().map_err(|e| ConfigError::Stripe(e.to_string()))?;

        // Supabase auth
        let supabase_url = std::env::var("SUPABASE_URL")
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string();
        let supabase_anon_key = std::env::var("SUPABASE_ANON_KEY").unwrap_or_default();
        let supabase_jwt_secret = non_empty("SUPABASE_JWT_SECRET");

        if supabase_jwt_secret.is_none() && (supabase_url.is_empty() || supabase_anon_key.is_empty())
        {
            return Err(ConfigError::Missing("SUPABASE_JWT_SECRET"));
        }

        // Founder offer
        let founder_max_spots: i32 = match std::env::var("FOUNDER_MAX_SPOTS") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Invalid("FOUNDER_MAX_SPOTS"))?,
            Err(_) => DEFAULT_FOUNDER_MAX_SPOTS,
        };
        if founder_max_spots < 0 {
            return Err(ConfigError::Invalid("FOUNDER_MAX_SPOTS"));
        }

        // CORS
        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let run_migrations = std::env::var("RUN_MIGRATIONS")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("RUN_MIGRATIONS"))?;

        Ok(Self {
            database_url,
            bind_address,
            stripe,
            supabase_url,
            supabase_anon_key,
            supabase_jwt_secret,
            founder_max_spots,
            allowed_origins,
            run_migrations,
        })
    }
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid Stripe configuration: {0}")]
    Stripe(String),
}
