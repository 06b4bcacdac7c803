//! Authentication middleware for Axum
//!
//! Dashboard requests carry a Supabase access token, either as a bearer
//! header or in the `sb-access-token` cookie. Tokens are checked locally with
//! the project's JWT secret when one is configured; otherwise (or when the
//! local check fails) the token is verified against Supabase's
//! `/auth/v1/user` endpoint.

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Cache Supabase verification results for 60 seconds so parallel dashboard
/// requests do not hit Supabase rate limits
const TOKEN_CACHE_TTL: Duration = Duration::from_secs(60);

/// Upper bound on cached tokens; the oldest entry is evicted past this
const MAX_CACHE_ENTRIES: usize = 10_000;

/// Audience Supabase puts on tokens for signed-in users
const SUPABASE_AUDIENCE: &str = "authenticated";

/// Cookie the dashboard stores the access token in
const ACCESS_TOKEN_COOKIE: &str = "sb-access-token";

/// Authenticated user information extracted from the access token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub email: Option<String>,
    pub auth_method: AuthMethod,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthMethod {
    /// Signature checked locally with the project JWT secret
    LocalJwt,
    /// Verified by calling Supabase's auth API
    SupabaseApi,
}

/// Response from Supabase /auth/v1/user endpoint
#[derive(Debug, Clone, Deserialize)]
struct SupabaseUserResponse {
    id: String,
    email: Option<String>,
}

/// Claims of a Supabase access token
#[derive(Debug, Deserialize)]
struct SupabaseClaims {
    sub: String,
    email: Option<String>,
}

#[derive(Clone, Debug)]
struct CachedSupabaseAuth {
    user: SupabaseUserResponse,
    cached_at: Instant,
}

type TokenCache = Arc<RwLock<HashMap<String, CachedSupabaseAuth>>>;

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub jwt_secret: Option<String>,
    pub http_client: Client,
    token_cache: TokenCache,
}

impl AuthState {
    pub fn new(
        supabase_url: impl Into<String>,
        supabase_anon_key: impl Into<String>,
        jwt_secret: Option<String>,
        http_client: Client,
    ) -> Self {
        Self {
            supabase_url: supabase_url.into(),
            supabase_anon_key: supabase_anon_key.into(),
            jwt_secret,
            http_client,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

/// Extract the access token from the `sb-access-token` cookie
fn extract_token_from_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|cookie| {
                cookie
                    .trim()
                    .strip_prefix(ACCESS_TOKEN_COOKIE)
                    .and_then(|rest| rest.strip_prefix('='))
                    .filter(|token| !token.is_empty())
                    .map(str::to_string)
            })
        })
}

/// Extract bearer token from Authorization header or cookie
/// Prefers the Authorization header
pub(crate) fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    extract_token_from_cookie(request)
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Some(token) => authenticate(&auth_state, &token).await,
        None => Err(AuthError::MissingAuth),
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                auth_method = ?auth_user.auth_method,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

pub(crate) async fn authenticate(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    if let Some(secret) = auth_state.jwt_secret.as_deref() {
        match verify_locally(secret, token) {
            Ok(user) => return Ok(user),
            Err(e) => tracing::debug!(error = %e, "Local token check failed, trying Supabase"),
        }
    }

    let user = verify_supabase_token_via_api(auth_state, token).await?;
    Ok(AuthUser {
        user_id: user.id,
        email: user.email,
        auth_method: AuthMethod::SupabaseApi,
    })
}

fn verify_locally(secret: &str, token: &str) -> Result<AuthUser, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[SUPABASE_AUDIENCE]);

    let data = decode::<SupabaseClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;

    Ok(AuthUser {
        user_id: data.claims.sub,
        email: data.claims.email,
        auth_method: AuthMethod::LocalJwt,
    })
}

async fn verify_supabase_token_via_api(
    auth_state: &AuthState,
    token: &str,
) -> Result<SupabaseUserResponse, AuthError> {
    if auth_state.supabase_url.is_empty() || auth_state.supabase_anon_key.is_empty() {
        tracing::warn!("Supabase URL or anon key not configured, cannot verify token via API");
        return Err(AuthError::InvalidToken);
    }

    {
        let cache = auth_state.token_cache.read().await;
        if let Some(cached) = cache.get(token) {
            if cached.cached_at.elapsed() < TOKEN_CACHE_TTL {
                tracing::debug!("Using cached Supabase auth for user {}", cached.user.id);
                return Ok(cached.user.clone());
            }
        }
    }

    let user = verify_supabase_token_api_call(auth_state, token).await?;

    let mut cache = auth_state.token_cache.write().await;
    if cache.len() >= MAX_CACHE_ENTRIES {
        if let Some(oldest_key) = cache
            .iter()
            .min_by_key(|(_, v)| v.cached_at)
            .map(|(k, _)| k.clone())
        {
            cache.remove(&oldest_key);
        }
    }
    cache.insert(
        token.to_string(),
        CachedSupabaseAuth {
            user: user.clone(),
            cached_at: Instant::now(),
        },
    );

    Ok(user)
}

async fn verify_supabase_token_api_call(
    auth_state: &AuthState,
    token: &str,
) -> Result<SupabaseUserResponse, AuthError> {
    let url = format!("{}/auth/v1/user", auth_state.supabase_url);

    let response = auth_state
        .http_client
        .get(&url)
        .header("apikey", &auth_state.supabase_anon_key)
        .header("Authorization", format!("Bearer {}", token))
        .send()
        .await
        .map_err(|e| {
            tracing::error!("Failed to verify Supabase token: {}", e);
            AuthError::InvalidToken
        })?;

    if !response.status().is_success() {
        tracing::warn!(
            "Supabase token verification failed with status: {}",
            response.status()
        );
        return Err(AuthError::InvalidToken);
    }

    response
        .json::<SupabaseUserResponse>()
        .await
        .map_err(|_| AuthError::InvalidToken)
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
