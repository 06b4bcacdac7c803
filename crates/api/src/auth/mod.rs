//! Authentication module for Glowdesk

pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub use middleware::{require_auth, AuthError, AuthMethod, AuthState, AuthUser};
