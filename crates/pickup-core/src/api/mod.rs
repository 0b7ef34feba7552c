//! HTTP client for the pickup backend-as-a-service.
//!
//! This module provides the `ApiClient` for the backend's auth endpoints
//! (password sign-in, token refresh, current user) and for named remote
//! procedure calls such as `is_invited_user`.
//!
//! Every request carries the project's anon key; authenticated requests add
//! the session's bearer token.

pub mod client;
pub mod error;

pub use client::{ApiClient, BackendSettings};
pub use error::ApiError;
