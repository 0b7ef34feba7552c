//! Core library for pickup, the school pickup app's identity layer.
//!
//! - `api`: HTTP client for the backend's auth and remote procedure endpoints
//! - `auth`: persisted sign-in session
//! - `config`: config file and environment overrides
//! - `identity`: single-flight TTL caches for the signed-in identity
//! - `models`: backend data types

pub mod api;
pub mod auth;
pub mod config;
pub mod identity;
pub mod models;

pub use api::{ApiClient, ApiError, BackendSettings};
pub use auth::{Session, SessionData};
pub use config::Config;
pub use identity::{CacheState, CacheStatus, Identity, IdentityBackend, IdentityCaches, SingleFlightCache, TtlPolicy};
pub use models::User;
