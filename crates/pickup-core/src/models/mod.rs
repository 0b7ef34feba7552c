//! Data models for the pickup backend.
//!
//! - `User`: the authenticated identity returned by the auth service

pub mod user;

pub use user::User;
