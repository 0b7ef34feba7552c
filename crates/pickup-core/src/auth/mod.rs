//! Session management for the signed-in account.
//!
//! `Session` persists the backend's access and refresh tokens to the cache
//! directory so the CLI stays signed in between runs. A loaded session that
//! has already expired is discarded.

pub mod session;

pub use session::{Session, SessionData};
