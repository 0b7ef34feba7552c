//! The three identity caches used by the app.
//!
//! | cache          | value            | on failure | success TTL | failure TTL |
//! |----------------|------------------|------------|-------------|-------------|
//! | auth user      | `Option<User>`   | `None`     | 10s         | 3s          |
//! | invited user   | `bool`           | `false`    | 30s         | 5s          |
//! | current parent | `Option<String>` | `None`     | 30s         | 5s          |

use std::sync::Arc;
use std::time::Duration;

use crate::models::User;

use super::single_flight::{SingleFlightCache, TtlPolicy};
use super::IdentityBackend;

pub const AUTH_USER_CACHE: &str = "auth_user";
pub const INVITED_USER_CACHE: &str = "invited_user";
pub const PARENT_ID_CACHE: &str = "parent_id";

/// The auth user changes on sign-in and sign-out, so it refreshes fastest.
pub const AUTH_USER_TTL: TtlPolicy = TtlPolicy::new(Duration::from_secs(10), Duration::from_secs(3));

pub const INVITED_USER_TTL: TtlPolicy = TtlPolicy::new(Duration::from_secs(30), Duration::from_secs(5));

pub const PARENT_ID_TTL: TtlPolicy = TtlPolicy::new(Duration::from_secs(30), Duration::from_secs(5));

pub fn auth_user_cache<B: IdentityBackend>(backend: Arc<B>) -> SingleFlightCache<Option<User>> {
    SingleFlightCache::new(AUTH_USER_CACHE, AUTH_USER_TTL, None, move || {
        let backend = Arc::clone(&backend);
        async move { backend.current_user().await }
    })
}

pub fn invited_user_cache<B: IdentityBackend>(backend: Arc<B>) -> SingleFlightCache<bool> {
    SingleFlightCache::new(INVITED_USER_CACHE, INVITED_USER_TTL, false, move || {
        let backend = Arc::clone(&backend);
        async move { backend.is_invited_user().await }
    })
}

pub fn parent_id_cache<B: IdentityBackend>(backend: Arc<B>) -> SingleFlightCache<Option<String>> {
    SingleFlightCache::new(PARENT_ID_CACHE, PARENT_ID_TTL, None, move || {
        let backend = Arc::clone(&backend);
        async move { backend.current_parent_id().await }
    })
}
