//! Identity resolution with single-flight TTL caching.
//!
//! Screens and route guards ask "who is signed in?", "was this user
//! invited?" and "which parent record is theirs?" far more often than the
//! answers change. Each question is answered through its own
//! `SingleFlightCache`, so a burst of callers costs one backend round trip
//! and a flaky backend degrades to a short-lived "no" instead of an error.
//!
//! `IdentityCaches` bundles the three caches over one `IdentityBackend`.
//! Call `invalidate_all` on sign-in, sign-out or any identity change.

pub mod lookups;
pub mod single_flight;

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tracing::info;

use crate::api::ApiClient;
use crate::models::User;

pub use lookups::{AUTH_USER_TTL, INVITED_USER_TTL, PARENT_ID_TTL};
pub use single_flight::{CacheState, CacheStatus, Lookup, SingleFlightCache, TtlPolicy};

/// The backend operations identity resolution depends on.
pub trait IdentityBackend: Send + Sync + 'static {
    /// The signed-in user, or `None` when nobody is signed in.
    fn current_user(&self) -> BoxFuture<'_, anyhow::Result<Option<User>>>;

    fn is_invited_user(&self) -> BoxFuture<'_, anyhow::Result<bool>>;

    fn current_parent_id(&self) -> BoxFuture<'_, anyhow::Result<Option<String>>>;
}

impl IdentityBackend for ApiClient {
    fn current_user(&self) -> BoxFuture<'_, anyhow::Result<Option<User>>> {
        ApiClient::current_user(self).boxed()
    }

    fn is_invited_user(&self) -> BoxFuture<'_, anyhow::Result<bool>> {
        ApiClient::is_invited_user(self).boxed()
    }

    fn current_parent_id(&self) -> BoxFuture<'_, anyhow::Result<Option<String>>> {
        ApiClient::current_parent_id(self).boxed()
    }
}

/// Everything known about the signed-in identity at one moment.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user: Option<User>,
    pub invited: bool,
    pub parent_id: Option<String>,
}

/// The auth user, invited flag and parent id caches over one backend.
#[derive(Debug)]
pub struct IdentityCaches {
    auth_user: SingleFlightCache<Option<User>>,
    invited_user: SingleFlightCache<bool>,
    parent_id: SingleFlightCache<Option<String>>,
}

impl IdentityCaches {
    pub fn new<B: IdentityBackend>(backend: Arc<B>) -> Self {
        Self {
            auth_user: lookups::auth_user_cache(Arc::clone(&backend)),
            invited_user: lookups::invited_user_cache(Arc::clone(&backend)),
            parent_id: lookups::parent_id_cache(backend),
        }
    }

    pub fn auth_user(&self) -> &SingleFlightCache<Option<User>> {
        &self.auth_user
    }

    pub fn invited_user(&self) -> &SingleFlightCache<bool> {
        &self.invited_user
    }

    pub fn parent_id(&self) -> &SingleFlightCache<Option<String>> {
        &self.parent_id
    }

    pub async fn current_user(&self) -> Option<User> {
        self.auth_user.get_or_fetch().await
    }

    pub async fn is_invited_user(&self) -> bool {
        self.invited_user.get_or_fetch().await
    }

    pub async fn current_parent_id(&self) -> Option<String> {
        self.parent_id.get_or_fetch().await
    }

    /// Resolve all three values concurrently.
    pub async fn resolve(&self) -> Identity {
        let (user, invited, parent_id) = futures::join!(
            self.current_user(),
            self.is_invited_user(),
            self.current_parent_id(),
        );
        Identity {
            user,
            invited,
            parent_id,
        }
    }

    /// Forget every cached identity value.
    pub fn invalidate_all(&self) {
        self.auth_user.invalidate();
        self.invited_user.invalidate();
        self.parent_id.invalidate();
        info!("Identity caches invalidated");
    }

    pub fn statuses(&self) -> [CacheStatus; 3] {
        [
            self.auth_user.status(),
            self.invited_user.status(),
            self.parent_id.status(),
        ]
    }
}
