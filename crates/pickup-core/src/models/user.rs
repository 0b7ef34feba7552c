use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authenticated identity as returned by `GET /auth/v1/user`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sign_in_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_metadata: serde_json::Value,
}

impl User {
    /// Name to show for this user: metadata full name, then email, then id.
    pub fn display_name(&self) -> &str {
        self.metadata_str("full_name")
            .or_else(|| self.email.as_deref().filter(|e| !e.is_empty()))
            .unwrap_or(self.id.as_str())
    }

    /// Look up a non-empty string field in `user_metadata`.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.user_metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}
