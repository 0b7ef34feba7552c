//! Command implementations for the pickup CLI.
//!
//! `App` owns the config, the persisted session, the API client and the
//! identity caches built over that client. Anything that changes who is
//! signed in goes through here so the caches are invalidated with it.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pickup_core::{ApiClient, ApiError, CacheStatus, Config, Identity, IdentityCaches, Session};
use tracing::{error, info, warn};

/// Interval between identity resolutions in `pickup watch`.
const WATCH_INTERVAL: Duration = Duration::from_secs(1);

pub struct App {
    config: Config,
    session: Session,
    api: ApiClient,
    identity: IdentityCaches,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let api = ApiClient::new(config.backend()?)?;
        let mut session = Session::new(config.cache_dir()?);

        match session.load() {
            Ok(true) => {
                if let Some(token) = session.token() {
                    api.set_token(token.to_string());
                }
            }
            Ok(false) => info!("No saved session"),
            Err(e) => warn!(error = %e, "Failed to load session"),
        }

        let identity = IdentityCaches::new(Arc::new(api.clone()));
        Ok(Self {
            config,
            session,
            api,
            identity,
        })
    }

    // =========================================================================
    // Sign in / out
    // =========================================================================

    pub async fn login(&mut self, email: Option<String>) -> Result<()> {
        let email = match email {
            Some(email) => email,
            None => self.prompt_email()?,
        };
        if email.is_empty() {
            anyhow::bail!("Email required");
        }
        let password = rpassword::prompt_password("Password: ")?;

        println!("\nSigning in...");
        let session_data = match self.api.sign_in_with_password(&email, &password).await {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, "Sign-in failed");
                return Err(e.context("Sign-in failed"));
            }
        };

        self.config.last_email = Some(email);
        if let Err(e) = self.config.save() {
            warn!(error = %e, "Failed to save config");
        }

        self.api.set_token(session_data.access_token.clone());
        self.session.update(session_data);
        self.session.save()?;
        self.identity.invalidate_all();

        println!("Signed in.");
        Ok(())
    }

    pub async fn logout(&mut self) -> Result<()> {
        if let Err(e) = self.api.sign_out().await {
            warn!(error = %e, "Remote sign-out failed, clearing local session anyway");
        }
        self.api.clear_token();
        self.session.clear()?;
        self.identity.invalidate_all();

        println!("Signed out.");
        Ok(())
    }

    /// Refresh the access token if it is about to expire.
    ///
    /// A failed refresh leaves a still-valid session in place. An expired
    /// session, or one whose refresh token the backend rejected, is dropped.
    async fn ensure_fresh_session(&mut self) -> Result<()> {
        let refresh_token = match self.session.data {
            Some(ref data) if data.needs_refresh() => data.refresh_token.clone(),
            _ => return Ok(()),
        };

        match self.api.refresh_session(&refresh_token).await {
            Ok(data) => {
                info!(user_id = %data.user_id, "Session refreshed");
                self.api.set_token(data.access_token.clone());
                self.session.update(data);
                self.session.save()?;
                self.identity.invalidate_all();
            }
            Err(e) => {
                let rejected = e
                    .downcast_ref::<ApiError>()
                    .is_some_and(ApiError::is_auth_failure);
                warn!(error = %e, rejected, "Session refresh failed");
                if rejected || !self.session.is_valid() {
                    self.api.clear_token();
                    self.session.clear()?;
                    self.identity.invalidate_all();
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Identity
    // =========================================================================

    pub async fn whoami(&mut self, json: bool) -> Result<()> {
        self.ensure_fresh_session().await?;
        let identity = self.identity.resolve().await;

        if json {
            let value = serde_json::json!({
                "user": identity.user,
                "invited": identity.invited,
                "parent_id": identity.parent_id,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            print!("{}", format_identity(&identity));
        }
        Ok(())
    }

    pub async fn status(&mut self) -> Result<()> {
        self.ensure_fresh_session().await?;

        match self.session.data {
            Some(ref data) => println!(
                "Session:    {} (expires in {}m)",
                data.email.as_deref().unwrap_or(&data.user_id),
                data.minutes_until_expiry()
            ),
            None => println!("Session:    none"),
        }
        println!("Backend:    {}", self.api.backend().url());

        self.identity.resolve().await;
        for status in self.identity.statuses() {
            println!("{}", format_status(&status));
        }
        Ok(())
    }

    /// Resolve identity once per second, printing cache state each time.
    pub async fn watch(&mut self, duration: Duration) -> Result<()> {
        self.ensure_fresh_session().await?;

        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(WATCH_INTERVAL);
        while started.elapsed() < duration {
            ticker.tick().await;
            let identity = self.identity.resolve().await;
            let states: Vec<String> = self
                .identity
                .statuses()
                .iter()
                .map(|s| format!("{}={}", s.name, s.state))
                .collect();
            println!(
                "[{:>3}s] {} | {}",
                started.elapsed().as_secs(),
                summarize_identity(&identity),
                states.join(" ")
            );
        }
        Ok(())
    }

    fn prompt_email(&self) -> Result<String> {
        match self.config.last_email {
            Some(ref last) => print!("Email [{}]: ", last),
            None => print!("Email: "),
        }
        io::stdout().flush()?;

        let mut email = String::new();
        io::stdin()
            .read_line(&mut email)
            .context("Failed to read email")?;
        let email = email.trim();
        if email.is_empty() {
            return Ok(self.config.last_email.clone().unwrap_or_default());
        }
        Ok(email.to_string())
    }
}

fn format_identity(identity: &Identity) -> String {
    let user = match identity.user {
        Some(ref user) => match user.email {
            Some(ref email) if email != user.display_name() => {
                format!("{} <{}> (id {})", user.display_name(), email, user.id)
            }
            _ => format!("{} (id {})", user.display_name(), user.id),
        },
        None => "not signed in".to_string(),
    };
    format!(
        "User:       {}\nInvited:    {}\nParent id:  {}\n",
        user,
        if identity.invited { "yes" } else { "no" },
        identity.parent_id.as_deref().unwrap_or("none"),
    )
}

fn summarize_identity(identity: &Identity) -> String {
    format!(
        "user={} invited={} parent={}",
        identity.user.as_ref().map(|u| u.id.as_str()).unwrap_or("-"),
        identity.invited,
        identity.parent_id.as_deref().unwrap_or("-"),
    )
}

fn format_status(status: &CacheStatus) -> String {
    let lookups = if status.lookups == 1 { "lookup" } else { "lookups" };
    format!(
        "{:<12}{} [{} {}]",
        format!("{}:", status.name),
        status.display(),
        status.lookups,
        lookups
    )
}
