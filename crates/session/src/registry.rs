//! The process-wide registry of active sessions.
//!
//! One entry per authenticated identity. Authentication replaces any
//! existing entry (the old transcript is discarded, not persisted);
//! explicit clears and transport disconnects persist the transcript as
//! the last observable effect before removal.
//!
//! Modules reach their session only through [`SessionRuns`], a weak
//! handle resolved against this registry at fire time — so a timer that
//! outlives its session simply finds nothing to run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use murmur_core::message::Message;
use murmur_core::module::{ModuleContext, ModuleTuning, RunRequest};
use murmur_core::provider::CompletionClient;
use murmur_core::settings::SettingsStore;
use murmur_core::transport::Transport;
use tracing::{debug, error, info, warn};

use crate::session::Session;

/// Everything a new session needs from the process environment.
pub struct SessionDeps {
    pub settings: SettingsStore,
    pub client: Arc<dyn CompletionClient>,
    pub session_cache_dir: PathBuf,
    pub system_prompt_override: Option<String>,
    pub tuning: ModuleTuning,
}

pub struct SessionRegistry {
    deps: SessionDeps,
    sessions: tokio::sync::RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(deps: SessionDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            sessions: tokio::sync::RwLock::new(HashMap::new()),
        })
    }

    /// Create the session for an identity, replacing any existing one.
    /// The replaced session is discarded without persistence.
    pub async fn authenticate(
        self: &Arc<Self>,
        user_id: &str,
        transport: Arc<dyn Transport>,
    ) -> Arc<Session> {
        let ctx = ModuleContext {
            user_id: user_id.to_string(),
            settings: self.deps.settings.clone(),
            transport,
            runs: Arc::new(SessionRuns {
                registry: Arc::downgrade(self),
                user_id: user_id.to_string(),
            }),
            client: self.deps.client.clone(),
            tuning: self.deps.tuning,
        };
        let session = Session::new(ctx, self.deps.system_prompt_override.as_deref()).await;

        let replaced = self
            .sessions
            .write()
            .await
            .insert(user_id.to_string(), session.clone());
        if replaced.is_some() {
            info!(user = %user_id, "Re-authentication replaced an existing session");
        }
        session
    }

    pub async fn get(&self, user_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(user_id).cloned()
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Remove the session, persisting its transcript first. The persist
    /// waits on the session's run lock, so an in-flight run finishes its
    /// writes before the transcript is written out.
    pub async fn remove(&self, user_id: &str) -> bool {
        let Some(session) = self.sessions.write().await.remove(user_id) else {
            return false;
        };
        match session.persist_locked(&self.deps.session_cache_dir).await {
            Ok(Some(path)) => debug!(user = %user_id, path = %path.display(), "Session closed"),
            Ok(None) => debug!(user = %user_id, "Session closed with empty transcript"),
            Err(e) => warn!(user = %user_id, error = %e, "Failed to persist transcript"),
        }
        true
    }
}

/// A non-owning run handle: user id + weak registry reference.
struct SessionRuns {
    registry: Weak<SessionRegistry>,
    user_id: String,
}

#[async_trait]
impl RunRequest for SessionRuns {
    async fn request_run(&self, seeds: Vec<Message>) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let Some(session) = registry.get(&self.user_id).await else {
            debug!(user = %self.user_id, "Run requested for a closed session");
            return;
        };
        if let Err(e) = session.run(seeds).await {
            error!(user = %self.user_id, error = %e, "Module-initiated run failed");
        }
    }
}
