use super::SessionContext;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// In-memory directory of active sessions.
///
/// Sessions are never persisted; the registry is the only map shared between
/// sessions. Everything else lives inside each [`SessionContext`].
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<SessionContext>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionContext>> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned()
    }

    /// Registers `context` and returns the context it replaced, if any.
    pub async fn insert(&self, context: Arc<SessionContext>) -> Option<Arc<SessionContext>> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(context.id().to_string(), context)
    }

    /// Unregisters a session. The caller is responsible for tearing it down.
    pub async fn remove(&self, session_id: &str) -> Option<Arc<SessionContext>> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn contexts(&self) -> Vec<Arc<SessionContext>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Evicts and tears down every session idle for longer than `ttl` at `now`.
    ///
    /// Sessions with a live process are never evicted. Returns the evicted ids.
    pub async fn sweep(&self, ttl: Duration, now: DateTime<Utc>) -> Vec<String> {
        let evicted: Vec<Arc<SessionContext>> = {
            let mut sessions = self.sessions.write().await;
            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, context)| context.is_expired(ttl, now))
                .map(|(id, _)| id.clone())
                .collect();
            expired
                .iter()
                .filter_map(|id| sessions.remove(id))
                .collect()
        };

        let mut ids = Vec::with_capacity(evicted.len());
        for context in evicted {
            context.teardown().await;
            ids.push(context.id().to_string());
        }
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "Evicted idle sessions");
        }
        ids
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until the handle is aborted.
    pub fn spawn_sweeper(&self, interval: Duration, ttl: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = registry.sweep(ttl, Utc::now()).await;
                tracing::debug!(evicted = evicted.len(), "Session sweep finished");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use yume_core::{EngineConfig, Session};
    use yume_interaction::{AgentLauncher, ClaudeCliLauncher};

    fn context(id: &str, idle_for: chrono::Duration) -> Arc<SessionContext> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let launcher: Arc<dyn AgentLauncher> = Arc::new(ClaudeCliLauncher::new());
        let context = SessionContext::new(
            Session::new(id, std::env::temp_dir()),
            launcher,
            tx,
            &EngineConfig::default(),
        );
        context.lock().session.last_activity = Utc::now() - idle_for;
        context
    }

    #[tokio::test]
    async fn test_insert_get_remove() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty().await);

        assert!(registry.insert(context("a", chrono::Duration::zero())).await.is_none());
        assert!(registry.insert(context("a", chrono::Duration::zero())).await.is_some());
        assert_eq!(registry.len().await, 1);

        assert!(registry.get("a").await.is_some());
        assert!(registry.remove("a").await.is_some());
        assert!(registry.get("a").await.is_none());
        assert!(registry.remove("a").await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_expired_sessions() {
        let registry = SessionRegistry::new();
        let stale = context("stale", chrono::Duration::hours(25));
        registry.insert(stale.clone()).await;
        registry.insert(context("fresh", chrono::Duration::hours(1))).await;

        let evicted = registry
            .sweep(Duration::from_secs(24 * 3600), Utc::now())
            .await;

        assert_eq!(evicted, vec!["stale".to_string()]);
        assert!(registry.get("stale").await.is_none());
        assert!(registry.get("fresh").await.is_some());
        assert!(stale.slot.is_closed(), "Evicted sessions are torn down");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval() {
        let registry = SessionRegistry::new();
        registry.insert(context("old", chrono::Duration::days(2))).await;

        let sweeper = registry.spawn_sweeper(Duration::from_secs(3600), Duration::from_secs(86_400));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(registry.len().await, 1, "No sweep before the first interval");

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(registry.is_empty().await);
        sweeper.abort();
    }
}
