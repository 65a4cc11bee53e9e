//! Per-source session ownership across configuration generations.
//!
//! Each source uid maps to exactly one [`Generation`]. A generation opens its
//! session lazily, hands out [`Lease`]s to batches, and is disposed once when
//! newer settings replace it or the process shuts down.

use crate::{
    datasource::{ConnectionSettings, GenerationKey, SourceSettings},
    engine::{Connector, Session},
    error::QueryError,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Live,
    Disposed,
}

enum GenerationState {
    Uninitialized,
    Live(Arc<dyn Session>),
    Disposed,
}

impl GenerationState {
    fn lifecycle(&self) -> LifecycleState {
        match self {
            GenerationState::Uninitialized => LifecycleState::Uninitialized,
            GenerationState::Live(_) => LifecycleState::Live,
            GenerationState::Disposed => LifecycleState::Disposed,
        }
    }

    fn session(&self) -> Option<Arc<dyn Session>> {
        match self {
            GenerationState::Live(session) => Some(Arc::clone(session)),
            _ => None,
        }
    }
}

/// Shared access to a live session. Disposal of the generation waits until
/// every lease is dropped.
pub struct Lease {
    session: Arc<dyn Session>,
    _guard: OwnedRwLockReadGuard<GenerationState>,
}

impl Lease {
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }
}

pub struct Generation {
    key: GenerationKey,
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    state: Arc<RwLock<GenerationState>>,
}

impl Generation {
    fn new(key: GenerationKey, settings: ConnectionSettings, connector: Arc<dyn Connector>) -> Self {
        Self {
            key,
            settings,
            connector,
            state: Arc::new(RwLock::new(GenerationState::Uninitialized)),
        }
    }

    pub fn key(&self) -> &GenerationKey {
        &self.key
    }

    pub async fn state(&self) -> LifecycleState {
        self.state.read().await.lifecycle()
    }

    /// Returns a lease on the live session, opening it on first use.
    pub async fn acquire(&self) -> Result<Lease, QueryError> {
        let guard = Arc::clone(&self.state).read_owned().await;
        match guard.lifecycle() {
            LifecycleState::Live => return self.lease(guard),
            LifecycleState::Disposed => return Err(self.disposed()),
            LifecycleState::Uninitialized => drop(guard),
        }

        let mut guard = Arc::clone(&self.state).write_owned().await;
        match guard.lifecycle() {
            LifecycleState::Disposed => return Err(self.disposed()),
            LifecycleState::Live => {}
            LifecycleState::Uninitialized => {
                let session = self.connector.connect(&self.settings).await.map_err(|err| {
                    error!(generation = %self.key, error = %err, "failed to open session");
                    QueryError::ConnectionUnavailable(err.message)
                })?;
                info!(generation = %self.key, "session opened");
                *guard = GenerationState::Live(session);
            }
        }

        self.lease(guard.downgrade())
    }

    /// Closes the session if one is open. Safe to call repeatedly.
    pub async fn dispose(&self) {
        let previous = {
            let mut guard = self.state.write().await;
            std::mem::replace(&mut *guard, GenerationState::Disposed)
        };

        match previous {
            GenerationState::Live(session) => match session.close().await {
                Ok(()) => info!(generation = %self.key, "session closed"),
                Err(err) => {
                    error!(generation = %self.key, error = %err, "failed to close session")
                }
            },
            GenerationState::Uninitialized => {
                info!(generation = %self.key, "generation disposed before first use")
            }
            GenerationState::Disposed => {}
        }
    }

    fn lease(&self, guard: OwnedRwLockReadGuard<GenerationState>) -> Result<Lease, QueryError> {
        let session = guard.session().ok_or_else(|| self.disposed())?;
        Ok(Lease {
            session,
            _guard: guard,
        })
    }

    fn disposed(&self) -> QueryError {
        QueryError::ConnectionUnavailable(format!("generation {} has been disposed", self.key))
    }
}

/// Owns the current generation of every configured source.
pub struct InstanceManager {
    connector: Arc<dyn Connector>,
    instances: Mutex<HashMap<String, Arc<Generation>>>,
}

impl InstanceManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the generation matching `settings`, replacing and disposing a
    /// stale one for the same source.
    pub async fn get(&self, settings: &SourceSettings) -> Result<Arc<Generation>, QueryError> {
        let key = settings.generation_key();

        let (current, replaced) = {
            let mut instances = self.instances.lock();
            if let Some(existing) = instances.get(&key.uid) {
                if existing.key() == &key {
                    return Ok(Arc::clone(existing));
                }
            }

            let connection = ConnectionSettings::from_source(settings)
                .map_err(QueryError::ConnectionUnavailable)?;
            let generation = Arc::new(Generation::new(
                key.clone(),
                connection,
                Arc::clone(&self.connector),
            ));
            let replaced = instances.insert(key.uid.clone(), Arc::clone(&generation));
            (generation, replaced)
        };

        if let Some(old) = replaced {
            info!(previous = %old.key(), next = %key, "source settings changed");
            old.dispose().await;
        }

        Ok(current)
    }

    /// Disposes every generation; used at shutdown.
    pub async fn dispose_all(&self) {
        let generations: Vec<_> = self.instances.lock().drain().map(|(_, g)| g).collect();
        for generation in generations {
            generation.dispose().await;
        }
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{FakeConnector, FakeSession};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn settings(updated: i64) -> SourceSettings {
        SourceSettings {
            uid: "pg-main".into(),
            updated,
            json_data: json!({"host": "localhost", "port": "5432"}),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn opens_one_session_lazily_and_reuses_it() {
        let connector = Arc::new(FakeConnector::new(FakeSession::default()));
        let manager = InstanceManager::new(connector.clone());

        let generation = manager.get(&settings(1)).await.unwrap();
        assert_eq!(generation.state().await, LifecycleState::Uninitialized);
        assert_eq!(connector.connects(), 0);

        drop(generation.acquire().await.unwrap());
        drop(generation.acquire().await.unwrap());
        let again = manager.get(&settings(1)).await.unwrap();
        drop(again.acquire().await.unwrap());

        assert_eq!(connector.connects(), 1);
        assert_eq!(generation.state().await, LifecycleState::Live);
    }

    #[tokio::test]
    async fn settings_change_disposes_previous_generation_once() {
        let connector = Arc::new(FakeConnector::new(FakeSession::default()));
        let manager = InstanceManager::new(connector.clone());

        let first = manager.get(&settings(1)).await.unwrap();
        drop(first.acquire().await.unwrap());

        let second = manager.get(&settings(2)).await.unwrap();
        assert_eq!(first.state().await, LifecycleState::Disposed);
        assert_eq!(second.state().await, LifecycleState::Uninitialized);
        assert_eq!(connector.session.closes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.len(), 1);

        let err = first.acquire().await.err().expect("disposed generation must not lease");
        assert!(matches!(err, QueryError::ConnectionUnavailable(_)));
    }

    #[tokio::test]
    async fn dispose_twice_is_a_no_op() {
        let connector = Arc::new(FakeConnector::new(FakeSession::default()));
        let manager = InstanceManager::new(connector.clone());
        let generation = manager.get(&settings(1)).await.unwrap();
        drop(generation.acquire().await.unwrap());

        generation.dispose().await;
        generation.dispose().await;

        assert_eq!(generation.state().await, LifecycleState::Disposed);
        assert_eq!(connector.session.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disposing_unused_generation_never_connects() {
        let connector = Arc::new(FakeConnector::new(FakeSession::default()));
        let manager = InstanceManager::new(connector.clone());
        let generation = manager.get(&settings(1)).await.unwrap();

        generation.dispose().await;

        assert_eq!(connector.connects(), 0);
        assert_eq!(connector.session.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_failure_still_marks_generation_disposed() {
        let connector = Arc::new(FakeConnector::new(FakeSession::failing_close()));
        let manager = InstanceManager::new(connector.clone());

        let first = manager.get(&settings(1)).await.unwrap();
        drop(first.acquire().await.unwrap());
        let second = manager.get(&settings(2)).await.unwrap();

        assert_eq!(first.state().await, LifecycleState::Disposed);
        assert!(second.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn connect_failure_leaves_generation_retryable() {
        let connector = Arc::new(FakeConnector::refusing("connection refused"));
        let manager = InstanceManager::new(connector.clone());
        let generation = manager.get(&settings(1)).await.unwrap();

        let err = generation.acquire().await.err().unwrap();
        assert_eq!(err, QueryError::ConnectionUnavailable("connection refused".into()));
        assert_eq!(generation.state().await, LifecycleState::Uninitialized);

        assert!(generation.acquire().await.is_err());
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn invalid_settings_keep_current_generation() {
        let connector = Arc::new(FakeConnector::new(FakeSession::default()));
        let manager = InstanceManager::new(connector.clone());
        let current = manager.get(&settings(1)).await.unwrap();

        let mut broken = settings(2);
        broken.json_data = json!({"tlsMode": "bogus", "host": "h"});
        let err = manager.get(&broken).await.err().unwrap();

        assert!(matches!(err, QueryError::ConnectionUnavailable(_)));
        assert_eq!(current.state().await, LifecycleState::Uninitialized);
        assert!(Arc::ptr_eq(&current, &manager.get(&settings(1)).await.unwrap()));
    }

    #[tokio::test]
    async fn disposal_waits_for_outstanding_leases() {
        let connector = Arc::new(FakeConnector::new(FakeSession::default()));
        let manager = InstanceManager::new(connector.clone());
        let generation = manager.get(&settings(1)).await.unwrap();
        let lease = generation.acquire().await.unwrap();

        let disposer = {
            let generation = Arc::clone(&generation);
            tokio::spawn(async move { generation.dispose().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!disposer.is_finished());
        assert_eq!(connector.session.closes.load(Ordering::SeqCst), 0);

        drop(lease);
        disposer.await.unwrap();
        assert_eq!(connector.session.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispose_all_closes_every_source() {
        let connector = Arc::new(FakeConnector::new(FakeSession::default()));
        let manager = InstanceManager::new(connector.clone());
        let generation = manager.get(&settings(1)).await.unwrap();
        drop(generation.acquire().await.unwrap());

        manager.dispose_all().await;

        assert!(manager.is_empty());
        assert_eq!(generation.state().await, LifecycleState::Disposed);
    }
}
