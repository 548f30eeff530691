use crate::persistence::{PersistenceError, PersistenceService};
use crate::state::branches::{self, StateLoader, Winner};
use crate::state::key_lock::KeyLocks;
use crate::transport::TransportError;
use crate::units::{Pdu, PduRef};
use std::sync::Arc;
use std::time::Duration;

/// StateAncestorFetcher asks a remote home server for a state PDU we are missing while walking
/// state branches. Fetched PDUs are stored as outliers.
#[async_trait::async_trait]
pub trait StateAncestorFetcher: Send + Sync {
    async fn fetch_state_ancestor(&self, pdu_ref: &PduRef) -> Result<Option<Pdu>, TransportError>;
}

/// Used when the writer is authoritative: it has seen everything it references.
pub(crate) struct LocalAncestorsOnly;

#[async_trait::async_trait]
impl StateAncestorFetcher for LocalAncestorsOnly {
    async fn fetch_state_ancestor(&self, _pdu_ref: &PduRef) -> Result<Option<Pdu>, TransportError> {
        Ok(None)
    }
}

/// StateResolver decides whether a state PDU replaces the current state for its key, and
/// updates the current state pointer if it does.
pub struct StateResolver {
    persistence: Arc<dyn PersistenceService>,
    locks: KeyLocks,
    fetch_timeout: Duration,
    max_walk_hops: usize,
    logger: slog::Logger,
}

impl StateResolver {
    pub(crate) fn new(
        persistence: Arc<dyn PersistenceService>,
        fetch_timeout: Duration,
        max_walk_hops: usize,
        logger: slog::Logger,
    ) -> Self {
        StateResolver {
            persistence,
            locks: KeyLocks::new(),
            fetch_timeout,
            max_walk_hops,
            logger,
        }
    }

    /// Returns true if `new_pdu` is now the current state for its key.
    ///
    /// Calls for the same key are serialized in arrival order. `new_pdu` must already be
    /// persisted.
    pub async fn handle_new_state(
        &self,
        new_pdu: &Pdu,
        fetcher: &dyn StateAncestorFetcher,
    ) -> Result<bool, StateResolutionError> {
        let key = new_pdu
            .state_key()
            .ok_or_else(|| StateResolutionError::NotStatePdu(new_pdu.pdu_ref()))?;
        let new_ref = new_pdu.pdu_ref();
        let logger = self.logger.new(slog::o!("PduId" => new_ref.to_string()));

        let _guard = self.locks.lock(&key).await;

        let current = match self.persistence.get_current_state(&key).await? {
            Some(current) => current,
            None => {
                self.persistence.update_current_state(&key, &new_ref).await?;
                slog::info!(logger, "First state for ({}, {})", key.pdu_type, key.state_key);
                return Ok(true);
            }
        };
        let current_ref = current.pdu_ref();

        if current_ref == new_ref {
            slog::debug!(logger, "Already current state");
            return Ok(false);
        }

        if new_pdu.prev_state() == Some(&current_ref) {
            self.persistence.update_current_state(&key, &new_ref).await?;
            slog::info!(logger, "Replaced current state {} directly", current_ref);
            return Ok(true);
        }

        slog::debug!(logger, "Conflicts with current state {}, walking branches", current_ref);
        let loader = AncestorLoader {
            persistence: self.persistence.as_ref(),
            fetcher,
            fetch_timeout: self.fetch_timeout,
            logger: &logger,
        };
        let branches = branches::enumerate_branches(new_pdu.clone(), current, &loader, self.max_walk_hops).await?;
        slog::debug!(
            logger,
            "Branches diverged at {:?}: new has {} hops, current has {} hops",
            branches.common_ancestor,
            branches.new.len(),
            branches.current.len()
        );

        match branches::pick_winner(&branches.new, &branches.current) {
            Some(Winner::New) => {
                self.persistence.update_current_state(&key, &new_ref).await?;
                slog::info!(logger, "Won conflict against {}", current_ref);
                Ok(true)
            }
            Some(Winner::Current) => {
                slog::info!(logger, "Lost conflict against {}", current_ref);
                Ok(false)
            }
            None => {
                slog::error!(logger, "Could not resolve conflict against {}", current_ref);
                Err(StateResolutionError::UnresolvableConflict {
                    new: new_ref,
                    current: current_ref,
                })
            }
        }
    }
}

struct AncestorLoader<'a> {
    persistence: &'a dyn PersistenceService,
    fetcher: &'a dyn StateAncestorFetcher,
    fetch_timeout: Duration,
    logger: &'a slog::Logger,
}

#[async_trait::async_trait]
impl<'a> StateLoader for AncestorLoader<'a> {
    async fn load(&self, pdu_ref: &PduRef) -> Result<Option<Pdu>, StateResolutionError> {
        if let Some(pdu) = self.persistence.get_pdu(pdu_ref).await? {
            return Ok(Some(pdu));
        }

        slog::debug!(self.logger, "Fetching missing state ancestor {}", pdu_ref);
        let fetch = self.fetcher.fetch_state_ancestor(pdu_ref);
        let fetched = match tokio::time::timeout(self.fetch_timeout, fetch)
            .await
            .unwrap_or(Err(TransportError::Timeout))
        {
            Ok(Some(pdu)) if pdu.is_ref(pdu_ref) && pdu.is_state() => pdu.with_outlier(true),
            Ok(_) => {
                slog::warn!(self.logger, "State ancestor {} is unavailable", pdu_ref);
                return Ok(None);
            }
            Err(e) => {
                slog::warn!(self.logger, "Failed to fetch state ancestor {}: {}", pdu_ref, e);
                return Ok(None);
            }
        };

        self.persistence.insert_state(&fetched).await?;
        Ok(Some(fetched))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateResolutionError {
    #[error("PDU {0} is not a state PDU")]
    NotStatePdu(PduRef),
    #[error("Every tie-break rule tied between {new} and current state {current}")]
    UnresolvableConflict { new: PduRef, current: PduRef },
    #[error("Gave up walking state branches after {0} hops")]
    WalkTooLong(usize),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use crate::units::StateKey;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn state(id: &str, origin: &str, depth: u64, power: i64, prev: Option<&str>) -> Pdu {
        let mut wire = json!({
            "pdu_id": id, "context": "R", "origin": origin, "ts": 1, "pdu_type": "topic",
            "depth": depth, "content": {}, "is_state": true, "state_key": "", "power_level": power,
        });
        if let Some(prev) = prev {
            wire["prev_state_id"] = json!(prev);
            wire["prev_state_origin"] = json!("a");
        }
        Pdu::from_json(wire).unwrap()
    }

    fn topic_key() -> StateKey {
        StateKey {
            context: "R".into(),
            pdu_type: "topic".into(),
            state_key: "".into(),
        }
    }

    fn resolver(db: Arc<InMemoryPersistence>) -> StateResolver {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        StateResolver::new(db, Duration::from_millis(50), 64, logger)
    }

    async fn current(db: &InMemoryPersistence) -> String {
        db.get_current_state(&topic_key()).await.unwrap().unwrap().pdu_id
    }

    #[derive(Default)]
    struct MapFetcher {
        pdus: HashMap<PduRef, Pdu>,
        requests: Mutex<Vec<PduRef>>,
    }

    #[async_trait::async_trait]
    impl StateAncestorFetcher for MapFetcher {
        async fn fetch_state_ancestor(&self, pdu_ref: &PduRef) -> Result<Option<Pdu>, TransportError> {
            self.requests.lock().unwrap().push(pdu_ref.clone());
            Ok(self.pdus.get(pdu_ref).cloned())
        }
    }

    struct StuckFetcher;

    #[async_trait::async_trait]
    impl StateAncestorFetcher for StuckFetcher {
        async fn fetch_state_ancestor(&self, _pdu_ref: &PduRef) -> Result<Option<Pdu>, TransportError> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn higher_power_branch_wins_regardless_of_arrival_order() {
        for c_first in [false, true] {
            let db = Arc::new(InMemoryPersistence::new());
            let resolver = resolver(db.clone());
            let a = state("A", "a", 0, 10, None);
            let b = state("B", "a", 1, 10, Some("A"));
            let c = state("C", "c", 1, 15, Some("A"));
            for pdu in [&a, &b, &c] {
                db.insert_state(pdu).await.unwrap();
            }

            assert!(resolver.handle_new_state(&a, &LocalAncestorsOnly).await.unwrap());
            assert_eq!(current(&db).await, "A");

            let (first, second) = if c_first { (&c, &b) } else { (&b, &c) };
            resolver.handle_new_state(first, &LocalAncestorsOnly).await.unwrap();
            resolver.handle_new_state(second, &LocalAncestorsOnly).await.unwrap();

            assert_eq!(current(&db).await, "C");
        }
    }

    #[tokio::test]
    async fn direct_clobber_always_wins() {
        let db = Arc::new(InMemoryPersistence::new());
        let resolver = resolver(db.clone());
        let a = state("A", "a", 0, 100, None);
        let b = state("B", "a", 1, 0, Some("A"));
        db.insert_state(&a).await.unwrap();
        db.insert_state(&b).await.unwrap();

        resolver.handle_new_state(&a, &LocalAncestorsOnly).await.unwrap();
        assert!(resolver.handle_new_state(&b, &LocalAncestorsOnly).await.unwrap());
        assert_eq!(current(&db).await, "B");

        // Seeing the current state again changes nothing.
        assert!(!resolver.handle_new_state(&b, &LocalAncestorsOnly).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_updates_for_one_key_are_serialized() {
        let db = Arc::new(InMemoryPersistence::new());
        let resolver = Arc::new(resolver(db.clone()));
        let a = state("A", "a", 0, 10, None);
        db.insert_state(&a).await.unwrap();
        resolver.handle_new_state(&a, &LocalAncestorsOnly).await.unwrap();

        let mut tasks = Vec::new();
        for (id, power) in [("B", 10), ("C", 15), ("D", 12)] {
            let pdu = state(id, "a", 1, power, Some("A"));
            db.insert_state(&pdu).await.unwrap();
            let resolver = resolver.clone();
            tasks.push(tokio::spawn(async move {
                resolver.handle_new_state(&pdu, &LocalAncestorsOnly).await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(current(&db).await, "C");
    }

    #[tokio::test]
    async fn missing_ancestors_are_fetched_as_outliers() {
        let db = Arc::new(InMemoryPersistence::new());
        let resolver = resolver(db.clone());
        let a = state("A", "a", 0, 10, None);
        let b = state("B", "a", 1, 10, Some("A"));
        let x = state("X", "a", 1, 10, Some("A"));
        let y = state("Y", "a", 2, 20, Some("X"));
        db.insert_state(&a).await.unwrap();
        db.insert_state(&b).await.unwrap();
        db.insert_state(&y).await.unwrap();
        resolver.handle_new_state(&a, &LocalAncestorsOnly).await.unwrap();
        resolver.handle_new_state(&b, &LocalAncestorsOnly).await.unwrap();

        let mut fetcher = MapFetcher::default();
        fetcher.pdus.insert(x.pdu_ref(), x.clone());

        assert!(resolver.handle_new_state(&y, &fetcher).await.unwrap());
        assert_eq!(current(&db).await, "Y");
        assert_eq!(*fetcher.requests.lock().unwrap(), vec![x.pdu_ref()]);
        assert!(db.get_pdu(&x.pdu_ref()).await.unwrap().unwrap().outlier);
    }

    #[tokio::test]
    async fn stuck_fetches_time_out_and_exhaust_the_branch() {
        let db = Arc::new(InMemoryPersistence::new());
        let resolver = resolver(db.clone());
        let a = state("A", "a", 0, 10, None);
        let b = state("B", "a", 1, 10, Some("A"));
        let y = state("Y", "a", 2, 5, Some("X"));
        for pdu in [&a, &b, &y] {
            db.insert_state(pdu).await.unwrap();
        }
        resolver.handle_new_state(&a, &LocalAncestorsOnly).await.unwrap();
        resolver.handle_new_state(&b, &LocalAncestorsOnly).await.unwrap();

        // Y's branch stops at Y (power 5), B's runs to A (power 10).
        assert!(!resolver.handle_new_state(&y, &StuckFetcher).await.unwrap());
        assert_eq!(current(&db).await, "B");
    }

    #[tokio::test]
    async fn non_state_pdus_are_rejected() {
        let db = Arc::new(InMemoryPersistence::new());
        let resolver = resolver(db);
        let message = Pdu::from_json(json!({
            "pdu_id": "m", "context": "R", "origin": "a", "ts": 1, "pdu_type": "m.text", "content": {},
        }))
        .unwrap();

        let result = resolver.handle_new_state(&message, &LocalAncestorsOnly).await;
        assert!(matches!(result, Err(StateResolutionError::NotStatePdu(_))));
    }
}
