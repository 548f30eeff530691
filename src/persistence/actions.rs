use crate::persistence::service::{PersistenceError, PersistenceService};
use crate::state::{LocalAncestorsOnly, StateResolutionError, StateResolver};
use crate::units::{Pdu, PduRef, Transaction, TransactionResponse};
use std::sync::Arc;

/// PduActions are the PDU level operations the replication layer performs against persistence.
#[derive(Clone)]
pub(crate) struct PduActions {
    persistence: Arc<dyn PersistenceService>,
    resolver: Arc<StateResolver>,
}

impl PduActions {
    pub(crate) fn new(persistence: Arc<dyn PersistenceService>, resolver: Arc<StateResolver>) -> Self {
        PduActions { persistence, resolver }
    }

    /// Fills in the causal fields of an outgoing PDU that hasn't been persisted yet: `prev_pdus`
    /// become the context's forward extremities, `depth` is one more than the deepest of them, and
    /// a state PDU claims to supersede the current state for its key (if any).
    pub(crate) async fn populate_previous_pdus(&self, pdu: &mut Pdu) -> Result<(), PersistenceError> {
        let extremities = self.persistence.get_prev_pdus(&pdu.context).await?;

        pdu.depth = extremities.iter().map(|(_, depth)| depth + 1).max().unwrap_or(0);
        pdu.prev_pdus = extremities.into_iter().map(|(pdu_ref, _)| pdu_ref).collect();

        if let Some(key) = pdu.state_key() {
            let current = self.persistence.get_current_state(&key).await?;
            if let Some(state) = pdu.state.as_mut() {
                state.prev_state = current.map(|c| c.pdu_ref());
            }
        }

        Ok(())
    }

    pub(crate) async fn persist_received(&self, pdu: &Pdu) -> Result<(), PersistenceError> {
        self.persist(pdu).await
    }

    /// Persists a PDU we created. For state PDUs this also runs state resolution: we must have
    /// seen everything we reference, so no ancestor is ever fetched. Returns whether the PDU
    /// became current state.
    pub(crate) async fn persist_outgoing(&self, pdu: &Pdu) -> Result<bool, StateResolutionError> {
        self.persist(pdu).await?;

        if !pdu.is_state() {
            return Ok(false);
        }
        self.resolver.handle_new_state(pdu, &LocalAncestorsOnly).await
    }

    async fn persist(&self, pdu: &Pdu) -> Result<(), PersistenceError> {
        if pdu.is_state() {
            self.persistence.insert_state(pdu).await?;
        } else {
            self.persistence.insert(pdu).await?;
        }

        self.persistence.update_min_depth(&pdu.context, pdu.depth).await
    }

    pub(crate) async fn mark_as_processed(&self, pdu: &Pdu) -> Result<(), PersistenceError> {
        self.persistence.mark_as_processed(&pdu.pdu_ref()).await
    }

    pub(crate) async fn is_new(&self, pdu: &Pdu) -> Result<bool, PersistenceError> {
        self.persistence.is_new(&pdu.pdu_ref(), &pdu.context, pdu.depth).await
    }

    pub(crate) async fn get_persisted_pdu(&self, pdu_ref: &PduRef) -> Result<Option<Pdu>, PersistenceError> {
        self.persistence.get_pdu(pdu_ref).await
    }

    pub(crate) async fn current_state(&self, context: &str) -> Result<Vec<Pdu>, PersistenceError> {
        self.persistence.get_current_state_for_context(context).await
    }

    pub(crate) async fn paginate(
        &self,
        context: &str,
        versions: &[PduRef],
        limit: usize,
    ) -> Result<Vec<Pdu>, PersistenceError> {
        self.persistence.get_pagination(context, versions, limit).await
    }

    pub(crate) async fn back_extremities(&self, context: &str) -> Result<Vec<PduRef>, PersistenceError> {
        self.persistence.get_back_extremities(context).await
    }

    pub(crate) async fn min_depth(&self, context: &str) -> Result<Option<u64>, PersistenceError> {
        self.persistence.get_min_depth(context).await
    }
}

/// TransactionActions keep the transaction log: responses to received transactions, and the
/// history of transactions sent to each destination.
#[derive(Clone)]
pub(crate) struct TransactionActions {
    persistence: Arc<dyn PersistenceService>,
}

impl TransactionActions {
    pub(crate) fn new(persistence: Arc<dyn PersistenceService>) -> Self {
        TransactionActions { persistence }
    }

    /// The response we already gave to `transaction`, if any.
    pub(crate) async fn have_responded(
        &self,
        transaction: &Transaction,
    ) -> Result<Option<TransactionResponse>, PersistenceError> {
        let transaction_id = Self::transaction_id(transaction)?;
        self.persistence
            .get_received_txn_response(transaction_id, &transaction.origin)
            .await
    }

    pub(crate) async fn set_response(
        &self,
        transaction: &Transaction,
        response: &TransactionResponse,
    ) -> Result<(), PersistenceError> {
        Self::transaction_id(transaction)?;
        self.persistence.set_received_txn_response(transaction, response).await
    }

    /// Records `transaction` as about to be sent, and fills in its `previous_ids`.
    pub(crate) async fn prepare_to_send(&self, transaction: &mut Transaction) -> Result<(), PersistenceError> {
        let transaction_id = Self::transaction_id(transaction)?;
        let destination = Self::destination(transaction)?;

        let previous_ids = self
            .persistence
            .prep_send_transaction(transaction_id, destination, transaction.ts, &transaction.pdu_refs())
            .await?;
        transaction.previous_ids = previous_ids;

        Ok(())
    }

    pub(crate) async fn delivered(
        &self,
        transaction: &Transaction,
        response: &TransactionResponse,
    ) -> Result<(), PersistenceError> {
        let transaction_id = Self::transaction_id(transaction)?;
        let destination = Self::destination(transaction)?;

        self.persistence.delivered_txn(transaction_id, destination, response).await
    }

    fn transaction_id(transaction: &Transaction) -> Result<&str, PersistenceError> {
        transaction
            .transaction_id
            .as_deref()
            .ok_or(PersistenceError::IncompleteTransaction("transaction_id"))
    }

    fn destination(transaction: &Transaction) -> Result<&str, PersistenceError> {
        transaction
            .destination
            .as_deref()
            .ok_or(PersistenceError::IncompleteTransaction("destination"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use crate::units::{IdGenerator, NewPdu, NewStateFields};
    use serde_json::json;
    use std::time::Duration;

    fn actions() -> (PduActions, TransactionActions, Arc<InMemoryPersistence>) {
        let db = Arc::new(InMemoryPersistence::new());
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let resolver = Arc::new(StateResolver::new(db.clone(), Duration::from_secs(1), 64, logger));

        (PduActions::new(db.clone(), resolver), TransactionActions::new(db.clone()), db)
    }

    fn outgoing(ids: &IdGenerator, state: bool) -> Pdu {
        Pdu::create_new(
            "a",
            NewPdu {
                context: "!r".into(),
                pdu_type: if state { "topic".into() } else { "m.text".into() },
                content: json!({}),
                destinations: vec!["b".into()],
                state: if state {
                    Some(NewStateFields {
                        state_key: "".into(),
                        power_level: 0,
                    })
                } else {
                    None
                },
                ..NewPdu::default()
            },
            ids,
        )
    }

    #[tokio::test]
    async fn depth_follows_the_deepest_parent() {
        let (pdus, _, db) = actions();
        let ids = IdGenerator::with_nonce(1);

        let mut first = outgoing(&ids, false);
        pdus.populate_previous_pdus(&mut first).await.unwrap();
        assert_eq!(first.depth, 0);
        assert!(first.prev_pdus.is_empty());
        pdus.persist_outgoing(&first).await.unwrap();

        // A received PDU forks the DAG at a greater depth.
        let remote = Pdu::from_json(json!({
            "pdu_id": "r", "context": "!r", "origin": "b", "ts": 1, "pdu_type": "m.text",
            "depth": 7, "prev_pdus": [["unknown", "b"]], "content": {},
        }))
        .unwrap();
        pdus.persist_received(&remote).await.unwrap();

        let mut next = outgoing(&ids, false);
        pdus.populate_previous_pdus(&mut next).await.unwrap();
        assert_eq!(next.depth, 8);
        assert_eq!(next.prev_pdus, vec![first.pdu_ref(), remote.pdu_ref()]);

        assert_eq!(db.get_min_depth("!r").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn outgoing_state_supersedes_current_state() {
        let (pdus, _, db) = actions();
        let ids = IdGenerator::with_nonce(2);

        let mut first = outgoing(&ids, true);
        pdus.populate_previous_pdus(&mut first).await.unwrap();
        assert_eq!(first.prev_state(), None);
        assert!(pdus.persist_outgoing(&first).await.unwrap());

        let mut second = outgoing(&ids, true);
        pdus.populate_previous_pdus(&mut second).await.unwrap();
        assert_eq!(second.prev_state(), Some(&first.pdu_ref()));
        assert!(pdus.persist_outgoing(&second).await.unwrap());

        let key = second.state_key().unwrap();
        assert_eq!(db.get_current_state(&key).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn processed_flag_is_recorded() {
        let (pdus, _, db) = actions();
        let ids = IdGenerator::with_nonce(3);
        let pdu = outgoing(&ids, false);

        pdus.persist_received(&pdu).await.unwrap();
        assert!(!db.is_processed(&pdu.pdu_ref()).await.unwrap());

        pdus.mark_as_processed(&pdu).await.unwrap();
        assert!(db.is_processed(&pdu.pdu_ref()).await.unwrap());
        assert_eq!(pdus.min_depth("!r").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn transaction_log_requires_ids() {
        let (_, txns, _) = actions();
        let mut anonymous = Transaction::wrap_pdus("a", &[]).unwrap();

        assert!(matches!(
            txns.have_responded(&anonymous).await,
            Err(PersistenceError::IncompleteTransaction("transaction_id"))
        ));
        assert!(txns.prepare_to_send(&mut anonymous).await.is_err());
    }

    #[tokio::test]
    async fn prepare_to_send_links_previous_transactions() {
        let (pdus, txns, db) = actions();
        let ids = IdGenerator::with_nonce(4);

        let mut batch = vec![outgoing(&ids, false)];
        pdus.persist_outgoing(&batch[0]).await.unwrap();
        let mut first = Transaction::create_new("a", "b", &mut batch, &ids).unwrap();
        txns.prepare_to_send(&mut first).await.unwrap();
        assert!(first.previous_ids.is_empty());
        txns.delivered(&first, &TransactionResponse::new(200, json!([{}]))).await.unwrap();

        let mut second = Transaction::create_new("a", "b", &mut [], &ids).unwrap();
        txns.prepare_to_send(&mut second).await.unwrap();
        assert_eq!(second.previous_ids, vec![first.transaction_id.clone().unwrap()]);

        let first_id = first.transaction_id.as_deref().unwrap();
        assert!(db.get_pdus_after_transaction(first_id, "b").await.unwrap().is_empty());
    }
}
