use crate::persistence::service::{PersistenceError, PersistenceService};
use crate::units::{Pdu, PduRef, StateKey, Transaction, TransactionResponse};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

// Not durable. It models the table layout a real backend would have, so that the extremity and
// pagination bookkeeping is exercised the same way.
pub struct InMemoryPersistence {
    tables: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    pdus: HashMap<PduRef, PduRow>,
    /// child -> parents, per context.
    edges: HashMap<PduRef, (String, Vec<PduRef>)>,
    /// Every PduRef some stored PDU lists as a parent.
    referenced: HashSet<PduRef>,
    forward_extremities: HashMap<String, HashSet<PduRef>>,
    backward_extremities: HashMap<String, HashSet<PduRef>>,
    min_depth: HashMap<String, u64>,
    current_state: HashMap<StateKey, PduRef>,
    received_txns: HashMap<(String, String), TransactionResponse>,
    /// Append-only, in send order.
    sent_txns: Vec<SentTxnRow>,
}

struct PduRow {
    pdu: Pdu,
    processed: bool,
}

struct SentTxnRow {
    transaction_id: String,
    destination: String,
    pdus: Vec<PduRef>,
    response: Option<TransactionResponse>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        InMemoryPersistence {
            tables: Mutex::new(Tables::default()),
        }
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, PersistenceError> {
        self.tables
            .lock()
            .map_err(|_| PersistenceError::Backend("tables mutex poisoned".into()))
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl Tables {
    fn insert_pdu(&mut self, pdu: &Pdu) {
        let pdu_ref = pdu.pdu_ref();

        match self.pdus.get_mut(&pdu_ref) {
            Some(row) if row.pdu.outlier && !pdu.outlier => {
                row.pdu.outlier = false;
            }
            Some(_) => return,
            None => {
                self.pdus.insert(
                    pdu_ref.clone(),
                    PduRow {
                        pdu: pdu.clone(),
                        processed: false,
                    },
                );
                self.edges
                    .insert(pdu_ref.clone(), (pdu.context.clone(), pdu.prev_pdus.clone()));
                self.referenced.extend(pdu.prev_pdus.iter().cloned());
            }
        }

        if !pdu.outlier {
            self.update_extremities(&pdu_ref, &pdu.context, &pdu.prev_pdus);
        }
    }

    fn update_extremities(&mut self, pdu_ref: &PduRef, context: &str, prev_pdus: &[PduRef]) {
        let forward = self.forward_extremities.entry(context.to_string()).or_default();
        for prev in prev_pdus {
            forward.remove(prev);
        }
        if !self.referenced.contains(pdu_ref) {
            forward.insert(pdu_ref.clone());
        }

        let pdus = &self.pdus;
        let backward = self.backward_extremities.entry(context.to_string()).or_default();
        backward.extend(prev_pdus.iter().cloned());
        backward.retain(|r| !matches!(pdus.get(r), Some(row) if !row.pdu.outlier));
    }

    fn pdu(&self, pdu_ref: &PduRef) -> Option<Pdu> {
        self.pdus.get(pdu_ref).map(|row| row.pdu.clone())
    }

    /// The shallowest depth of a PDU in `context` that points at a backward extremity.
    fn backfill_frontier(&self, context: &str) -> Option<u64> {
        let backward = self.backward_extremities.get(context)?;

        self.edges
            .iter()
            .filter(|(_, (edge_context, parents))| {
                edge_context == context && parents.iter().any(|p| backward.contains(p))
            })
            .filter_map(|(child, _)| self.pdus.get(child).map(|row| row.pdu.depth))
            .min()
    }
}

#[async_trait::async_trait]
impl PersistenceService for InMemoryPersistence {
    async fn get_received_txn_response(
        &self,
        transaction_id: &str,
        origin: &str,
    ) -> Result<Option<TransactionResponse>, PersistenceError> {
        let tables = self.tables()?;
        let key = (transaction_id.to_string(), origin.to_string());

        Ok(tables.received_txns.get(&key).cloned())
    }

    async fn set_received_txn_response(
        &self,
        transaction: &Transaction,
        response: &TransactionResponse,
    ) -> Result<(), PersistenceError> {
        let transaction_id = match &transaction.transaction_id {
            Some(id) => id.clone(),
            // Responses to request-shaped envelopes are never replayed.
            None => return Ok(()),
        };

        let mut tables = self.tables()?;
        tables
            .received_txns
            .insert((transaction_id, transaction.origin.clone()), response.clone());

        Ok(())
    }

    async fn prep_send_transaction(
        &self,
        transaction_id: &str,
        destination: &str,
        // Rows are kept in send order, so the send time is never consulted.
        _ts: i64,
        pdus: &[PduRef],
    ) -> Result<Vec<String>, PersistenceError> {
        let mut tables = self.tables()?;

        // Only one transaction is ever in flight per destination, so the last one is enough.
        let previous_ids = tables
            .sent_txns
            .iter()
            .rev()
            .find(|row| row.destination == destination)
            .map(|row| vec![row.transaction_id.clone()])
            .unwrap_or_default();

        tables.sent_txns.push(SentTxnRow {
            transaction_id: transaction_id.to_string(),
            destination: destination.to_string(),
            pdus: pdus.to_vec(),
            response: None,
        });

        Ok(previous_ids)
    }

    async fn delivered_txn(
        &self,
        transaction_id: &str,
        destination: &str,
        response: &TransactionResponse,
    ) -> Result<(), PersistenceError> {
        let mut tables = self.tables()?;

        let row = tables
            .sent_txns
            .iter_mut()
            .find(|row| row.transaction_id == transaction_id && row.destination == destination)
            .ok_or_else(|| PersistenceError::UnknownSentTransaction {
                transaction_id: transaction_id.to_string(),
                destination: destination.to_string(),
            })?;
        row.response.replace(response.clone());

        Ok(())
    }

    async fn get_pdus_after_transaction(
        &self,
        transaction_id: &str,
        destination: &str,
    ) -> Result<Vec<Pdu>, PersistenceError> {
        let tables = self.tables()?;

        let position = tables
            .sent_txns
            .iter()
            .position(|row| row.transaction_id == transaction_id && row.destination == destination)
            .ok_or_else(|| PersistenceError::UnknownSentTransaction {
                transaction_id: transaction_id.to_string(),
                destination: destination.to_string(),
            })?;

        let pdus = tables.sent_txns[position + 1..]
            .iter()
            .filter(|row| row.destination == destination)
            .flat_map(|row| row.pdus.iter())
            .filter_map(|pdu_ref| tables.pdu(pdu_ref))
            .collect();

        Ok(pdus)
    }

    async fn get_pdu(&self, pdu_ref: &PduRef) -> Result<Option<Pdu>, PersistenceError> {
        Ok(self.tables()?.pdu(pdu_ref))
    }

    async fn insert(&self, pdu: &Pdu) -> Result<(), PersistenceError> {
        self.tables()?.insert_pdu(pdu);
        Ok(())
    }

    async fn insert_state(&self, pdu: &Pdu) -> Result<(), PersistenceError> {
        if !pdu.is_state() {
            return Err(PersistenceError::NotStatePdu(pdu.pdu_ref()));
        }
        self.tables()?.insert_pdu(pdu);
        Ok(())
    }

    async fn mark_as_processed(&self, pdu_ref: &PduRef) -> Result<(), PersistenceError> {
        if let Some(row) = self.tables()?.pdus.get_mut(pdu_ref) {
            row.processed = true;
        }
        Ok(())
    }

    async fn is_processed(&self, pdu_ref: &PduRef) -> Result<bool, PersistenceError> {
        let tables = self.tables()?;
        Ok(tables.pdus.get(pdu_ref).map(|row| row.processed).unwrap_or(false))
    }

    async fn get_prev_pdus(&self, context: &str) -> Result<Vec<(PduRef, u64)>, PersistenceError> {
        let tables = self.tables()?;

        let mut prev_pdus: Vec<(PduRef, u64)> = tables
            .forward_extremities
            .get(context)
            .into_iter()
            .flatten()
            .filter_map(|r| tables.pdus.get(r).map(|row| (r.clone(), row.pdu.depth)))
            .collect();
        prev_pdus.sort();

        Ok(prev_pdus)
    }

    async fn get_back_extremities(&self, context: &str) -> Result<Vec<PduRef>, PersistenceError> {
        let tables = self.tables()?;

        let mut extremities: Vec<PduRef> = tables
            .backward_extremities
            .get(context)
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        extremities.sort();

        Ok(extremities)
    }

    async fn get_min_depth(&self, context: &str) -> Result<Option<u64>, PersistenceError> {
        Ok(self.tables()?.min_depth.get(context).copied())
    }

    async fn update_min_depth(&self, context: &str, depth: u64) -> Result<(), PersistenceError> {
        let mut tables = self.tables()?;
        let min_depth = tables.min_depth.entry(context.to_string()).or_insert(depth);
        if depth < *min_depth {
            *min_depth = depth;
        }
        Ok(())
    }

    async fn is_new(&self, pdu_ref: &PduRef, context: &str, depth: u64) -> Result<bool, PersistenceError> {
        let tables = self.tables()?;

        match tables.backfill_frontier(context) {
            Some(frontier) if depth <= frontier => {}
            _ => return Ok(true),
        }

        let is_forward = tables
            .forward_extremities
            .get(context)
            .map(|f| f.contains(pdu_ref))
            .unwrap_or(false);

        Ok(is_forward)
    }

    async fn get_pagination(
        &self,
        context: &str,
        versions: &[PduRef],
        limit: usize,
    ) -> Result<Vec<Pdu>, PersistenceError> {
        let tables = self.tables()?;

        let mut seen: HashSet<PduRef> = HashSet::new();
        let mut results: Vec<PduRef> = Vec::new();
        for version in versions {
            if seen.insert(version.clone()) {
                results.push(version.clone());
            }
        }

        let mut front = results.clone();
        while !front.is_empty() && results.len() < limit {
            let mut new_front = Vec::new();
            for pdu_ref in &front {
                let parents = match tables.edges.get(pdu_ref) {
                    Some((edge_context, parents)) if edge_context == context => parents,
                    _ => continue,
                };
                for parent in parents {
                    if results.len() + new_front.len() >= limit {
                        break;
                    }
                    if seen.insert(parent.clone()) {
                        new_front.push(parent.clone());
                    }
                }
            }
            results.extend(new_front.iter().cloned());
            front = new_front;
        }

        let pdus = results
            .iter()
            .take(limit)
            .filter_map(|r| tables.pdu(r))
            .filter(|p| p.context == context)
            .collect();

        Ok(pdus)
    }

    async fn get_current_state(&self, key: &StateKey) -> Result<Option<Pdu>, PersistenceError> {
        let tables = self.tables()?;
        Ok(tables.current_state.get(key).and_then(|r| tables.pdu(r)))
    }

    async fn get_current_state_for_context(&self, context: &str) -> Result<Vec<Pdu>, PersistenceError> {
        let tables = self.tables()?;

        let mut state: Vec<Pdu> = tables
            .current_state
            .iter()
            .filter(|(key, _)| key.context == context)
            .filter_map(|(_, r)| tables.pdu(r))
            .collect();
        state.sort_by(|a, b| {
            let a_key = (&a.pdu_type, a.state.as_ref().map(|s| &s.state_key));
            let b_key = (&b.pdu_type, b.state.as_ref().map(|s| &s.state_key));
            a_key.cmp(&b_key)
        });

        Ok(state)
    }

    async fn update_current_state(&self, key: &StateKey, pdu_ref: &PduRef) -> Result<(), PersistenceError> {
        self.tables()?.current_state.insert(key.clone(), pdu_ref.clone());
        Ok(())
    }
}
