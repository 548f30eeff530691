use crate::units::{Pdu, PduRef, StateKey, Transaction, TransactionResponse};

/// PersistenceService is durable storage for PDUs, their edges and extremities, current-state
/// pointers, and the transaction log.
///
/// Each method is expected to be atomic on its own (think of a single SQL statement). Nothing here
/// promises isolation *across* calls; callers that need check-then-act semantics must serialize
/// themselves.
#[async_trait::async_trait]
pub trait PersistenceService: Send + Sync + 'static {
    // -- Transactions --

    /// The response we gave to a received transaction, or `None` if we never responded to it.
    async fn get_received_txn_response(
        &self,
        transaction_id: &str,
        origin: &str,
    ) -> Result<Option<TransactionResponse>, PersistenceError>;

    /// Records how we responded to a received transaction. Later calls to
    /// `get_received_txn_response()` return exactly this response.
    async fn set_received_txn_response(
        &self,
        transaction: &Transaction,
        response: &TransactionResponse,
    ) -> Result<(), PersistenceError>;

    /// Records an outgoing transaction before it is sent, plus which PDUs it carries. Returns the
    /// ids of the transaction(s) most recently sent to the same destination.
    async fn prep_send_transaction(
        &self,
        transaction_id: &str,
        destination: &str,
        ts: i64,
        pdus: &[PduRef],
    ) -> Result<Vec<String>, PersistenceError>;

    /// Records the response to an outgoing transaction.
    async fn delivered_txn(
        &self,
        transaction_id: &str,
        destination: &str,
        response: &TransactionResponse,
    ) -> Result<(), PersistenceError>;

    /// PDUs we sent to `destination` in transactions after `transaction_id`.
    async fn get_pdus_after_transaction(
        &self,
        transaction_id: &str,
        destination: &str,
    ) -> Result<Vec<Pdu>, PersistenceError>;

    // -- PDUs --

    async fn get_pdu(&self, pdu_ref: &PduRef) -> Result<Option<Pdu>, PersistenceError>;

    /// Inserts a non-state PDU and its edges, and updates the context's extremities unless the
    /// PDU is an outlier. Re-inserting a known PDU is a no-op, except that a PDU only known as an
    /// outlier is upgraded when it is inserted again as a non-outlier.
    async fn insert(&self, pdu: &Pdu) -> Result<(), PersistenceError>;

    /// Same as `insert()`, for state PDUs.
    async fn insert_state(&self, pdu: &Pdu) -> Result<(), PersistenceError>;

    async fn mark_as_processed(&self, pdu_ref: &PduRef) -> Result<(), PersistenceError>;

    async fn is_processed(&self, pdu_ref: &PduRef) -> Result<bool, PersistenceError>;

    /// The current forward extremities of `context`, with their depths.
    async fn get_prev_pdus(&self, context: &str) -> Result<Vec<(PduRef, u64)>, PersistenceError>;

    /// PDUs referenced by `context` that we have not seen yet.
    async fn get_back_extremities(&self, context: &str) -> Result<Vec<PduRef>, PersistenceError>;

    async fn get_min_depth(&self, context: &str) -> Result<Option<u64>, PersistenceError>;

    /// Lowers the context's min-depth to `depth` if it is shallower (or unset).
    async fn update_min_depth(&self, context: &str, depth: u64) -> Result<(), PersistenceError>;

    /// Whether a PDU at `depth` is ahead of what we consider historical for `context`.
    async fn is_new(&self, pdu_ref: &PduRef, context: &str, depth: u64) -> Result<bool, PersistenceError>;

    /// PDUs reachable backwards from `versions` (inclusive), at most `limit` of them.
    async fn get_pagination(
        &self,
        context: &str,
        versions: &[PduRef],
        limit: usize,
    ) -> Result<Vec<Pdu>, PersistenceError>;

    // -- State --

    async fn get_current_state(&self, key: &StateKey) -> Result<Option<Pdu>, PersistenceError>;

    async fn get_current_state_for_context(&self, context: &str) -> Result<Vec<Pdu>, PersistenceError>;

    /// Replaces (or sets) the current state pointer for `key`.
    async fn update_current_state(&self, key: &StateKey, pdu_ref: &PduRef) -> Result<(), PersistenceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Persistence backend failure: {0}")]
    Backend(String),
    #[error("Refusing to insert non-state PDU {0} as state")]
    NotStatePdu(PduRef),
    #[error("Transaction is missing `{0}`")]
    IncompleteTransaction(&'static str),
    #[error("No sent transaction {transaction_id} to {destination}")]
    UnknownSentTransaction {
        transaction_id: String,
        destination: String,
    },
}
