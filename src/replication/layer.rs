use crate::persistence::{PduActions, PersistenceError, PersistenceService, TransactionActions};
use crate::queue::{self, DeliveryHandle, TransactionQueue};
use crate::replication::fetch::RemoteStateFetcher;
use crate::replication::handler::{ReplicationHandler, ReplicationHandlerError};
use crate::state::{StateResolutionError, StateResolver};
use crate::transport::{Transport, TransportError, TransportRequestHandler};
use crate::units::{IdGenerator, NewPdu, Pdu, PduDecodeError, PduRef, Transaction, TransactionResponse};
use futures::future::{self, BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct ReplicationConfig {
    pub(crate) server_name: String,
    pub(crate) persistence: Arc<dyn PersistenceService>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) handler: Arc<dyn ReplicationHandler>,
    pub(crate) ids: Arc<IdGenerator>,
    pub(crate) state_fetch_timeout: Duration,
    pub(crate) backfill_fetch_timeout: Duration,
    pub(crate) queue_buffer_size: usize,
    pub(crate) max_state_walk_hops: usize,
    pub(crate) default_pagination_limit: usize,
    pub(crate) logger: slog::Logger,
}

/// Creates the replication layer. The returned queue actor must be spawned before anything is
/// sent.
pub(crate) fn create(config: ReplicationConfig) -> (Arc<ReplicationLayer>, queue::QueueActor) {
    let logger = config.logger.new(slog::o!("ServerName" => config.server_name.clone()));

    let resolver = Arc::new(StateResolver::new(
        config.persistence.clone(),
        config.state_fetch_timeout,
        config.max_state_walk_hops,
        logger.clone(),
    ));
    let pdus = PduActions::new(config.persistence.clone(), resolver.clone());
    let transactions = TransactionActions::new(config.persistence);

    let (queue, queue_actor) = queue::create(
        config.queue_buffer_size,
        config.server_name.clone(),
        config.transport.clone(),
        transactions.clone(),
        config.ids.clone(),
        logger.clone(),
    );

    let layer = ReplicationLayer {
        server_name: config.server_name,
        transport: config.transport,
        pdus,
        transactions,
        resolver,
        queue,
        handler: config.handler,
        ids: config.ids,
        order: AtomicU64::new(0),
        backfill_fetch_timeout: config.backfill_fetch_timeout,
        default_pagination_limit: config.default_pagination_limit,
        logger,
    };

    (Arc::new(layer), queue_actor)
}

/// ReplicationLayer receives PDUs from remote home servers, backfills what they reference,
/// persists them, resolves state, and hands them to the application. It also sends the
/// application's PDUs out through the transaction queue.
pub struct ReplicationLayer {
    server_name: String,
    transport: Arc<dyn Transport>,
    pdus: PduActions,
    transactions: TransactionActions,
    resolver: Arc<StateResolver>,
    queue: TransactionQueue,
    handler: Arc<dyn ReplicationHandler>,
    ids: Arc<IdGenerator>,
    order: AtomicU64,
    backfill_fetch_timeout: Duration,
    default_pagination_limit: usize,
    logger: slog::Logger,
}

/// SentPdu is a PDU that has been persisted and queued for every destination.
#[derive(Debug)]
pub struct SentPdu {
    pub pdu: Pdu,
    /// Only meaningful for state PDUs.
    pub became_current_state: bool,
    pub delivery: DeliveryHandle,
}

impl ReplicationLayer {
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Persists a new PDU (resolving state if it is a state PDU) and queues it for delivery.
    ///
    /// Returns as soon as the PDU is queued; use the returned delivery handle to wait for the
    /// destinations to respond.
    pub async fn send_pdu(&self, fields: NewPdu) -> Result<SentPdu, SendPduError> {
        let order = self.order.fetch_add(1, Ordering::SeqCst);
        let mut pdu = Pdu::create_new(&self.server_name, fields, &self.ids);
        let logger = self.logger.new(slog::o!("PduId" => pdu.pdu_id.clone()));

        self.pdus.populate_previous_pdus(&mut pdu).await?;
        let became_current_state = self.pdus.persist_outgoing(&pdu).await?;
        slog::debug!(logger, "Persisted outgoing PDU at depth {}", pdu.depth);

        let delivery = self.queue.enqueue_pdu(pdu.clone(), order).await;
        slog::debug!(logger, "Queued for {:?}", delivery.destinations());

        Ok(SentPdu {
            pdu,
            became_current_state,
            delivery,
        })
    }

    /// Processes a transaction from a remote home server. Transactions we already answered get
    /// the exact same answer again.
    pub async fn on_receive_transaction(&self, transaction: Transaction) -> TransactionResponse {
        let txn_id = transaction.transaction_id.clone().unwrap_or_default();
        let logger = self
            .logger
            .new(slog::o!("TxnId" => txn_id, "Origin" => transaction.origin.clone()));

        match self.process_transaction(&transaction, &logger).await {
            Ok(response) => response,
            Err(e) => {
                // Not persisted, so that a retry gets a fresh attempt.
                slog::error!(logger, "Failed to process transaction: {}", e);
                internal_error()
            }
        }
    }

    async fn process_transaction(
        &self,
        transaction: &Transaction,
        logger: &slog::Logger,
    ) -> Result<TransactionResponse, PersistenceError> {
        if let Some(response) = self.transactions.have_responded(transaction).await? {
            slog::debug!(logger, "Already responded to transaction");
            return Ok(response);
        }

        let handled = transaction.decode_pdus().into_iter().map(|decoded| async move {
            match decoded {
                Ok(pdu) => self.handle_new_pdu(pdu).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        });

        let results: Vec<Value> = future::join_all(handled)
            .await
            .into_iter()
            .map(|result| match result {
                Ok(_) => json!({}),
                Err(e) => {
                    slog::warn!(logger, "Failed to handle PDU: {}", e);
                    json!({ "error": e })
                }
            })
            .collect();

        let response = TransactionResponse::new(200, Value::Array(results));
        self.transactions.set_response(transaction, &response).await?;
        slog::debug!(logger, "Responded to transaction with {} PDUs", transaction.pdus.len());

        Ok(response)
    }

    /// Runs a PDU from a remote home server through the pipeline: duplicate check, backfill of
    /// missing ancestors, persistence, state resolution, and the application callback.
    ///
    /// Boxed since backfilling recurses through `get_pdu()`.
    pub fn handle_new_pdu(&self, pdu: Pdu) -> BoxFuture<'_, Result<Value, HandlePduError>> {
        async move {
            let pdu_ref = pdu.pdu_ref();
            let logger = self.logger.new(slog::o!("PduId" => pdu_ref.to_string()));

            let existing = self.pdus.get_persisted_pdu(&pdu_ref).await?;
            if let Some(existing) = &existing {
                if !existing.outlier || pdu.outlier {
                    slog::debug!(logger, "Ignoring duplicate PDU");
                    return Ok(json!({}));
                }
            }

            if !pdu.outlier && self.pdus.is_new(&pdu).await? {
                self.backfill_missing_ancestors(&pdu, &logger).await?;
            }

            self.pdus.persist_received(&pdu).await?;

            if pdu.is_state() {
                let fetcher = RemoteStateFetcher {
                    transport: self.transport.as_ref(),
                    destination: &pdu.origin,
                    logger: &logger,
                };
                if self.resolver.handle_new_state(&pdu, &fetcher).await? {
                    slog::info!(logger, "New current state for {}", pdu.pdu_type);
                    self.handler.on_state_change(&pdu).await;
                }
                if pdu.outlier {
                    return Ok(json!({}));
                }
            }

            let result = self.handler.on_receive_pdu(&pdu).await?;
            self.pdus.mark_as_processed(&pdu).await?;

            Ok(result)
        }
        .boxed()
    }

    /// Best effort. A failed fetch leaves a gap that pagination can fill later.
    ///
    /// Only the request is bounded by the backfill timeout. Processing a fetched ancestor runs to
    /// completion.
    async fn backfill_missing_ancestors(&self, pdu: &Pdu, logger: &slog::Logger) -> Result<(), HandlePduError> {
        // No min depth yet means we have never seen this context: don't go backwards.
        let min_depth = match self.pdus.min_depth(&pdu.context).await? {
            Some(min_depth) if pdu.depth > min_depth => min_depth,
            _ => return Ok(()),
        };
        slog::debug!(logger, "PDU at depth {} is ahead of min depth {}", pdu.depth, min_depth);

        for prev in &pdu.prev_pdus {
            if self.pdus.get_persisted_pdu(prev).await?.is_some() {
                continue;
            }

            slog::debug!(logger, "Requesting missing ancestor {}", prev);
            let fetch = self.fetch_pdu(&pdu.origin, &prev.origin, &prev.pdu_id);
            let fetched = tokio::time::timeout(self.backfill_fetch_timeout, fetch)
                .await
                .unwrap_or(Err(FetchError::Transport(TransportError::Timeout)));

            match fetched {
                Ok(Some(ancestor)) => {
                    if let Err(e) = self.handle_new_pdu(ancestor.with_outlier(true)).await {
                        slog::warn!(logger, "Failed to process ancestor {}: {}", prev, e);
                    }
                }
                Ok(None) => slog::warn!(logger, "{} does not have ancestor {}", pdu.origin, prev),
                Err(e) => slog::warn!(logger, "Failed to fetch ancestor {}: {}", prev, e),
            }
        }

        Ok(())
    }

    /// Fetches one PDU from `destination` and processes it. Returns the PDU, if `destination`
    /// had it.
    pub async fn get_pdu(
        &self,
        destination: &str,
        origin: &str,
        pdu_id: &str,
        outlier: bool,
    ) -> Result<Option<Pdu>, FetchError> {
        let pdu = match self.fetch_pdu(destination, origin, pdu_id).await? {
            Some(pdu) => pdu.with_outlier(outlier),
            None => return Ok(None),
        };
        self.handle_new_pdu(pdu.clone()).await?;

        Ok(Some(pdu))
    }

    async fn fetch_pdu(&self, destination: &str, origin: &str, pdu_id: &str) -> Result<Option<Pdu>, FetchError> {
        let envelope = self.transport.get_pdu(destination, origin, pdu_id).await?;

        match envelope.decode_pdus().into_iter().next() {
            Some(decoded) => Ok(Some(decoded?)),
            None => Ok(None),
        }
    }

    /// Fetches the current state of `context` from `destination`, processing every state PDU as
    /// an outlier.
    pub async fn get_state_for_context(&self, destination: &str, context: &str) -> Result<Vec<Pdu>, FetchError> {
        let envelope = self.transport.get_context_state(destination, context).await?;
        self.handle_envelope(envelope, true).await
    }

    /// Asks `destination` for history of `context` preceding our backward extremities.
    pub async fn paginate(&self, destination: &str, context: &str, limit: Option<usize>) -> Result<Vec<Pdu>, FetchError> {
        let extremities = self.pdus.back_extremities(context).await?;
        if extremities.is_empty() {
            slog::debug!(self.logger, "Nothing to paginate in {}", context);
            return Ok(Vec::new());
        }

        let limit = limit.unwrap_or(self.default_pagination_limit);
        let envelope = self
            .transport
            .paginate(destination, context, &extremities, limit)
            .await?;

        self.handle_envelope(envelope, false).await
    }

    async fn handle_envelope(&self, envelope: Transaction, outlier: bool) -> Result<Vec<Pdu>, FetchError> {
        let mut pdus = Vec::new();
        for decoded in envelope.decode_pdus() {
            let pdu = decoded?.with_outlier(outlier);
            self.handle_new_pdu(pdu.clone()).await?;
            pdus.push(pdu);
        }

        Ok(pdus)
    }

    fn wrap_pdus(&self, pdus: &[Pdu]) -> TransactionResponse {
        match Transaction::wrap_pdus(&self.server_name, pdus).and_then(|t| t.to_json()) {
            Ok(body) => TransactionResponse::new(200, body),
            Err(e) => {
                slog::error!(self.logger, "Failed to encode PDUs: {}", e);
                internal_error()
            }
        }
    }

    fn wrap_lookup(&self, lookup: Result<Vec<Pdu>, PersistenceError>) -> TransactionResponse {
        match lookup {
            Ok(pdus) => self.wrap_pdus(&pdus),
            Err(e) => {
                slog::error!(self.logger, "Failed to look up PDUs: {}", e);
                internal_error()
            }
        }
    }
}

fn internal_error() -> TransactionResponse {
    TransactionResponse::new(500, json!({ "error": "Internal server error" }))
}

#[async_trait::async_trait]
impl TransportRequestHandler for ReplicationLayer {
    async fn on_transaction(&self, transaction: Transaction) -> TransactionResponse {
        self.on_receive_transaction(transaction).await
    }

    async fn on_pdu_request(&self, origin: &str, pdu_id: &str) -> TransactionResponse {
        slog::debug!(self.logger, "PDU request for {}@{}", pdu_id, origin);
        let lookup: Result<Vec<Pdu>, _> = self
            .pdus
            .get_persisted_pdu(&PduRef::new(pdu_id, origin))
            .await
            .map(|pdu| pdu.into_iter().collect());

        self.wrap_lookup(lookup)
    }

    async fn on_context_state_request(&self, context: &str) -> TransactionResponse {
        slog::debug!(self.logger, "State request for {}", context);
        let lookup = self.pdus.current_state(context).await;

        self.wrap_lookup(lookup)
    }

    async fn on_paginate_request(&self, context: &str, versions: &[PduRef], limit: usize) -> TransactionResponse {
        slog::debug!(self.logger, "Paginate request for {} from {:?}", context, versions);
        let lookup = self.pdus.paginate(context, versions, limit).await;

        self.wrap_lookup(lookup)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendPduError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    StateResolution(#[from] StateResolutionError),
}

#[derive(Debug, thiserror::Error)]
pub enum HandlePduError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    StateResolution(#[from] StateResolutionError),
    #[error("Application rejected PDU: {0}")]
    Rejected(#[from] ReplicationHandlerError),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] PduDecodeError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Handle(#[from] HandlePduError),
}
