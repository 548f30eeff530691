use crate::units::{PduRef, Transaction, TransactionDecodeError, TransactionResponse};

/// Transport is the outbound half of the channel between home servers. It is treated as an
/// opaque request/response channel; retries and backoff are its own business.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends `transaction` to its destination and returns the remote's `(code, body)`.
    async fn send_transaction(&self, transaction: &Transaction) -> Result<TransactionResponse, TransportError>;

    /// Asks `destination` for the PDU `(pdu_id, origin)`. An unknown PDU comes back as an empty
    /// `pdus` list.
    async fn get_pdu(&self, destination: &str, origin: &str, pdu_id: &str) -> Result<Transaction, TransportError>;

    /// Asks `destination` for its current state PDUs of `context`.
    async fn get_context_state(&self, destination: &str, context: &str) -> Result<Transaction, TransportError>;

    /// Asks `destination` for up to `limit` PDUs of `context` that precede (and include)
    /// `versions`.
    async fn paginate(
        &self,
        destination: &str,
        context: &str,
        versions: &[PduRef],
        limit: usize,
    ) -> Result<Transaction, TransportError>;
}

/// TransportRequestHandler is the inbound half: the transport dispatches requests from remote
/// home servers to it. Every answer is a `(code, body)` pair.
#[async_trait::async_trait]
pub trait TransportRequestHandler: Send + Sync + 'static {
    async fn on_transaction(&self, transaction: Transaction) -> TransactionResponse;

    async fn on_pdu_request(&self, origin: &str, pdu_id: &str) -> TransactionResponse;

    async fn on_context_state_request(&self, context: &str) -> TransactionResponse;

    async fn on_paginate_request(&self, context: &str, versions: &[PduRef], limit: usize) -> TransactionResponse;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Destination {0} is unreachable")]
    Unreachable(String),
    #[error("Destination responded with status {code}: {body}")]
    Status { code: u16, body: serde_json::Value },
    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Malformed response payload: {0}")]
    Malformed(#[from] TransactionDecodeError),
    #[error("Request timed out")]
    Timeout,
}
