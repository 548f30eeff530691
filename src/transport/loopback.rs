use crate::transport::api::{Transport, TransportError, TransportRequestHandler};
use crate::units::{PduRef, Transaction, TransactionResponse};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// LoopbackNetwork routes requests between home servers living in the same process, by server
/// name. Every payload is encoded to JSON bytes and decoded again on the other side, the same way
/// a real wire would treat it.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn TransportRequestHandler>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `server_name` reachable. Replaces any handler previously registered under that name.
    pub fn register(&self, server_name: impl Into<String>, handler: Arc<dyn TransportRequestHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|poison| poison.into_inner());
        handlers.insert(server_name.into(), handler);
    }

    /// Makes `server_name` unreachable until it is registered again.
    pub fn unregister(&self, server_name: &str) {
        let mut handlers = self.handlers.write().unwrap_or_else(|poison| poison.into_inner());
        handlers.remove(server_name);
    }

    /// A transport that sends requests from `server_name` into this network.
    pub fn transport_for(&self, server_name: impl Into<String>) -> LoopbackTransport {
        LoopbackTransport {
            local_server_name: server_name.into(),
            network: self.clone(),
        }
    }

    fn handler(&self, destination: &str) -> Result<Arc<dyn TransportRequestHandler>, TransportError> {
        let handlers = self.handlers.read().unwrap_or_else(|poison| poison.into_inner());
        handlers
            .get(destination)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(destination.to_string()))
    }
}

pub struct LoopbackTransport {
    local_server_name: String,
    network: LoopbackNetwork,
}

impl LoopbackTransport {
    pub fn local_server_name(&self) -> &str {
        &self.local_server_name
    }

    /// Takes a response across the wire, and turns it into a PDU envelope.
    fn into_envelope(response: TransactionResponse) -> Result<Transaction, TransportError> {
        let response = cross_wire(response)?;
        if !response.is_success() {
            return Err(TransportError::Status {
                code: response.code,
                body: response.body,
            });
        }

        Ok(Transaction::from_json(response.body)?)
    }
}

fn cross_wire(response: TransactionResponse) -> Result<TransactionResponse, TransportError> {
    let bytes = Bytes::from(serde_json::to_vec(&response.body)?);
    let body: Value = serde_json::from_slice(&bytes)?;

    Ok(TransactionResponse::new(response.code, body))
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn send_transaction(&self, transaction: &Transaction) -> Result<TransactionResponse, TransportError> {
        let destination = transaction.destination.as_deref().unwrap_or_default();
        let handler = self.network.handler(destination)?;

        let bytes = transaction.to_bytes()?;
        let response = match Transaction::from_bytes(&bytes) {
            Ok(received) => handler.on_transaction(received).await,
            Err(e) => TransactionResponse::new(400, serde_json::json!({ "error": e.to_string() })),
        };

        cross_wire(response)
    }

    async fn get_pdu(&self, destination: &str, origin: &str, pdu_id: &str) -> Result<Transaction, TransportError> {
        let handler = self.network.handler(destination)?;
        let response = handler.on_pdu_request(origin, pdu_id).await;

        Self::into_envelope(response)
    }

    async fn get_context_state(&self, destination: &str, context: &str) -> Result<Transaction, TransportError> {
        let handler = self.network.handler(destination)?;
        let response = handler.on_context_state_request(context).await;

        Self::into_envelope(response)
    }

    async fn paginate(
        &self,
        destination: &str,
        context: &str,
        versions: &[PduRef],
        limit: usize,
    ) -> Result<Transaction, TransportError> {
        let handler = self.network.handler(destination)?;
        let response = handler.on_paginate_request(context, versions, limit).await;

        Self::into_envelope(response)
    }
}
