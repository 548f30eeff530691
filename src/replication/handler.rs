use crate::units::Pdu;
use serde_json::Value;

/// ReplicationHandler is the application sitting on top of the replication layer.
#[async_trait::async_trait]
pub trait ReplicationHandler: Send + Sync + 'static {
    /// Called for every accepted PDU: non-state PDUs once persisted, state PDUs once state
    /// resolution has run. State PDUs that are outliers are never passed here.
    async fn on_receive_pdu(&self, pdu: &Pdu) -> Result<Value, ReplicationHandlerError>;

    /// Called when state resolution made `pdu` the current state for its key.
    async fn on_state_change(&self, pdu: &Pdu);
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ReplicationHandlerError(pub String);
