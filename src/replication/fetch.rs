use crate::state::StateAncestorFetcher;
use crate::transport::{Transport, TransportError};
use crate::units::{Pdu, PduRef};

/// Fetches missing state ancestors from the home server that sent us the PDU being resolved.
pub(super) struct RemoteStateFetcher<'a> {
    pub(super) transport: &'a dyn Transport,
    pub(super) destination: &'a str,
    pub(super) logger: &'a slog::Logger,
}

#[async_trait::async_trait]
impl<'a> StateAncestorFetcher for RemoteStateFetcher<'a> {
    async fn fetch_state_ancestor(&self, pdu_ref: &PduRef) -> Result<Option<Pdu>, TransportError> {
        let envelope = self
            .transport
            .get_pdu(self.destination, &pdu_ref.origin, &pdu_ref.pdu_id)
            .await?;

        match envelope.decode_pdus().into_iter().next() {
            Some(Ok(pdu)) => Ok(Some(pdu)),
            Some(Err(e)) => {
                slog::warn!(self.logger, "{} sent an undecodable copy of {}: {}", self.destination, pdu_ref, e);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}
