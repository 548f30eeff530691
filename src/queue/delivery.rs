use futures::future;
use tokio::sync::oneshot;

/// Resolves a single waiter once its PDU's transaction to one destination has a response.
#[derive(Debug)]
pub(super) struct Callback(oneshot::Sender<Result<(), DeliveryError>>);

impl Callback {
    pub(super) fn new() -> (Self, oneshot::Receiver<Result<(), DeliveryError>>) {
        let (tx, rx) = oneshot::channel();
        (Callback(tx), rx)
    }

    pub(super) fn send(self, result: Result<(), DeliveryError>) {
        // The waiter may have stopped caring.
        let _ = self.0.send(result);
    }
}

/// DeliveryHandle lets the sender of a PDU wait for it to be delivered to each of its
/// destinations. Dropping it doesn't affect delivery.
#[derive(Debug)]
pub struct DeliveryHandle {
    pending: Vec<(String, oneshot::Receiver<Result<(), DeliveryError>>)>,
}

impl DeliveryHandle {
    pub(super) fn new(pending: Vec<(String, oneshot::Receiver<Result<(), DeliveryError>>)>) -> Self {
        DeliveryHandle { pending }
    }

    /// A handle for a PDU with no remote destinations.
    pub fn nothing_to_deliver() -> Self {
        DeliveryHandle { pending: Vec::new() }
    }

    pub fn destinations(&self) -> Vec<&str> {
        self.pending.iter().map(|(d, _)| d.as_str()).collect()
    }

    /// Waits for every destination, and returns each outcome.
    pub async fn outcomes(self) -> Vec<(String, Result<(), DeliveryError>)> {
        let waits = self.pending.into_iter().map(|(destination, rx)| async move {
            let result = rx.await.unwrap_or(Err(DeliveryError::QueueStopped));
            (destination, result)
        });

        future::join_all(waits).await
    }

    /// Waits for every destination. Fails with the first failure in destination order.
    pub async fn delivered(self) -> Result<(), DeliveryError> {
        self.outcomes()
            .await
            .into_iter()
            .map(|(_, result)| result)
            .collect::<Result<Vec<()>, _>>()
            .map(|_| ())
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    #[error("Destination rejected the transaction with status {0}")]
    Rejected(u16),
    #[error("Failed to send transaction: {0}")]
    SendFailed(String),
    #[error("Transaction queue stopped before the PDU was sent")]
    QueueStopped,
}
