use crate::persistence::TransactionActions;
use crate::queue::delivery::{Callback, DeliveryError, DeliveryHandle};
use crate::transport::Transport;
use crate::units::{IdGenerator, Pdu, Transaction, TransactionResponse};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) fn create(
    buffer_size: usize,
    server_name: String,
    transport: Arc<dyn Transport>,
    transactions: TransactionActions,
    ids: Arc<IdGenerator>,
    logger: slog::Logger,
) -> (TransactionQueue, QueueActor) {
    let (tx, rx) = mpsc::channel(buffer_size);
    let (finished_tx, finished_rx) = mpsc::unbounded_channel();

    let queue = TransactionQueue {
        server_name: server_name.clone(),
        sender: tx,
    };
    let actor = QueueActor {
        receiver: rx,
        finished_tx,
        finished_rx,
        destinations: HashMap::new(),
        sender: Arc::new(BatchSender {
            server_name,
            transport,
            transactions,
            ids,
        }),
        logger,
    };

    (queue, actor)
}

#[derive(Debug)]
enum Event {
    EnqueuePdu(QueuedPdu, Vec<(String, Callback)>),
}

#[derive(Clone, Debug)]
struct QueuedPdu {
    pdu: Pdu,
    order: u64,
}

/// TransactionQueue batches outgoing PDUs into transactions, per destination, with at most one
/// transaction in flight to any destination.
#[derive(Clone)]
pub(crate) struct TransactionQueue {
    server_name: String,
    sender: mpsc::Sender<Event>,
}

impl TransactionQueue {
    /// Queues `pdu` for every destination it lists other than ourselves. `order` decides the
    /// position of the PDU within a transaction: lower goes first.
    pub(crate) async fn enqueue_pdu(&self, pdu: Pdu, order: u64) -> DeliveryHandle {
        let mut destinations: Vec<String> = pdu
            .destinations
            .iter()
            .filter(|d| **d != self.server_name)
            .cloned()
            .collect();
        destinations.sort();
        destinations.dedup();

        if destinations.is_empty() {
            return DeliveryHandle::nothing_to_deliver();
        }

        let mut callbacks = Vec::with_capacity(destinations.len());
        let mut pending = Vec::with_capacity(destinations.len());
        for destination in destinations {
            let (callback, rx) = Callback::new();
            callbacks.push((destination.clone(), callback));
            pending.push((destination, rx));
        }

        self.sender
            .send(Event::EnqueuePdu(QueuedPdu { pdu, order }, callbacks))
            .await
            .expect("Transaction queue actor is dead. WTF!!");

        DeliveryHandle::new(pending)
    }
}

#[derive(Default)]
struct DestinationQueue {
    pending: Vec<(QueuedPdu, Callback)>,
    sending: bool,
}

/// QueueActor owns every destination's pending list and sending flag.
pub(crate) struct QueueActor {
    receiver: mpsc::Receiver<Event>,
    finished_tx: mpsc::UnboundedSender<String>,
    finished_rx: mpsc::UnboundedReceiver<String>,
    destinations: HashMap<String, DestinationQueue>,
    sender: Arc<BatchSender>,
    logger: slog::Logger,
}

impl QueueActor {
    pub(crate) async fn run_event_loop(mut self) {
        loop {
            tokio::select! {
                event = self.receiver.recv() => match event {
                    Some(event) => self.handle_event(event),
                    // Batches already in flight still resolve their waiters.
                    None => break,
                },
                Some(destination) = self.finished_rx.recv() => {
                    self.handle_send_finished(destination);
                }
            }
        }
        slog::debug!(self.logger, "Transaction queue stopped");
    }

    // This must NOT be async. Sends are spawned and report back through `finished_tx`.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::EnqueuePdu(queued, callbacks) => {
                for (destination, callback) in callbacks {
                    let queue = self.destinations.entry(destination.clone()).or_default();
                    queue.pending.push((queued.clone(), callback));
                    if !queue.sending {
                        self.start_sending(destination);
                    }
                }
            }
        }
    }

    fn handle_send_finished(&mut self, destination: String) {
        let has_more = match self.destinations.get_mut(&destination) {
            Some(queue) => {
                queue.sending = false;
                !queue.pending.is_empty()
            }
            None => false,
        };

        if has_more {
            self.start_sending(destination);
        } else {
            self.destinations.remove(&destination);
        }
    }

    /// Idle -> Sending: drains everything pending for `destination` into one batch.
    fn start_sending(&mut self, destination: String) {
        let queue = match self.destinations.get_mut(&destination) {
            Some(queue) => queue,
            None => return,
        };

        let mut batch = std::mem::take(&mut queue.pending);
        batch.sort_by_key(|(queued, _)| queued.order);
        queue.sending = true;

        let sender = self.sender.clone();
        let finished_tx = self.finished_tx.clone();
        let logger = self.logger.new(slog::o!("Destination" => destination.clone()));
        tokio::spawn(async move {
            sender.send_batch(&destination, batch, &logger).await;
            // Actor only goes away once nobody can enqueue anymore.
            let _ = finished_tx.send(destination);
        });
    }
}

struct BatchSender {
    server_name: String,
    transport: Arc<dyn Transport>,
    transactions: TransactionActions,
    ids: Arc<IdGenerator>,
}

impl BatchSender {
    async fn send_batch(&self, destination: &str, batch: Vec<(QueuedPdu, Callback)>, logger: &slog::Logger) {
        let (pdus, callbacks): (Vec<Pdu>, Vec<Callback>) =
            batch.into_iter().map(|(queued, callback)| (queued.pdu, callback)).unzip();

        let result = match self.deliver(destination, pdus, logger).await {
            Ok(response) if response.is_success() => Ok(()),
            Ok(response) => {
                slog::warn!(logger, "Transaction rejected with status {}", response.code);
                Err(DeliveryError::Rejected(response.code))
            }
            Err(e) => {
                slog::warn!(logger, "Failed to deliver transaction: {}", e);
                Err(e)
            }
        };

        for callback in callbacks {
            callback.send(result.clone());
        }
    }

    async fn deliver(
        &self,
        destination: &str,
        mut pdus: Vec<Pdu>,
        logger: &slog::Logger,
    ) -> Result<TransactionResponse, DeliveryError> {
        let mut transaction = Transaction::create_new(&self.server_name, destination, &mut pdus, &self.ids)
            .map_err(|e| DeliveryError::SendFailed(e.to_string()))?;
        let logger = logger.new(slog::o!("TxnId" => transaction.transaction_id.clone().unwrap_or_default()));

        self.transactions
            .prepare_to_send(&mut transaction)
            .await
            .map_err(|e| DeliveryError::SendFailed(e.to_string()))?;

        slog::debug!(logger, "Sending transaction with {} PDUs", transaction.pdus.len());
        let response = self
            .transport
            .send_transaction(&transaction)
            .await
            .map_err(|e| DeliveryError::SendFailed(e.to_string()))?;
        slog::info!(logger, "Transaction got response {}", response.code);

        self.transactions
            .delivered(&transaction, &response)
            .await
            .map_err(|e| DeliveryError::SendFailed(e.to_string()))?;

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use crate::transport::TransportError;
    use crate::units::{NewPdu, PduRef};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    /// Replies with scripted status codes (200 once the script runs out). Destinations with a gate
    /// block until the test hands out a permit per transaction.
    #[derive(Default)]
    struct ScriptedTransport {
        gates: HashMap<String, Arc<Semaphore>>,
        script: Mutex<VecDeque<Result<u16, TransportError>>>,
        sent: Mutex<Vec<Transaction>>,
    }

    impl ScriptedTransport {
        fn sent_orders(&self, destination: &str) -> Vec<Vec<i64>> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.destination.as_deref() == Some(destination))
                .map(|t| t.pdus.iter().map(|p| p["content"]["order"].as_i64().unwrap()).collect())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        async fn send_transaction(&self, transaction: &Transaction) -> Result<TransactionResponse, TransportError> {
            let destination = transaction.destination.clone().unwrap();
            if let Some(gate) = self.gates.get(&destination) {
                gate.acquire().await.unwrap().forget();
            }
            self.sent.lock().unwrap().push(transaction.clone());

            let scripted = self.script.lock().unwrap().pop_front().unwrap_or(Ok(200));
            scripted.map(|code| TransactionResponse::new(code, json!([])))
        }

        async fn get_pdu(&self, destination: &str, _: &str, _: &str) -> Result<Transaction, TransportError> {
            Err(TransportError::Unreachable(destination.into()))
        }

        async fn get_context_state(&self, destination: &str, _: &str) -> Result<Transaction, TransportError> {
            Err(TransportError::Unreachable(destination.into()))
        }

        async fn paginate(&self, destination: &str, _: &str, _: &[PduRef], _: usize) -> Result<Transaction, TransportError> {
            Err(TransportError::Unreachable(destination.into()))
        }
    }

    fn start(transport: Arc<ScriptedTransport>) -> TransactionQueue {
        let db = Arc::new(InMemoryPersistence::new());
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let (queue, actor) = create(
            16,
            "a".into(),
            transport,
            TransactionActions::new(db),
            Arc::new(IdGenerator::with_nonce(1)),
            logger,
        );
        tokio::spawn(actor.run_event_loop());
        queue
    }

    fn pdu(order: u64, destinations: &[&str]) -> Pdu {
        let ids = IdGenerator::with_nonce(order);
        Pdu::create_new(
            "a",
            NewPdu {
                context: "!r".into(),
                pdu_type: "m.text".into(),
                content: json!({ "order": order }),
                destinations: destinations.iter().map(|d| d.to_string()).collect(),
                ..NewPdu::default()
            },
            &ids,
        )
    }

    fn gated(destination: &str) -> (Arc<ScriptedTransport>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let mut transport = ScriptedTransport::default();
        transport.gates.insert(destination.into(), gate.clone());
        (Arc::new(transport), gate)
    }

    #[tokio::test]
    async fn pdus_are_sent_sorted_by_order() {
        let (transport, gate) = gated("x");
        let queue = start(transport.clone());

        let in_flight = queue.enqueue_pdu(pdu(0, &["x"]), 0).await;
        let handles = vec![
            queue.enqueue_pdu(pdu(3, &["x"]), 3).await,
            queue.enqueue_pdu(pdu(1, &["x"]), 1).await,
            queue.enqueue_pdu(pdu(2, &["x"]), 2).await,
        ];

        gate.add_permits(2);
        in_flight.delivered().await.unwrap();
        for handle in handles {
            handle.delivered().await.unwrap();
        }

        assert_eq!(transport.sent_orders("x"), vec![vec![0], vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn pdus_queued_while_in_flight_share_one_transaction() {
        let (transport, gate) = gated("x");
        let queue = start(transport.clone());

        let in_flight = queue.enqueue_pdu(pdu(9, &["x"]), 9).await;
        let p1 = queue.enqueue_pdu(pdu(10, &["x"]), 10).await;
        let p2 = queue.enqueue_pdu(pdu(11, &["x"]), 11).await;

        gate.add_permits(1);
        in_flight.delivered().await.unwrap();
        assert_eq!(transport.sent_orders("x"), vec![vec![9]]);

        gate.add_permits(1);
        p1.delivered().await.unwrap();
        p2.delivered().await.unwrap();
        assert_eq!(transport.sent_orders("x"), vec![vec![9], vec![10, 11]]);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[1].previous_ids, vec![sent[0].transaction_id.clone().unwrap()]);
    }

    #[tokio::test]
    async fn failures_reach_every_waiter_and_the_next_enqueue_retries() {
        let transport = Arc::new(ScriptedTransport::default());
        transport
            .script
            .lock()
            .unwrap()
            .extend(vec![Err(TransportError::Unreachable("x".into())), Ok(500)]);
        let queue = start(transport.clone());

        let failed = queue.enqueue_pdu(pdu(1, &["x"]), 1).await;
        assert!(matches!(failed.delivered().await, Err(DeliveryError::SendFailed(_))));

        let rejected = queue.enqueue_pdu(pdu(2, &["x"]), 2).await;
        assert_eq!(rejected.delivered().await, Err(DeliveryError::Rejected(500)));

        let delivered = queue.enqueue_pdu(pdu(3, &["x"]), 3).await;
        assert_eq!(delivered.delivered().await, Ok(()));
        assert_eq!(transport.sent_orders("x"), vec![vec![1], vec![2], vec![3]]);
    }

    #[tokio::test]
    async fn destinations_proceed_independently() {
        let (transport, gate) = gated("slow");
        let queue = start(transport.clone());

        let handle = queue.enqueue_pdu(pdu(1, &["slow", "fast", "a"]), 1).await;
        assert_eq!(handle.destinations(), vec!["fast", "slow"]);

        let fast = queue.enqueue_pdu(pdu(2, &["fast"]), 2).await;
        fast.delivered().await.unwrap();
        assert!(transport.sent_orders("slow").is_empty());

        gate.add_permits(1);
        let outcomes = handle.outcomes().await;
        assert!(outcomes.iter().all(|(_, result)| result.is_ok()));
    }

    #[tokio::test]
    async fn pdus_only_for_ourselves_deliver_nothing() {
        let queue = start(Arc::new(ScriptedTransport::default()));
        let handle = queue.enqueue_pdu(pdu(1, &["a"]), 1).await;

        assert!(handle.destinations().is_empty());
        assert_eq!(handle.delivered().await, Ok(()));
    }
}
