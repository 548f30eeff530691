//! Per-destination batching of outgoing PDUs into transactions.
mod delivery;
mod transaction_queue;

pub use delivery::DeliveryError;
pub use delivery::DeliveryHandle;

pub(crate) use transaction_queue::create;
pub(crate) use transaction_queue::QueueActor;
pub(crate) use transaction_queue::TransactionQueue;
