//! Storage for PDUs, the causal DAG bookkeeping around them, and the transaction log.
mod actions;
mod in_memory;
mod service;

pub use in_memory::InMemoryPersistence;
pub use service::PersistenceError;
pub use service::PersistenceService;

pub(crate) use actions::PduActions;
pub(crate) use actions::TransactionActions;
