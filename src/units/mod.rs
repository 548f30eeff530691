//! The protocol units exchanged between home servers, and their JSON wire form.
mod ids;
mod pdu;
mod transaction;

pub use ids::IdGenerator;
pub use pdu::NewPdu;
pub use pdu::NewStateFields;
pub use pdu::Pdu;
pub use pdu::PduDecodeError;
pub use pdu::PduRef;
pub use pdu::StateFields;
pub use pdu::StateKey;
pub use transaction::Transaction;
pub use transaction::TransactionDecodeError;
pub use transaction::TransactionResponse;

pub(crate) use ids::now_millis;
