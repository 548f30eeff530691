//! The orchestrator between the transport, persistence, state resolution and the application.
mod fetch;
mod handler;
mod layer;

pub use handler::ReplicationHandler;
pub use handler::ReplicationHandlerError;
pub use layer::FetchError;
pub use layer::HandlePduError;
pub use layer::ReplicationLayer;
pub use layer::SendPduError;
pub use layer::SentPdu;

pub(crate) use layer::create;
pub(crate) use layer::ReplicationConfig;
