mod api;
mod persistence;
mod queue;
mod replication;
mod state;
mod transport;
mod units;

pub use api::try_create_home_server;
pub use api::FederationOptions;
pub use api::HomeServer;
pub use api::HomeServerConfig;
pub use api::HomeServerCreationError;
pub use persistence::InMemoryPersistence;
pub use persistence::PersistenceError;
pub use persistence::PersistenceService;
pub use queue::DeliveryError;
pub use queue::DeliveryHandle;
pub use replication::FetchError;
pub use replication::HandlePduError;
pub use replication::ReplicationHandler;
pub use replication::ReplicationHandlerError;
pub use replication::ReplicationLayer;
pub use replication::SendPduError;
pub use replication::SentPdu;
pub use state::StateAncestorFetcher;
pub use state::StateResolutionError;
pub use transport::LoopbackNetwork;
pub use transport::LoopbackTransport;
pub use transport::Transport;
pub use transport::TransportError;
pub use transport::TransportRequestHandler;
pub use units::IdGenerator;
pub use units::NewPdu;
pub use units::NewStateFields;
pub use units::Pdu;
pub use units::PduDecodeError;
pub use units::PduRef;
pub use units::StateFields;
pub use units::StateKey;
pub use units::Transaction;
pub use units::TransactionDecodeError;
pub use units::TransactionResponse;

// `crate::{root_mod}` has no code of its own, only `mod` and `pub use` statements. No `mod` is
// `pub`; every exported type is re-exported individually.
