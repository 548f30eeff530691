//! This mod is meant to hold most of the code for the library's client-facing API.
mod options;
mod wiring;

pub use options::FederationOptions;
pub use wiring::try_create_home_server;
pub use wiring::HomeServer;
pub use wiring::HomeServerConfig;
pub use wiring::HomeServerCreationError;
