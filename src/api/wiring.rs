use crate::api::options::FederationOptionsValidated;
use crate::persistence::PersistenceService;
use crate::replication::{self, ReplicationConfig, ReplicationHandler, ReplicationLayer};
use crate::transport::{Transport, TransportRequestHandler};
use crate::units::IdGenerator;
use crate::FederationOptions;
use std::convert::TryFrom;
use std::sync::Arc;

pub struct HomeServerConfig {
    pub server_name: String,
    pub info_logger: slog::Logger,
    pub options: FederationOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum HomeServerCreationError {
    #[error("Illegal options for configuring home server: {0}")]
    IllegalOptions(String),
    #[error("Server name must be non-empty and must not contain '@'")]
    IllegalServerName,
}

/// HomeServer is one federated participant: a replication layer plus its running transaction
/// queue.
pub struct HomeServer {
    replication: Arc<ReplicationLayer>,
}

impl HomeServer {
    pub fn server_name(&self) -> &str {
        self.replication.server_name()
    }

    pub fn replication(&self) -> &ReplicationLayer {
        &self.replication
    }

    /// The handler the transport should route inbound requests for this server to.
    pub fn request_handler(&self) -> Arc<dyn TransportRequestHandler> {
        self.replication.clone()
    }
}

/// Creates a home server and spawns its transaction queue actor onto the current tokio runtime.
pub async fn try_create_home_server(
    config: HomeServerConfig,
    persistence: Arc<dyn PersistenceService>,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn ReplicationHandler>,
) -> Result<HomeServer, HomeServerCreationError> {
    if config.server_name.is_empty() || config.server_name.contains('@') {
        return Err(HomeServerCreationError::IllegalServerName);
    }

    let options = FederationOptionsValidated::try_from(config.options)
        .map_err(|e| HomeServerCreationError::IllegalOptions(e.to_string()))?;

    let (replication, queue_actor) = replication::create(ReplicationConfig {
        server_name: config.server_name,
        persistence,
        transport,
        handler,
        ids: Arc::new(IdGenerator::new()),
        state_fetch_timeout: options.state_fetch_timeout,
        backfill_fetch_timeout: options.backfill_fetch_timeout,
        queue_buffer_size: options.queue_buffer_size,
        max_state_walk_hops: options.max_state_walk_hops,
        default_pagination_limit: options.default_pagination_limit,
        logger: config.info_logger,
    });
    tokio::spawn(queue_actor.run_event_loop());

    Ok(HomeServer { replication })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use crate::replication::ReplicationHandlerError;
    use crate::transport::LoopbackNetwork;
    use crate::units::Pdu;
    use serde_json::{json, Value};
    use tokio::time::Duration;

    struct NoopHandler;

    #[async_trait::async_trait]
    impl ReplicationHandler for NoopHandler {
        async fn on_receive_pdu(&self, _: &Pdu) -> Result<Value, ReplicationHandlerError> {
            Ok(json!({}))
        }

        async fn on_state_change(&self, _: &Pdu) {}
    }

    async fn create(server_name: &str, options: FederationOptions) -> Result<HomeServer, HomeServerCreationError> {
        let network = LoopbackNetwork::new();
        try_create_home_server(
            HomeServerConfig {
                server_name: server_name.to_string(),
                info_logger: slog::Logger::root(slog::Discard, slog::o!()),
                options,
            },
            Arc::new(InMemoryPersistence::new()),
            Arc::new(network.transport_for(server_name)),
            Arc::new(NoopHandler),
        )
        .await
    }

    #[tokio::test]
    async fn creates_with_default_options() {
        let server = create("hs1", FederationOptions::default()).await.unwrap();
        assert_eq!(server.server_name(), "hs1");
    }

    #[tokio::test]
    async fn rejects_bad_server_names() {
        assert!(matches!(
            create("", FederationOptions::default()).await,
            Err(HomeServerCreationError::IllegalServerName)
        ));
        assert!(matches!(
            create("a@b", FederationOptions::default()).await,
            Err(HomeServerCreationError::IllegalServerName)
        ));
    }

    #[tokio::test]
    async fn rejects_bad_options() {
        let options = FederationOptions {
            state_fetch_timeout: Some(Duration::from_millis(0)),
            ..FederationOptions::default()
        };

        assert!(matches!(
            create("hs1", options).await,
            Err(HomeServerCreationError::IllegalOptions(_))
        ));
    }
}
