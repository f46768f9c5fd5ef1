//! Shared server state — the process-wide singletons every connection's handlers are
//! built around.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AnonymousVerifier, PrincipalVerifier};
use crate::components;
use crate::config::Config;
use crate::connection::ConnectionRegistry;
use crate::dispatcher::Dispatcher;
use crate::events::EventBus;
use crate::instance::InstanceStore;
use crate::registry::ComponentRegistry;
use crate::upload::UploadAssembler;

/// Everything a connection's WebSocket task needs, handed to every
/// axum handler via `State<Arc<AppState>>`.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<ComponentRegistry>,
    pub instances: Arc<InstanceStore>,
    pub connections: Arc<ConnectionRegistry>,
    pub events: Arc<EventBus>,
    pub uploads: Arc<UploadAssembler>,
    pub dispatcher: Arc<Dispatcher>,
    pub verifier: Arc<dyn PrincipalVerifier>,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        let registry = Arc::new(ComponentRegistry::new());
        let instances = Arc::new(InstanceStore::new());
        let connections = Arc::new(ConnectionRegistry::new(
            config.send_queue_frames,
            config.send_queue_bytes,
            config.rate_limit_rps,
            config.rate_limit_burst,
        ));
        let events = Arc::new(EventBus::new(connections.clone()));
        let uploads = Arc::new(UploadAssembler::new(
            config.work_dir.clone(),
            config.max_upload_bytes,
            config.chunk_bytes as u32,
        ));
        let dispatcher = Arc::new(Dispatcher {
            registry: registry.clone(),
            instances: instances.clone(),
            connections: connections.clone(),
            events: events.clone(),
            uploads: uploads.clone(),
            handler_timeout: Duration::from_millis(config.handler_timeout_ms),
            max_mailbox: config.max_mailbox,
        });

        components::register_all(&registry, &instances).expect("demo component registration should never conflict");

        Arc::new(Self {
            config,
            registry,
            instances,
            connections,
            events,
            uploads,
            dispatcher,
            verifier: Arc::new(AnonymousVerifier),
        })
    }
}
