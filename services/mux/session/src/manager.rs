//! Parent connection manager.

use crate::endpoint::EndpointHandler;
use crate::error::ConnectionError;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Notified when an endpoint reaches TERMINATED
pub trait EndpointListener: Send + Sync {
    /// Endpoint `handler_id` terminated because of `error`
    fn on_endpoint_terminated(&self, handler_id: u64, error: &ConnectionError);
}

/// Registry of live endpoints keyed by handler ID
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: DashMap<u64, Arc<EndpointHandler>>,
}

impl EndpointRegistry {
    /// Empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track `endpoint` until it terminates
    pub fn register(&self, endpoint: Arc<EndpointHandler>) {
        if endpoint.state().is_terminating() {
            return;
        }
        debug!("Registered endpoint {:016x}", endpoint.handler_id());
        self.endpoints.insert(endpoint.handler_id(), endpoint);
    }

    /// Endpoint by handler ID
    pub fn get(&self, handler_id: u64) -> Option<Arc<EndpointHandler>> {
        self.endpoints.get(&handler_id).map(|e| e.value().clone())
    }

    /// All live endpoints
    pub fn endpoints(&self) -> Vec<Arc<EndpointHandler>> {
        self.endpoints.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of live endpoints
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether no endpoint is live
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Shut down every endpoint
    pub fn shutdown_all(&self, force: bool) {
        let endpoints = self.endpoints();
        info!("Shutting down {} endpoints (force: {})", endpoints.len(), force);
        for endpoint in endpoints {
            endpoint.shutdown(force);
        }
    }
}

impl EndpointListener for EndpointRegistry {
    fn on_endpoint_terminated(&self, handler_id: u64, error: &ConnectionError) {
        if self.endpoints.remove(&handler_id).is_some() {
            debug!("Endpoint {:016x} left registry: {}", handler_id, error);
        }
    }
}
