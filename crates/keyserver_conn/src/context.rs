use std::sync::Arc;

use reqwest::Client;

use crate::{
    config::ConnectionConfig,
    endpoints::{EndpointValidators, PermissiveValidators},
    socket::SocketRegistry,
    store::StateStore,
};

pub struct ConnectionContext {
    pub config: Arc<ConnectionConfig>,
    pub store: Arc<dyn StateStore>,
    pub http: Client,
    pub sockets: Arc<SocketRegistry>,
    pub validators: Arc<dyn EndpointValidators>,
}

impl ConnectionContext {
    pub fn new(config: ConnectionConfig, store: Arc<dyn StateStore>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            http: Client::new(),
            sockets: Arc::new(SocketRegistry::new()),
            validators: Arc::new(PermissiveValidators),
        }
    }

    pub fn with_validators(mut self, validators: Arc<dyn EndpointValidators>) -> Self {
        self.validators = validators;
        self
    }

    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }
}
