//! Shared broker state, cloned into every handler.

use std::sync::Arc;

use crate::config::BrokerConfig;
use crate::hooks::{Authorizer, RequestLogSink};
use crate::listener::TcpListenerManager;
use crate::registry::TunnelRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BrokerConfig>,
    pub registry: Arc<TunnelRegistry>,
    pub tcp: Arc<TcpListenerManager>,
    pub authorizer: Arc<Authorizer>,
    pub request_log: RequestLogSink,
}

impl AppState {
    pub fn new(config: BrokerConfig) -> Self {
        let registry = Arc::new(TunnelRegistry::new(config.reserved_subdomains.clone()));
        let tcp = Arc::new(TcpListenerManager::new(
            config.tcp_port_min,
            config.tcp_port_max,
        ));
        let authorizer = Arc::new(Authorizer::from_config(config.authorizer_url.as_deref()));
        Self {
            config: Arc::new(config),
            registry,
            tcp,
            authorizer,
            request_log: RequestLogSink::Tracing,
        }
    }
}
