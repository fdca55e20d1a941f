//! Process-wide tunnel registry.
//!
//! Maps active subdomains and allocated TCP ports to their tunnel sessions.
//! The registry holds lookup references only; session lifetime is owned by
//! the control-channel task, which unregisters on teardown.

use crate::allocator;
use burrow_core::{validate_subdomain, TunnelError, TunnelResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::session::TunnelSession;

pub struct TunnelRegistry {
    by_subdomain: DashMap<String, Arc<TunnelSession>>,
    by_port: DashMap<u16, Arc<TunnelSession>>,
    by_id: DashMap<String, Arc<TunnelSession>>,
    reserved: HashSet<String>,
}

impl TunnelRegistry {
    pub fn new(reserved: HashSet<String>) -> Self {
        Self {
            by_subdomain: DashMap::new(),
            by_port: DashMap::new(),
            by_id: DashMap::new(),
            reserved,
        }
    }

    /// Resolve the subdomain a new registration will use.
    ///
    /// A desired subdomain is validated and must be free; a new REGISTER for
    /// an already-owned subdomain fails, it never evicts the holder. With no
    /// desired subdomain a random friendly one is allocated.
    pub fn resolve_subdomain(&self, desired: Option<&str>) -> TunnelResult<String> {
        match desired {
            Some(raw) => {
                let subdomain = validate_subdomain(raw)?;
                if self.reserved.contains(&subdomain) {
                    return Err(TunnelError::ReservedSubdomain(subdomain));
                }
                if self.by_subdomain.contains_key(&subdomain) {
                    return Err(TunnelError::SubdomainTaken(subdomain));
                }
                Ok(subdomain)
            }
            None => Ok(allocator::random_subdomain(|candidate| {
                self.reserved.contains(candidate) || self.by_subdomain.contains_key(candidate)
            })),
        }
    }

    /// Insert a fully constructed session under its subdomain (and TCP port,
    /// if any). Fails without side effects if the subdomain was claimed in
    /// the window since [`resolve_subdomain`].
    pub fn insert(&self, session: Arc<TunnelSession>) -> TunnelResult<()> {
        match self.by_subdomain.entry(session.subdomain().to_string()) {
            Entry::Occupied(_) => {
                return Err(TunnelError::SubdomainTaken(session.subdomain().to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
            }
        }
        if let Some(port) = session.tcp_port() {
            self.by_port.insert(port, session.clone());
        }
        self.by_id
            .insert(session.tunnel_id().to_string(), session.clone());

        info!(
            tunnel = %session.tunnel_id(),
            subdomain = %session.subdomain(),
            protocol = %session.protocol(),
            tcp_port = ?session.tcp_port(),
            "tunnel registered"
        );
        Ok(())
    }

    /// O(1) lookup by subdomain.
    pub fn lookup(&self, subdomain: &str) -> Option<Arc<TunnelSession>> {
        self.by_subdomain.get(subdomain).map(|s| s.clone())
    }

    /// O(1) lookup by allocated public TCP port.
    pub fn lookup_tcp_port(&self, port: u16) -> Option<Arc<TunnelSession>> {
        self.by_port.get(&port).map(|s| s.clone())
    }

    /// Remove every mapping for `tunnel_id`. Idempotent; mappings taken over
    /// by a newer session are left untouched.
    pub fn unregister(&self, tunnel_id: &str) {
        let Some((_, session)) = self.by_id.remove(tunnel_id) else {
            return;
        };
        self.by_subdomain
            .remove_if(session.subdomain(), |_, s| s.tunnel_id() == tunnel_id);
        if let Some(port) = session.tcp_port() {
            self.by_port.remove_if(&port, |_, s| s.tunnel_id() == tunnel_id);
        }
        debug!(tunnel = %tunnel_id, subdomain = %session.subdomain(), "tunnel unregistered");
    }

    pub fn active_count(&self) -> usize {
        self.by_id.len()
    }

    /// All live sessions, for the health endpoint.
    pub fn sessions(&self) -> Vec<Arc<TunnelSession>> {
        self.by_id.iter().map(|e| e.value().clone()).collect()
    }
}
