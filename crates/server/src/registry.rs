// Subdomain -> relay client routing

use crate::tenant::TenantHandle;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("subdomain '{0}' is already connected")]
    InUse(String),

    #[error("subdomain '{0}' is leased to another client")]
    Leased(String),
}

/// Routing table from subdomain to the tenant serving it
///
/// Implementations must be safe for concurrent use; every public request
/// resolves through here and every tunnel connect/disconnect writes to it.
pub trait RouteTable: Send + Sync {
    /// Activate a tenant under its subdomain
    ///
    /// Fails if the subdomain is active, or leased under a token other than
    /// the tenant's own.
    fn register(&self, tenant: Arc<TenantHandle>) -> Result<(), RouteError>;

    /// Remove the route only if it still belongs to `connection_id`, keeping
    /// the subdomain leased for `lease_for`
    fn unregister(&self, subdomain: &str, connection_id: &str, lease_for: Duration) -> bool;

    fn resolve(&self, subdomain: &str) -> Option<Arc<TenantHandle>>;

    /// Whether a client presenting `lease_token` could register `subdomain` now
    fn is_available(&self, subdomain: &str, lease_token: Option<&str>) -> bool;

    /// Drop leases that have run out, returning how many
    fn prune_expired(&self) -> usize;

    /// Number of active tenants
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct Lease {
    token: String,
    /// `None` while the owner is connected
    expires_at: Option<Instant>,
}

impl Lease {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
pub struct InMemoryRouteTable {
    routes: DashMap<String, Arc<TenantHandle>>,
    leases: DashMap<String, Lease>,
}

impl InMemoryRouteTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RouteTable for InMemoryRouteTable {
    fn register(&self, tenant: Arc<TenantHandle>) -> Result<(), RouteError> {
        let subdomain = tenant.subdomain.clone();
        let now = Instant::now();

        // lock order: lease shard, then route shard
        let lease = self.leases.entry(subdomain.clone());
        if let Entry::Occupied(existing) = &lease {
            let existing = existing.get();
            if existing.is_live(now) && existing.token != tenant.lease_token {
                return Err(RouteError::Leased(subdomain));
            }
        }

        match self.routes.entry(subdomain.clone()) {
            Entry::Occupied(_) => return Err(RouteError::InUse(subdomain)),
            Entry::Vacant(slot) => {
                slot.insert(tenant.clone());
            }
        }

        lease.insert(Lease {
            token: tenant.lease_token.clone(),
            expires_at: None,
        });
        tracing::debug!(subdomain = %subdomain, "Route registered");
        Ok(())
    }

    fn unregister(&self, subdomain: &str, connection_id: &str, lease_for: Duration) -> bool {
        let removed = self
            .routes
            .remove_if(subdomain, |_, tenant| tenant.connection_id == connection_id);

        let Some((_, tenant)) = removed else {
            return false;
        };

        if let Some(mut lease) = self.leases.get_mut(subdomain) {
            if lease.token == tenant.lease_token {
                lease.expires_at = Some(Instant::now() + lease_for);
            }
        }
        tracing::debug!(subdomain = %subdomain, "Route unregistered");
        true
    }

    fn resolve(&self, subdomain: &str) -> Option<Arc<TenantHandle>> {
        self.routes.get(subdomain).map(|entry| entry.value().clone())
    }

    fn is_available(&self, subdomain: &str, lease_token: Option<&str>) -> bool {
        if self.routes.contains_key(subdomain) {
            return false;
        }
        match self.leases.get(subdomain) {
            Some(lease) if lease.is_live(Instant::now()) => lease_token == Some(lease.token.as_str()),
            _ => true,
        }
    }

    fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.leases.len();
        self.leases.retain(|_, lease| lease.is_live(now));
        before.saturating_sub(self.leases.len())
    }

    fn len(&self) -> usize {
        self.routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn tenant(subdomain: &str, lease: &str) -> Arc<TenantHandle> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(TenantHandle::new(subdomain, lease, None, tx, 8, 8))
    }

    #[test]
    fn test_register_and_resolve() {
        let table = InMemoryRouteTable::new();
        let a = tenant("alpha", "lease-a");
        table.register(a.clone()).unwrap();

        let resolved = table.resolve("alpha").unwrap();
        assert_eq!(resolved.connection_id, a.connection_id);
        assert!(table.resolve("beta").is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_active_subdomain_cannot_be_taken() {
        let table = InMemoryRouteTable::new();
        table.register(tenant("alpha", "lease-a")).unwrap();

        assert_eq!(
            table.register(tenant("alpha", "lease-a")),
            Err(RouteError::InUse("alpha".to_string()))
        );
        assert!(!table.is_available("alpha", Some("lease-a")));
    }

    #[test]
    fn test_unregister_only_own_connection() {
        let table = InMemoryRouteTable::new();
        let a = tenant("alpha", "lease-a");
        table.register(a.clone()).unwrap();

        assert!(!table.unregister("alpha", "someone-else", Duration::from_secs(60)));
        assert!(table.resolve("alpha").is_some());

        assert!(table.unregister("alpha", &a.connection_id, Duration::from_secs(60)));
        assert!(table.resolve("alpha").is_none());
        assert!(!table.unregister("alpha", &a.connection_id, Duration::from_secs(60)));
    }

    #[test]
    fn test_lease_preserves_subdomain() {
        let table = InMemoryRouteTable::new();
        let a = tenant("alpha", "lease-a");
        table.register(a.clone()).unwrap();
        table.unregister("alpha", &a.connection_id, Duration::from_secs(60));

        assert!(!table.is_available("alpha", None));
        assert!(!table.is_available("alpha", Some("other")));
        assert!(table.is_available("alpha", Some("lease-a")));

        assert_eq!(
            table.register(tenant("alpha", "intruder")),
            Err(RouteError::Leased("alpha".to_string()))
        );
        table.register(tenant("alpha", "lease-a")).unwrap();
    }

    #[test]
    fn test_expired_lease_is_released() {
        let table = InMemoryRouteTable::new();
        let a = tenant("alpha", "lease-a");
        table.register(a.clone()).unwrap();
        table.unregister("alpha", &a.connection_id, Duration::ZERO);

        assert!(table.is_available("alpha", None));
        assert_eq!(table.prune_expired(), 1);
        table.register(tenant("alpha", "new-owner")).unwrap();
    }

    #[test]
    fn test_concurrent_churn_never_crosses_tenants() {
        let table = Arc::new(InMemoryRouteTable::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = table.clone();
                std::thread::spawn(move || {
                    let name = format!("tenant{}", i);
                    for _ in 0..200 {
                        let t = tenant(&name, &name);
                        table.register(t.clone()).unwrap();
                        let resolved = table.resolve(&name).unwrap();
                        assert_eq!(resolved.connection_id, t.connection_id);
                        assert_eq!(resolved.subdomain, name);
                        assert!(table.unregister(&name, &t.connection_id, Duration::from_secs(60)));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(table.is_empty());
    }
}
