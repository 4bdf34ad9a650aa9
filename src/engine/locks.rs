use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

/// Serializes recalculations whose scopes overlap.
///
/// Three levels, always taken in this order: a global lock, one lock per tenant,
/// one mutex per staff member.
/// - tenant + staff: global shared, tenant shared, staff exclusive
/// - tenant only: global shared, tenant exclusive
/// - anything without a tenant: global exclusive
#[derive(Default)]
pub struct ScopeLocks {
    global: Arc<RwLock<()>>,
    tenants: DashMap<String, Arc<RwLock<()>>>,
    staff: DashMap<Ulid, Arc<Mutex<()>>>,
}

enum Held {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// Releases the scope on drop, innermost level first.
pub struct ScopeGuard {
    _staff: Option<OwnedMutexGuard<()>>,
    _tenant: Option<Held>,
    _global: Held,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn tenant_lock(&self, tenant_id: &str) -> Arc<RwLock<()>> {
        self.tenants
            .entry(tenant_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn staff_lock(&self, staff_id: Ulid) -> Arc<Mutex<()>> {
        self.staff.entry(staff_id).or_default().value().clone()
    }

    pub async fn acquire(&self, tenant_id: Option<&str>, staff_id: Option<Ulid>) -> ScopeGuard {
        match (tenant_id, staff_id) {
            (Some(tenant), Some(staff)) => {
                let global = Held::Shared(self.global.clone().read_owned().await);
                let tenant = Held::Shared(self.tenant_lock(tenant).read_owned().await);
                let staff = self.staff_lock(staff).lock_owned().await;
                ScopeGuard {
                    _staff: Some(staff),
                    _tenant: Some(tenant),
                    _global: global,
                }
            }
            (Some(tenant), None) => {
                let global = Held::Shared(self.global.clone().read_owned().await);
                let tenant = Held::Exclusive(self.tenant_lock(tenant).write_owned().await);
                ScopeGuard {
                    _staff: None,
                    _tenant: Some(tenant),
                    _global: global,
                }
            }
            (None, _) => ScopeGuard {
                _staff: None,
                _tenant: None,
                _global: Held::Exclusive(self.global.clone().write_owned().await),
            },
        }
    }
}
