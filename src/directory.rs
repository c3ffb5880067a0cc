use async_trait::async_trait;
use dashmap::DashSet;

/// Owner identity check, answered by the owner directory outside this crate.
#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    async fn is_known_owner(&self, owner_id: &str) -> bool;
}

/// Accepts any non-empty owner id. Used when no directory is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllOwners;

#[async_trait]
impl OwnerDirectory for AcceptAllOwners {
    async fn is_known_owner(&self, owner_id: &str) -> bool {
        !owner_id.trim().is_empty()
    }
}

/// In-process roster of registered owners.
#[derive(Debug, Default)]
pub struct OwnerRoster {
    owners: DashSet<String>,
}

impl OwnerRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, owner_id: impl Into<String>) {
        self.owners.insert(owner_id.into());
    }

    pub fn deregister(&self, owner_id: &str) -> bool {
        self.owners.remove(owner_id).is_some()
    }
}

#[async_trait]
impl OwnerDirectory for OwnerRoster {
    async fn is_known_owner(&self, owner_id: &str) -> bool {
        self.owners.contains(owner_id)
    }
}
