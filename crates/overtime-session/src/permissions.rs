//! Device permission contract.
//!
//! The platform layer implements [`PermissionProvider`]; everything above it
//! only sees the tri-state [`PermissionAccess`].

use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

/// A device capability gated behind a user prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Camera,
    Microphone,
    Photos,
    Location,
    Notifications,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::Camera => "Camera",
            Permission::Microphone => "Microphone",
            Permission::Photos => "Photos",
            Permission::Location => "Location",
            Permission::Notifications => "Notifications",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionAccess {
    Granted,
    #[default]
    Undetermined,
    Denied,
}

#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Current access without prompting.
    async fn check(&self, permission: Permission) -> PermissionAccess;

    /// Prompt for access. Resolves to `Granted` or `Denied`.
    async fn request(&self, permission: Permission) -> PermissionAccess;
}

/// Whether every permission is granted. True for an empty list.
pub async fn has_granted_all(provider: &dyn PermissionProvider, permissions: &[Permission]) -> bool {
    for permission in permissions {
        if provider.check(*permission).await != PermissionAccess::Granted {
            return false;
        }
    }
    true
}

/// Whether the user has answered every prompt. True for an empty list.
pub async fn has_requested_all(
    provider: &dyn PermissionProvider,
    permissions: &[Permission],
) -> bool {
    for permission in permissions {
        if provider.check(*permission).await == PermissionAccess::Undetermined {
            return false;
        }
    }
    true
}

/// Check a permission and prompt only if it is still undetermined.
pub async fn ensure(provider: &dyn PermissionProvider, permission: Permission) -> PermissionAccess {
    match provider.check(permission).await {
        PermissionAccess::Undetermined => {
            let access = provider.request(permission).await;
            debug!(permission = %permission, ?access, "permission requested");
            access
        }
        access => access,
    }
}

/// In-memory provider for headless hosts and tests.
///
/// Undetermined permissions resolve to the configured answer when requested.
#[derive(Debug)]
pub struct MemoryPermissions {
    states: DashMap<Permission, PermissionAccess>,
    grant_on_request: bool,
}

impl MemoryPermissions {
    pub fn new(grant_on_request: bool) -> Self {
        Self {
            states: DashMap::new(),
            grant_on_request,
        }
    }

    pub fn set(&self, permission: Permission, access: PermissionAccess) {
        self.states.insert(permission, access);
    }
}

#[async_trait]
impl PermissionProvider for MemoryPermissions {
    async fn check(&self, permission: Permission) -> PermissionAccess {
        self.states
            .get(&permission)
            .map(|s| *s.value())
            .unwrap_or_default()
    }

    async fn request(&self, permission: Permission) -> PermissionAccess {
        let mut state = self.states.entry(permission).or_default();
        if *state == PermissionAccess::Undetermined {
            *state = if self.grant_on_request {
                PermissionAccess::Granted
            } else {
                PermissionAccess::Denied
            };
        }
        *state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_prompts_only_when_undetermined() {
        let provider = MemoryPermissions::new(true);
        provider.set(Permission::Photos, PermissionAccess::Denied);

        assert_eq!(
            ensure(&provider, Permission::Camera).await,
            PermissionAccess::Granted
        );
        assert_eq!(
            ensure(&provider, Permission::Photos).await,
            PermissionAccess::Denied
        );
    }

    #[tokio::test]
    async fn test_aggregate_checks() {
        let provider = MemoryPermissions::new(false);
        assert!(has_granted_all(&provider, &[]).await);
        assert!(has_requested_all(&provider, &[]).await);

        provider.set(Permission::Camera, PermissionAccess::Granted);
        provider.set(Permission::Microphone, PermissionAccess::Denied);

        let both = [Permission::Camera, Permission::Microphone];
        assert!(!has_granted_all(&provider, &both).await);
        assert!(has_requested_all(&provider, &both).await);
        assert!(!has_requested_all(&provider, &[Permission::Location]).await);

        assert_eq!(
            provider.request(Permission::Location).await,
            PermissionAccess::Denied
        );
        assert!(has_requested_all(&provider, &[Permission::Location]).await);
    }

    #[test]
    fn test_permission_names() {
        assert_eq!(Permission::Notifications.to_string(), "Notifications");
    }
}
