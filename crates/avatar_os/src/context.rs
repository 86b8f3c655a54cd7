#![forbid(unsafe_code)]

use std::sync::Arc;

use avatar_engines::identity::IdentityVerifier;
use avatar_engines::provisioning::ProvisioningClient;
use avatar_storage::repo::AvatarRecordRepo;

/// Collaborators shared by every request. Built once at startup and passed down.
#[derive(Clone)]
pub struct AppContext {
    pub records: Arc<dyn AvatarRecordRepo>,
    pub provisioning: Arc<dyn ProvisioningClient>,
    pub identity: Arc<dyn IdentityVerifier>,
}

impl AppContext {
    pub fn new(
        records: Arc<dyn AvatarRecordRepo>,
        provisioning: Arc<dyn ProvisioningClient>,
        identity: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self {
            records,
            provisioning,
            identity,
        }
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext").finish_non_exhaustive()
    }
}
