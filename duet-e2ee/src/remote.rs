//! The remote half of the key exchange: public key directory plus the
//! shared-key store, both scoped to the authenticated caller.

use async_trait::async_trait;

use duet_api::{ApiClient, PartnerKeyStatus, RetryConfig, SharedKeyStatus};
use duet_core::error::DuetResult;

/// Key directory and key-exchange store operations.
///
/// Every call is a single request; callers own the retry policy.
#[async_trait]
pub trait KeyService: Send + Sync {
    /// Register (or replace) the caller's public key.
    async fn publish_public_key(&self, public_key: &str) -> DuetResult<()>;

    /// Look up the partner's public key for a pairing.
    async fn partner_public_key(&self, pairing_id: &str) -> DuetResult<PartnerKeyStatus>;

    /// Upload the shared key encrypted once for the caller and once for the partner.
    async fn upload_shared_keys(&self, for_self: &str, for_partner: &str) -> DuetResult<()>;

    /// The caller's own encrypted copy of the shared key, if uploaded.
    async fn own_shared_key(&self) -> DuetResult<SharedKeyStatus>;
}

/// [`KeyService`] over the REST API.
///
/// Wraps a fail-fast copy of the client: the bootstrap polls at a fixed
/// cadence and must see every transport failure on the attempt it happened.
#[derive(Clone)]
pub struct RemoteKeyService {
    api: ApiClient,
}

impl RemoteKeyService {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api: api.with_retry_config(RetryConfig::none()),
        }
    }
}

#[async_trait]
impl KeyService for RemoteKeyService {
    async fn publish_public_key(&self, public_key: &str) -> DuetResult<()> {
        self.api.put_public_key(public_key).await
    }

    async fn partner_public_key(&self, pairing_id: &str) -> DuetResult<PartnerKeyStatus> {
        self.api.get_partner_public_key(pairing_id).await
    }

    async fn upload_shared_keys(&self, for_self: &str, for_partner: &str) -> DuetResult<()> {
        self.api.put_shared_keys(for_self, for_partner).await
    }

    async fn own_shared_key(&self) -> DuetResult<SharedKeyStatus> {
        self.api.get_shared_key().await
    }
}
