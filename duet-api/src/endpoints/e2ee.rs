//! End-to-end encryption endpoints: public key directory and key exchange.
//!
//! The caller's identity comes from the bearer token, so "own" resources
//! carry no id in the path.

use serde::{Deserialize, Serialize};
use tracing::debug;

use duet_core::error::DuetResult;

use crate::client::ApiClient;
use crate::response::ApiResponse;

/// Partner public key lookup result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartnerKeyStatus {
    pub has_key: bool,
    #[serde(default)]
    pub public_key: Option<String>,
}

impl PartnerKeyStatus {
    /// The key, if the partner has registered one.
    pub fn into_key(self) -> Option<String> {
        if self.has_key {
            self.public_key.filter(|k| !k.is_empty())
        } else {
            None
        }
    }
}

/// The caller's copy of the shared key, RSA-encrypted for them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedKeyStatus {
    pub has_shared_key: bool,
    #[serde(default)]
    pub encrypted_shared_key: Option<String>,
}

impl SharedKeyStatus {
    /// The encrypted copy, if one has been uploaded for the caller.
    pub fn into_encrypted_key(self) -> Option<String> {
        if self.has_shared_key {
            self.encrypted_shared_key.filter(|k| !k.is_empty())
        } else {
            None
        }
    }
}

impl ApiClient {
    /// Register (or replace) the caller's public key in the directory.
    pub async fn put_public_key(&self, public_key: &str) -> DuetResult<()> {
        let body = serde_json::json!({ "publicKey": public_key });
        let resp: ApiResponse = self.put_json("/e2ee/public-key", &body).await?;
        resp.ensure_success()?;
        debug!("public key published");
        Ok(())
    }

    /// Look up the partner's public key for a pairing.
    pub async fn get_partner_public_key(&self, pairing_id: &str) -> DuetResult<PartnerKeyStatus> {
        let resp: ApiResponse<PartnerKeyStatus> = self
            .get_json(&format!("/e2ee/couples/{pairing_id}/partner-public-key"))
            .await?;
        resp.into_data("partner public key")
    }

    /// Upload both RSA-encrypted copies of a freshly generated shared key.
    pub async fn put_shared_keys(&self, for_self: &str, for_partner: &str) -> DuetResult<()> {
        let body = serde_json::json!({
            "encryptedKeyForSelf": for_self,
            "encryptedKeyForPartner": for_partner,
        });
        let resp: ApiResponse = self.put_json("/e2ee/shared-key", &body).await?;
        resp.ensure_success()
    }

    /// Fetch the caller's own encrypted copy of the shared key.
    pub async fn get_shared_key(&self) -> DuetResult<SharedKeyStatus> {
        let resp: ApiResponse<SharedKeyStatus> = self.get_json("/e2ee/shared-key").await?;
        resp.into_data("shared key")
    }
}
