use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::KeyserverId,
    protocol::{IdentityPublicKeys, KeyserverKeys, OlmSessionInitializationInfo},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthMetadata {
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub access_token: Option<String>,
}

#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn get_keyserver_keys(&self, keyserver_id: &KeyserverId) -> Result<KeyserverKeys>;
    async fn get_auth_metadata(&self) -> Result<AuthMetadata>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    pub message: String,
    pub message_type: u8,
}

#[async_trait]
pub trait OlmApi: Send + Sync {
    async fn initialize_crypto_account(&self) -> Result<()>;

    async fn notifications_session_creator(
        &self,
        cookie: Option<&str>,
        notification_identity_keys: &IdentityPublicKeys,
        notif_initialization_info: &OlmSessionInitializationInfo,
        keyserver_id: &KeyserverId,
    ) -> Result<String>;

    async fn content_outbound_session_creator(
        &self,
        primary_identity_keys: &IdentityPublicKeys,
        content_initialization_info: &OlmSessionInitializationInfo,
    ) -> Result<EncryptedData>;

    /// Moves the notifications session stored under `prev_cookie` to
    /// `new_cookie`. Platforms that key sessions differently do nothing.
    async fn reassign_notifications_session(
        &self,
        _prev_cookie: Option<&str>,
        _new_cookie: &str,
        _keyserver_id: &KeyserverId,
    ) -> Result<()> {
        Ok(())
    }
}
