use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{CurrentUserInfo, PlatformDetails};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestData {
    pub input: Value,
    pub cookie: Option<String>,
    /// Outer `None` omits the field; inner `None` sends an explicit `null`.
    #[serde(
        rename = "sessionID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<Option<String>>,
    #[serde(
        rename = "platformDetails",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub platform_details: Option<PlatformDetails>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSessionChange {
    pub cookie_invalidated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_infos: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_infos: Option<Value>,
    #[serde(rename = "sessionID", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_user_info: Option<CurrentUserInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_change: Option<ServerSessionChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_user_info: Option<CurrentUserInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OlmSessionInitializationInfo {
    pub prekey: String,
    pub prekey_signature: String,
    #[serde(default)]
    pub one_time_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPublicKeys {
    pub ed25519: String,
    pub curve25519: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityKeysBlob {
    pub primary_identity_public_keys: IdentityPublicKeys,
    pub notification_identity_public_keys: IdentityPublicKeys,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyserverKeys {
    pub identity_keys_blob: IdentityKeysBlob,
    pub content_initialization_info: OlmSessionInitializationInfo,
    pub notif_initialization_info: OlmSessionInitializationInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTokenUpdateRequest {
    pub device_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyserverAuthRequest {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub do_not_register: bool,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_token_update_request: Option<DeviceTokenUpdateRequest>,
    pub platform_details: PlatformDetails,
    pub initial_content_encrypted_message: String,
    pub initial_notifications_encrypted_message: String,
}
