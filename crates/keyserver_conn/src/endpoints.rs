use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportAffinity {
    HttpOnly,
    SocketOnly,
    SocketPreferred,
    HttpPreferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    Nil,
    Object,
}

macro_rules! endpoint_table {
    ($(
        $affinity:ident {
            $( $variant:ident => $name:literal : $shape:ident ),* $(,)?
        }
    )*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Endpoint {
            $( $( $variant, )* )*
        }

        impl Endpoint {
            pub const ALL: &'static [Endpoint] = &[ $( $( Endpoint::$variant, )* )* ];

            pub const fn as_str(self) -> &'static str {
                match self {
                    $( $( Endpoint::$variant => $name, )* )*
                }
            }

            pub const fn affinity(self) -> TransportAffinity {
                match self {
                    $( $( Endpoint::$variant => TransportAffinity::$affinity, )* )*
                }
            }

            pub const fn response_shape(self) -> ResponseShape {
                match self {
                    $( $( Endpoint::$variant => ResponseShape::$shape, )* )*
                }
            }
        }

        impl FromStr for Endpoint {
            type Err = UnknownEndpoint;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $( $name => Ok(Endpoint::$variant), )* )*
                    other => Err(UnknownEndpoint(other.to_string())),
                }
            }
        }
    };
}

endpoint_table! {
    HttpOnly {
        LogOut => "log_out": Object,
        DeleteAccount => "delete_account": Object,
        CreateAccount => "create_account": Object,
        LogIn => "log_in": Object,
        UpdatePassword => "update_password": Object,
        PolicyAcknowledgment => "policy_acknowledgment": Nil,
        KeyserverAuth => "keyserver_auth": Object,
        UploadMultimedia => "upload_multimedia": Object,
        GetInitialReduxState => "get_initial_redux_state": Object,
        FetchPendingUpdates => "fetch_pending_updates": Object,
    }
    SocketOnly {
        UpdateActivity => "update_activity": Object,
        UpdateCalendarQuery => "update_calendar_query": Object,
    }
    SocketPreferred {}
    HttpPreferred {
        CreateReport => "create_report": Object,
        CreateReports => "create_reports": Nil,
        CreateEntry => "create_entry": Object,
        CreateErrorReport => "create_error_report": Object,
        CreateMessageReport => "create_message_report": Object,
        CreateMultimediaMessage => "create_multimedia_message": Object,
        CreateOrUpdatePublicLink => "create_or_update_public_link": Object,
        CreateReactionMessage => "create_reaction_message": Object,
        EditMessage => "edit_message": Object,
        CreateTextMessage => "create_text_message": Object,
        CreateThread => "create_thread": Object,
        DeleteEntry => "delete_entry": Object,
        DeleteCommunityRole => "delete_community_role": Object,
        DeleteThread => "delete_thread": Object,
        DeleteUpload => "delete_upload": Nil,
        DisableInviteLink => "disable_invite_link": Nil,
        ExactSearchUser => "exact_search_user": Object,
        FetchEntries => "fetch_entries": Object,
        FetchEntryRevisions => "fetch_entry_revisions": Object,
        FetchErrorReportInfos => "fetch_error_report_infos": Object,
        FetchMessages => "fetch_messages": Object,
        FetchPinnedMessages => "fetch_pinned_messages": Object,
        FetchPrimaryInviteLinks => "fetch_primary_invite_links": Object,
        FetchThreadMedia => "fetch_thread_media": Object,
        JoinThread => "join_thread": Object,
        LeaveThread => "leave_thread": Object,
        ModifyCommunityRole => "modify_community_role": Object,
        RemoveMembers => "remove_members": Object,
        RestoreEntry => "restore_entry": Object,
        SearchUsers => "search_users": Object,
        SendPasswordResetEmail => "send_password_reset_email": Nil,
        SendVerificationEmail => "send_verification_email": Nil,
        SetThreadUnreadStatus => "set_thread_unread_status": Object,
        ToggleMessagePin => "toggle_message_pin": Object,
        UpdateAccount => "update_account": Nil,
        UpdateUserSettings => "update_user_settings": Nil,
        UpdateDeviceToken => "update_device_token": Nil,
        UpdateEntry => "update_entry": Object,
        UpdateRelationships => "update_relationships": Object,
        UpdateRelationships2 => "update_relationships2": Object,
        UpdateRole => "update_role": Object,
        UpdateThread => "update_thread": Object,
        UpdateUserSubscription => "update_user_subscription": Object,
        VerifyCode => "verify_code": Nil,
        VerifyInviteLink => "verify_invite_link": Object,
        SiweNonce => "siwe_nonce": Object,
        SiweAuth => "siwe_auth": Object,
        ClaimUsername => "claim_username": Object,
        UpdateUserAvatar => "update_user_avatar": Object,
        UploadMediaMetadata => "upload_media_metadata": Object,
        SearchMessages => "search_messages": Object,
        GetOlmSessionInitializationData => "get_olm_session_initialization_data": Object,
        Version => "version": Object,
        FetchCommunityInfos => "fetch_community_infos": Object,
        FetchNativeDrawerAndDirectoryInfos => "fetch_native_drawer_and_directory_infos": Object,
        CreateOrUpdateFarcasterChannelTag => "create_or_update_farcaster_channel_tag": Object,
        DeleteFarcasterChannelTag => "delete_farcaster_channel_tag": Object,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown endpoint: {0}")]
pub struct UnknownEndpoint(pub String);

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Endpoint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub endpoint: Endpoint,
    pub affinity: TransportAffinity,
    pub response_shape: ResponseShape,
}

pub fn classify(name: &str) -> Option<EndpointInfo> {
    let endpoint: Endpoint = name.parse().ok()?;
    Some(EndpointInfo {
        endpoint,
        affinity: endpoint.affinity(),
        response_shape: endpoint.response_shape(),
    })
}

pub fn endpoint_is_http_only(endpoint: Endpoint) -> bool {
    endpoint.affinity() == TransportAffinity::HttpOnly
}

pub fn endpoint_is_socket_only(endpoint: Endpoint) -> bool {
    endpoint.affinity() == TransportAffinity::SocketOnly
}

pub fn endpoint_is_socket_preferred(endpoint: Endpoint) -> bool {
    matches!(
        endpoint.affinity(),
        TransportAffinity::SocketOnly | TransportAffinity::SocketPreferred
    )
}

pub fn endpoint_is_socket_safe(endpoint: Endpoint) -> bool {
    !endpoint_is_http_only(endpoint)
}

/// Response-shape checks keyed by endpoint. The concrete shapes live with the
/// application; the connection layer only asks whether a response can be
/// trusted for user-info extraction.
pub trait EndpointValidators: Send + Sync {
    fn validate(&self, endpoint: Endpoint, response: &Value) -> Result<(), String>;
}

pub struct PermissiveValidators;

impl EndpointValidators for PermissiveValidators {
    fn validate(&self, endpoint: Endpoint, response: &Value) -> Result<(), String> {
        match endpoint.response_shape() {
            ResponseShape::Nil => Ok(()),
            ResponseShape::Object if response.is_object() => Ok(()),
            ResponseShape::Object => Err(format!("{endpoint} response is not an object")),
        }
    }
}

#[cfg(test)]
#[path = "tests/endpoints_tests.rs"]
mod tests;
