use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shared::{
    domain::{CurrentUserInfo, KeyserverId, LoggedOutUserInfo},
    error::CLIENT_VERSION_UNSUPPORTED,
    protocol::ServerSessionChange,
};

use crate::store::{Action, ConnectionState, SetNewSessionPayload, StateStore};

const USER_COOKIE_PREFIX: &str = "user=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryActionSource {
    CookieInvalidationResolutionAttempt,
    SocketAuthErrorResolutionAttempt,
    SocketNotLoggedIn,
    RefetchUserDataAfterAcknowledgment,
}

impl RecoveryActionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CookieInvalidationResolutionAttempt => "COOKIE_INVALIDATION_RESOLUTION_ATTEMPT",
            Self::SocketAuthErrorResolutionAttempt => "SOCKET_AUTH_ERROR_RESOLUTION_ATTEMPT",
            Self::SocketNotLoggedIn => "SOCKET_NOT_LOGGED_IN",
            Self::RefetchUserDataAfterAcknowledgment => "REFETCH_USER_DATA_AFTER_ACKNOWLEDGMENT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthActionSource {
    KeyserverAuthFromNative,
    KeyserverAuthFromWeb,
    Recovery(RecoveryActionSource),
}

impl AuthActionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeyserverAuthFromNative => "KEYSERVER_AUTH_FROM_NATIVE",
            Self::KeyserverAuthFromWeb => "KEYSERVER_AUTH_FROM_WEB",
            Self::Recovery(source) => source.as_str(),
        }
    }
}

impl From<RecoveryActionSource> for AuthActionSource {
    fn from(value: RecoveryActionSource) -> Self {
        Self::Recovery(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientSessionChange {
    Invalidated {
        current_user_info: LoggedOutUserInfo,
        cookie: Option<String>,
        session_id: Option<String>,
    },
    Valid {
        current_user_info: Option<CurrentUserInfo>,
        cookie: Option<String>,
        session_id: Option<String>,
    },
}

impl ClientSessionChange {
    pub fn from_server(
        change: ServerSessionChange,
        response_user_info: Option<CurrentUserInfo>,
    ) -> Self {
        let ServerSessionChange {
            cookie_invalidated,
            cookie,
            session_id,
            current_user_info,
            ..
        } = change;
        if cookie_invalidated {
            Self::Invalidated {
                current_user_info: LoggedOutUserInfo::new(),
                cookie,
                session_id,
            }
        } else {
            Self::Valid {
                current_user_info: response_user_info.or(current_user_info),
                cookie,
                session_id,
            }
        }
    }

    pub fn is_invalidated(&self) -> bool {
        matches!(self, Self::Invalidated { .. })
    }

    pub fn cookie(&self) -> Option<&str> {
        match self {
            Self::Invalidated { cookie, .. } | Self::Valid { cookie, .. } => cookie.as_deref(),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Invalidated { session_id, .. } | Self::Valid { session_id, .. } => {
                session_id.as_deref()
            }
        }
    }

    pub fn current_user_info(&self) -> Option<CurrentUserInfo> {
        match self {
            Self::Invalidated {
                current_user_info, ..
            } => Some(current_user_info.clone().into()),
            Self::Valid {
                current_user_info, ..
            } => current_user_info.clone(),
        }
    }

    pub fn is_user_session(&self) -> bool {
        !self.is_invalidated() && self.cookie().is_some_and(is_user_cookie)
    }
}

pub fn generic_cookie_invalidation() -> ClientSessionChange {
    ClientSessionChange::Invalidated {
        current_user_info: LoggedOutUserInfo::new(),
        cookie: None,
        session_id: None,
    }
}

pub fn is_user_cookie(cookie: &str) -> bool {
    cookie.starts_with(USER_COOKIE_PREFIX)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieAndSession {
    pub cookie: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreRequestUserState {
    pub current_user_info: Option<CurrentUserInfo>,
    pub cookies_and_sessions: BTreeMap<KeyserverId, CookieAndSession>,
}

impl PreRequestUserState {
    pub fn capture(state: &ConnectionState, keyserver_id: &KeyserverId) -> Self {
        let session = state.keyserver(keyserver_id);
        Self {
            current_user_info: state.current_user_info.clone(),
            cookies_and_sessions: BTreeMap::from([(
                keyserver_id.clone(),
                CookieAndSession {
                    cookie: session.and_then(|s| s.cookie.clone()),
                    session_id: session.and_then(|s| s.session_id.clone()),
                },
            )]),
        }
    }
}

/// True when an anonymizing change comes back for a request issued under an
/// identity or session the store no longer holds. Such a response is stale and
/// must not log out a session that has since been re-authenticated.
pub fn invalid_session_downgrade(
    current: &ConnectionState,
    incoming_user_info: Option<&CurrentUserInfo>,
    pre_request: Option<&PreRequestUserState>,
    keyserver_id: &KeyserverId,
) -> bool {
    let Some(current_user) = current.current_user_info.as_ref() else {
        return false;
    };
    if current_user.is_anonymous() {
        return false;
    }
    if !incoming_user_info.is_some_and(CurrentUserInfo::is_anonymous) {
        return false;
    }
    let Some(pre_request) = pre_request else {
        return false;
    };

    let before = pre_request.cookies_and_sessions.get(keyserver_id);
    let now = current.keyserver(keyserver_id);
    pre_request.current_user_info.as_ref().and_then(CurrentUserInfo::id) != current_user.id()
        || before.and_then(|s| s.cookie.as_deref()) != now.and_then(|s| s.cookie.as_deref())
        || before.and_then(|s| s.session_id.as_deref())
            != now.and_then(|s| s.session_id.as_deref())
}

/// True when a recovery result arrives before data has loaded, or for an
/// identity other than the one the store currently holds. A result without
/// an identity never matches.
pub fn invalid_session_recovery(
    current: &ConnectionState,
    incoming_user_info: Option<&CurrentUserInfo>,
    source: Option<RecoveryActionSource>,
) -> bool {
    if source.is_none() {
        return false;
    }
    !current.data_loaded
        || current.current_user_info.as_ref().and_then(CurrentUserInfo::id)
            != incoming_user_info.and_then(CurrentUserInfo::id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPrompt {
    UpdateApp,
    LogInAgain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAlert {
    pub keyserver_id: KeyserverId,
    pub prompt: SessionPrompt,
}

pub fn invalidation_prompt(error: Option<&str>) -> SessionPrompt {
    if error == Some(CLIENT_VERSION_UNSUPPORTED) {
        SessionPrompt::UpdateApp
    } else {
        SessionPrompt::LogInAgain
    }
}

pub fn set_new_session(
    store: &dyn StateStore,
    session_change: ClientSessionChange,
    pre_request_user_state: Option<PreRequestUserState>,
    error: Option<&str>,
    source: Option<RecoveryActionSource>,
    keyserver_id: &KeyserverId,
) {
    store.dispatch(Action::SetNewSession(SetNewSessionPayload {
        keyserver_id: keyserver_id.clone(),
        session_change,
        pre_request_user_state,
        error: error.map(str::to_string),
        source,
    }));
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
