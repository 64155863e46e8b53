use std::collections::BTreeMap;

use serde_json::Value;
use shared::domain::{CurrentUserInfo, KeyserverId, PlatformDetails, UserInfo};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::{
    config::ConnectionConfig,
    session::{
        invalid_session_downgrade, invalid_session_recovery, invalidation_prompt, is_user_cookie,
        ClientSessionChange, PreRequestUserState, RecoveryActionSource, SessionAlert,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionIssue {
    ClientVersionUnsupported,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyserverSession {
    pub cookie: Option<String>,
    pub session_id: Option<String>,
    pub url_prefix: String,
    pub is_socket_connected: bool,
    pub last_communicated_platform_details: Option<PlatformDetails>,
    pub active_session_recovery: Option<RecoveryActionSource>,
    pub connection_issue: Option<ConnectionIssue>,
    pub device_token: Option<String>,
}

impl KeyserverSession {
    pub fn new(url_prefix: impl Into<String>) -> Self {
        Self {
            url_prefix: url_prefix.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionState {
    pub current_user_info: Option<CurrentUserInfo>,
    pub data_loaded: bool,
    pub services_access_token: Option<String>,
    pub keyservers: BTreeMap<KeyserverId, KeyserverSession>,
    pub user_infos: BTreeMap<String, UserInfo>,
    pub pending_policy_acknowledgment: Option<Value>,
    pub session_alert: Option<SessionAlert>,
}

impl ConnectionState {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            keyservers: config
                .keyservers
                .iter()
                .map(|entry| (entry.id.clone(), KeyserverSession::new(&entry.url_prefix)))
                .collect(),
            ..Self::default()
        }
    }

    pub fn keyserver(&self, keyserver_id: &KeyserverId) -> Option<&KeyserverSession> {
        self.keyservers.get(keyserver_id)
    }

    pub fn has_current_user_info(&self) -> bool {
        self.current_user_info
            .as_ref()
            .is_some_and(|info| !info.is_anonymous())
    }

    pub fn is_logged_in_to_keyserver(&self, keyserver_id: &KeyserverId) -> bool {
        self.keyserver(keyserver_id)
            .and_then(|session| session.cookie.as_deref())
            .is_some_and(is_user_cookie)
    }
}

#[derive(Debug, Clone)]
pub struct SetNewSessionPayload {
    pub keyserver_id: KeyserverId,
    pub session_change: ClientSessionChange,
    pub pre_request_user_state: Option<PreRequestUserState>,
    pub error: Option<String>,
    pub source: Option<RecoveryActionSource>,
}

#[derive(Debug, Clone)]
pub enum Action {
    SetNewSession(SetNewSessionPayload),
    UpdateLastCommunicatedPlatformDetails {
        keyserver_id: KeyserverId,
        platform_details: PlatformDetails,
    },
    ForcePolicyAcknowledgment {
        payload: Option<Value>,
    },
    ProcessUserInfos {
        user_infos: Vec<UserInfo>,
    },
    SetConnectionIssue {
        keyserver_id: KeyserverId,
        issue: Option<ConnectionIssue>,
    },
    SetActiveSessionRecovery {
        keyserver_id: KeyserverId,
        source: Option<RecoveryActionSource>,
    },
    SetSocketConnected {
        keyserver_id: KeyserverId,
        connected: bool,
    },
    SetDeviceToken {
        keyserver_id: KeyserverId,
        device_token: Option<String>,
    },
    AddKeyserver {
        keyserver_id: KeyserverId,
        url_prefix: String,
    },
    SetCurrentUserInfo(Option<CurrentUserInfo>),
    SetServicesAccessToken(Option<String>),
    SetDataLoaded(bool),
    LogOut,
}

/// The state store as seen by the connection layer: a single writer behind
/// `dispatch`, many readers behind `snapshot`/`subscribe`.
pub trait StateStore: Send + Sync {
    fn dispatch(&self, action: Action);
    fn snapshot(&self) -> ConnectionState;
    fn subscribe(&self) -> watch::Receiver<ConnectionState>;
}

pub trait StateStoreExt: StateStore {
    fn select<T>(&self, selector: impl FnOnce(&ConnectionState) -> T) -> T {
        selector(&self.snapshot())
    }
}

impl<S: StateStore + ?Sized> StateStoreExt for S {}

#[derive(Debug, Clone)]
struct ReducerPolicy {
    authoritative_keyserver_id: KeyserverId,
    relying_on_authoritative_keyserver: bool,
}

pub struct MemoryStore {
    state: watch::Sender<ConnectionState>,
    policy: ReducerPolicy,
}

impl MemoryStore {
    pub fn new(initial: ConnectionState, config: &ConnectionConfig) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            state,
            policy: ReducerPolicy {
                authoritative_keyserver_id: config.authoritative_keyserver_id.clone(),
                relying_on_authoritative_keyserver: config.relying_on_authoritative_keyserver,
            },
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(ConnectionState::from_config(config), config)
    }
}

impl StateStore for MemoryStore {
    fn dispatch(&self, action: Action) {
        let policy = &self.policy;
        self.state
            .send_if_modified(|state| reduce(state, action, policy));
    }

    fn snapshot(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

fn reduce(state: &mut ConnectionState, action: Action, policy: &ReducerPolicy) -> bool {
    match action {
        Action::SetNewSession(payload) => apply_session_change(state, payload, policy),
        Action::UpdateLastCommunicatedPlatformDetails {
            keyserver_id,
            platform_details,
        } => match state.keyservers.get_mut(&keyserver_id) {
            Some(session) => {
                session.last_communicated_platform_details = Some(platform_details);
                true
            }
            None => false,
        },
        Action::ForcePolicyAcknowledgment { payload } => {
            state.pending_policy_acknowledgment = Some(payload.unwrap_or(Value::Null));
            true
        }
        Action::ProcessUserInfos { user_infos } => {
            let mut changed = false;
            for user_info in user_infos {
                if state.user_infos.get(&user_info.id) != Some(&user_info) {
                    state.user_infos.insert(user_info.id.clone(), user_info);
                    changed = true;
                }
            }
            changed
        }
        Action::SetConnectionIssue {
            keyserver_id,
            issue,
        } => update_keyserver(state, &keyserver_id, |session| {
            session.connection_issue = issue;
        }),
        Action::SetActiveSessionRecovery {
            keyserver_id,
            source,
        } => update_keyserver(state, &keyserver_id, |session| {
            session.active_session_recovery = source;
        }),
        Action::SetSocketConnected {
            keyserver_id,
            connected,
        } => update_keyserver(state, &keyserver_id, |session| {
            session.is_socket_connected = connected;
        }),
        Action::SetDeviceToken {
            keyserver_id,
            device_token,
        } => update_keyserver(state, &keyserver_id, |session| {
            session.device_token = device_token;
        }),
        Action::AddKeyserver {
            keyserver_id,
            url_prefix,
        } => {
            state
                .keyservers
                .entry(keyserver_id)
                .or_insert_with(|| KeyserverSession::new(url_prefix));
            true
        }
        Action::SetCurrentUserInfo(current_user_info) => {
            state.current_user_info = current_user_info;
            true
        }
        Action::SetServicesAccessToken(token) => {
            state.services_access_token = token;
            true
        }
        Action::SetDataLoaded(loaded) => {
            state.data_loaded = loaded;
            true
        }
        Action::LogOut => {
            info!("logging out");
            state.current_user_info = Some(CurrentUserInfo::anonymous());
            state.services_access_token = None;
            state.data_loaded = false;
            for session in state.keyservers.values_mut() {
                session.cookie = None;
                session.session_id = None;
                session.active_session_recovery = None;
            }
            true
        }
    }
}

fn update_keyserver(
    state: &mut ConnectionState,
    keyserver_id: &KeyserverId,
    update: impl FnOnce(&mut KeyserverSession),
) -> bool {
    match state.keyservers.get_mut(keyserver_id) {
        Some(session) => {
            let before = session.clone();
            update(session);
            *session != before
        }
        None => false,
    }
}

fn apply_session_change(
    state: &mut ConnectionState,
    payload: SetNewSessionPayload,
    policy: &ReducerPolicy,
) -> bool {
    let SetNewSessionPayload {
        keyserver_id,
        session_change,
        pre_request_user_state,
        error,
        source,
    } = payload;

    let mut changed = false;
    if source.is_some() {
        changed |= update_keyserver(state, &keyserver_id, |session| {
            session.active_session_recovery = None;
        });
    }

    let incoming_user_info = session_change.current_user_info();
    if invalid_session_downgrade(
        state,
        incoming_user_info.as_ref(),
        pre_request_user_state.as_ref(),
        &keyserver_id,
    ) {
        info!(keyserver_id = %keyserver_id, "dropping stale session downgrade");
        return changed;
    }
    if session_change.is_user_session()
        && invalid_session_recovery(state, incoming_user_info.as_ref(), source)
    {
        info!(keyserver_id = %keyserver_id, "dropping stale session recovery");
        return changed;
    }

    let Some(session) = state.keyservers.get_mut(&keyserver_id) else {
        debug!(keyserver_id = %keyserver_id, "session change for unknown keyserver");
        return changed;
    };
    session.cookie = session_change.cookie().map(str::to_string);
    session.session_id = session_change.session_id().map(str::to_string);

    let tracks_user = policy.relying_on_authoritative_keyserver
        && keyserver_id == policy.authoritative_keyserver_id;
    if tracks_user {
        if let Some(user_info) = incoming_user_info {
            state.current_user_info = Some(user_info);
        }
    }
    if session_change.is_invalidated() {
        state.session_alert = Some(SessionAlert {
            keyserver_id,
            prompt: invalidation_prompt(error.as_deref()),
        });
    }
    true
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
