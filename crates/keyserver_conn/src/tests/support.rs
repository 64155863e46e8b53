use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use shared::{
    domain::{CurrentUserInfo, KeyserverId},
    protocol::{
        IdentityKeysBlob, IdentityPublicKeys, KeyserverKeys, OlmSessionInitializationInfo,
    },
};
use tokio::{net::TcpListener, sync::Mutex};

use crate::{
    config::{ConnectionConfig, KeyserverEntry},
    context::ConnectionContext,
    identity::{AuthMetadata, EncryptedData, IdentityClient, OlmApi},
    store::{Action, MemoryStore, StateStore},
};

pub(crate) const AUTHORITATIVE: &str = "256";
pub(crate) const SECONDARY: &str = "ks2";

#[derive(Clone)]
pub(crate) enum Reply {
    Json(Value),
    Raw(&'static str),
    Hang,
}

#[derive(Debug, Clone)]
pub(crate) struct Recorded {
    pub endpoint: String,
    pub body: Value,
}

#[derive(Default)]
struct MockState {
    requests: Mutex<Vec<Recorded>>,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
}

#[derive(Clone)]
pub(crate) struct MockKeyserver {
    pub url: String,
    state: Arc<MockState>,
}

impl MockKeyserver {
    /// Queues `reply` for the next call to `endpoint`. Unscripted calls get `{}`.
    pub async fn reply(&self, endpoint: &str, reply: Reply) {
        self.state
            .replies
            .lock()
            .await
            .entry(endpoint.to_string())
            .or_default()
            .push_back(reply);
    }

    pub async fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().await.clone()
    }

    pub async fn hits(&self, endpoint: &str) -> usize {
        self.state
            .requests
            .lock()
            .await
            .iter()
            .filter(|r| r.endpoint == endpoint)
            .count()
    }
}

async fn handle_call(
    State(state): State<Arc<MockState>>,
    Path(endpoint): Path<String>,
    body: String,
) -> Response {
    let body = serde_json::from_str(&body).unwrap_or(Value::Null);
    state.requests.lock().await.push(Recorded {
        endpoint: endpoint.clone(),
        body,
    });
    let reply = state
        .replies
        .lock()
        .await
        .get_mut(&endpoint)
        .and_then(VecDeque::pop_front)
        .unwrap_or_else(|| Reply::Json(json!({})));
    match reply {
        Reply::Json(value) => Json(value).into_response(),
        Reply::Raw(text) => text.into_response(),
        Reply::Hang => futures::future::pending::<Response>().await,
    }
}

pub(crate) async fn spawn_keyserver() -> MockKeyserver {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/:endpoint", post(handle_call))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    MockKeyserver {
        url: format!("http://{addr}"),
        state,
    }
}

pub(crate) fn config_for(urls: &[(&str, &str)]) -> ConnectionConfig {
    ConnectionConfig {
        keyservers: urls
            .iter()
            .map(|(id, url)| KeyserverEntry {
                id: KeyserverId::from(*id),
                url_prefix: url.to_string(),
            })
            .collect(),
        ..ConnectionConfig::default()
    }
}

pub(crate) fn logged_in_context(config: ConnectionConfig) -> Arc<ConnectionContext> {
    let store = MemoryStore::from_config(&config);
    store.dispatch(Action::SetCurrentUserInfo(Some(CurrentUserInfo::logged_in(
        "100", "ashoat",
    ))));
    store.dispatch(Action::SetDataLoaded(true));
    for entry in &config.keyservers {
        seed_session(&store, entry.id.as_str(), Some("user=1:old"), Some("session-1"));
    }
    Arc::new(ConnectionContext::new(config, Arc::new(store)))
}

pub(crate) fn seed_session(
    store: &dyn StateStore,
    keyserver_id: &str,
    cookie: Option<&str>,
    session_id: Option<&str>,
) {
    use crate::session::{set_new_session, ClientSessionChange};

    let change = ClientSessionChange::Valid {
        current_user_info: None,
        cookie: cookie.map(str::to_string),
        session_id: session_id.map(str::to_string),
    };
    set_new_session(store, change, None, None, None, &KeyserverId::from(keyserver_id));
}

pub(crate) fn keyserver_keys() -> KeyserverKeys {
    let keys = |prefix: &str| IdentityPublicKeys {
        ed25519: format!("{prefix}-ed25519"),
        curve25519: format!("{prefix}-curve25519"),
    };
    let init = |prefix: &str| OlmSessionInitializationInfo {
        prekey: format!("{prefix}-prekey"),
        prekey_signature: format!("{prefix}-signature"),
        one_time_key: Some(format!("{prefix}-otk")),
    };
    KeyserverKeys {
        identity_keys_blob: IdentityKeysBlob {
            primary_identity_public_keys: keys("primary"),
            notification_identity_public_keys: keys("notif"),
        },
        content_initialization_info: init("content"),
        notif_initialization_info: init("notif"),
    }
}

#[derive(Default)]
pub(crate) struct FakeIdentity {
    pub key_fetches: Mutex<Vec<KeyserverId>>,
}

#[async_trait]
impl IdentityClient for FakeIdentity {
    async fn get_keyserver_keys(&self, keyserver_id: &KeyserverId) -> anyhow::Result<KeyserverKeys> {
        self.key_fetches.lock().await.push(keyserver_id.clone());
        Ok(keyserver_keys())
    }

    async fn get_auth_metadata(&self) -> anyhow::Result<AuthMetadata> {
        Ok(AuthMetadata {
            user_id: Some("100".to_string()),
            device_id: Some("device-1".to_string()),
            access_token: Some("access-token".to_string()),
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeOlm {
    pub notif_cookies: Mutex<Vec<Option<String>>>,
    pub reassignments: Mutex<Vec<(Option<String>, String)>>,
    pub fail_reassignment: bool,
}

#[async_trait]
impl OlmApi for FakeOlm {
    async fn initialize_crypto_account(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn notifications_session_creator(
        &self,
        cookie: Option<&str>,
        _notification_identity_keys: &IdentityPublicKeys,
        _notif_initialization_info: &OlmSessionInitializationInfo,
        _keyserver_id: &KeyserverId,
    ) -> anyhow::Result<String> {
        self.notif_cookies.lock().await.push(cookie.map(str::to_string));
        Ok("notif-initial-message".to_string())
    }

    async fn content_outbound_session_creator(
        &self,
        _primary_identity_keys: &IdentityPublicKeys,
        _content_initialization_info: &OlmSessionInitializationInfo,
    ) -> anyhow::Result<EncryptedData> {
        Ok(EncryptedData {
            message: "content-initial-message".to_string(),
            message_type: 0,
        })
    }

    async fn reassign_notifications_session(
        &self,
        prev_cookie: Option<&str>,
        new_cookie: &str,
        _keyserver_id: &KeyserverId,
    ) -> anyhow::Result<()> {
        if self.fail_reassignment {
            anyhow::bail!("notifications session store unavailable");
        }
        self.reassignments
            .lock()
            .await
            .push((prev_cookie.map(str::to_string), new_cookie.to_string()));
        Ok(())
    }
}
