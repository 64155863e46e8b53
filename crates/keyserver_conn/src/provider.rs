use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use shared::domain::KeyserverId;
use tracing::debug;

use crate::{
    auth::InProgressSetter,
    cancel::CancelFlag,
    context::ConnectionContext,
    error::CallError,
    executor::{BoundSession, KeyserverCaller, SessionHooks, SharedCaller},
    fanout::CallKeyserverEndpoint,
    recovery::{RecoveryCoordinator, SessionRecovery},
    session::{
        set_new_session, ClientSessionChange, CookieAndSession, PreRequestUserState,
        RecoveryActionSource,
    },
    store::StateStoreExt,
};

#[derive(Debug, Clone, PartialEq)]
struct CacheKey {
    session: BoundSession,
    socket_generation: u64,
}

struct ConnectionShared {
    ctx: Arc<ConnectionContext>,
    recovery: Arc<SessionRecovery>,
    coordinator: RecoveryCoordinator<SharedCaller>,
}

impl ConnectionShared {
    fn bind(self: &Arc<Self>, session: BoundSession) -> SharedCaller {
        let socket = self.ctx.sockets.handler(&session.keyserver_id);
        let hooks = Arc::new(BoundSessionHooks {
            shared: self.clone(),
            session: session.clone(),
        });
        Arc::new(KeyserverCaller::new(self.ctx.clone(), session, socket, hooks))
    }
}

pub struct KeyserverConnections {
    shared: Arc<ConnectionShared>,
    cache: Mutex<HashMap<KeyserverId, (CacheKey, SharedCaller)>>,
}

impl KeyserverConnections {
    pub fn new(ctx: Arc<ConnectionContext>, recovery: Arc<SessionRecovery>) -> Self {
        Self {
            shared: Arc::new(ConnectionShared {
                ctx,
                recovery,
                coordinator: RecoveryCoordinator::new(),
            }),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<ConnectionContext> {
        &self.shared.ctx
    }

    pub fn recovery(&self) -> &Arc<SessionRecovery> {
        &self.shared.recovery
    }

    pub fn bound_caller(&self, keyserver_id: &KeyserverId) -> Result<SharedCaller, CallError> {
        let ctx = &self.shared.ctx;
        let session = ctx
            .store
            .select(|state| BoundSession::from_state(state, keyserver_id))
            .ok_or_else(|| CallError::UnknownKeyserver(keyserver_id.clone()))?;
        let key = CacheKey {
            session,
            socket_generation: ctx.sockets.generation(),
        };

        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((cached_key, caller)) = cache.get(keyserver_id) {
            if *cached_key == key {
                return Ok(caller.clone());
            }
        }
        debug!(keyserver_id = %keyserver_id, "binding keyserver executor");
        let caller = self.shared.bind(key.session.clone());
        cache.insert(keyserver_id.clone(), (key, caller.clone()));
        Ok(caller)
    }
}

#[async_trait]
impl CallKeyserverEndpoint for KeyserverConnections {
    fn caller(&self, keyserver_id: &KeyserverId) -> Result<SharedCaller, CallError> {
        self.bound_caller(keyserver_id)
    }
}

struct BoundSessionHooks {
    shared: Arc<ConnectionShared>,
    session: BoundSession,
}

impl BoundSessionHooks {
    fn pre_request_user_state(&self) -> PreRequestUserState {
        PreRequestUserState {
            current_user_info: self.session.current_user_info.clone(),
            cookies_and_sessions: BTreeMap::from([(
                self.session.keyserver_id.clone(),
                CookieAndSession {
                    cookie: self.session.cookie.clone(),
                    session_id: self.session.session_id.clone(),
                },
            )]),
        }
    }

    fn rebound(&self, change: &ClientSessionChange) -> BoundSession {
        BoundSession {
            cookie: change.cookie().map(str::to_string),
            session_id: change.session_id().map(str::to_string),
            current_user_info: change
                .current_user_info()
                .or_else(|| self.session.current_user_info.clone()),
            ..self.session.clone()
        }
    }
}

#[async_trait]
impl SessionHooks for BoundSessionHooks {
    fn set_new_session(&self, change: ClientSessionChange, error: Option<&str>) {
        set_new_session(
            self.shared.ctx.store.as_ref(),
            change,
            Some(self.pre_request_user_state()),
            error,
            None,
            &self.session.keyserver_id,
        );
    }

    async fn wait_if_invalidated(&self) -> Option<SharedCaller> {
        if !self.shared.recovery.can_resolve_invalidation() {
            return None;
        }
        self.shared
            .coordinator
            .wait_if_in_flight(&self.session.keyserver_id)
            .await
            .flatten()
    }

    async fn recover_invalidation(
        &self,
        change: ClientSessionChange,
        error: Option<&str>,
    ) -> Result<Option<SharedCaller>, CallError> {
        if !self.shared.recovery.can_resolve_invalidation() {
            self.set_new_session(change, error);
            return Ok(None);
        }
        // Anonymous sessions are never re-authenticated, nor is their
        // invalidation recorded.
        if !self.session.logged_in() {
            return Ok(None);
        }

        let keyserver_id = &self.session.keyserver_id;
        let no_progress: InProgressSetter = Arc::new(|_| {});
        let cancel = CancelFlag::new();
        self.shared
            .coordinator
            .run(keyserver_id, async {
                let recovered = self
                    .shared
                    .recovery
                    .recovery_log_in(
                        keyserver_id,
                        RecoveryActionSource::CookieInvalidationResolutionAttempt,
                        change.cookie().map(str::to_string),
                        no_progress,
                        &cancel,
                    )
                    .await?;
                Ok(recovered.map(|new_change| self.shared.bind(self.rebound(&new_change))))
            })
            .await
    }
}

#[cfg(test)]
#[path = "tests/provider_tests.rs"]
mod tests;
